//! Query history persistence.
//!
//! QueryRecords are append-only: the orchestrator writes exactly one per
//! successful query, and nothing for a failed one. Listing is scoped to
//! the owning user, optionally narrowed by course or conversation, newest
//! first. Deletion requires ownership; a missing or foreign record reports
//! not-found so record ids leak nothing.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::RwLock;

use crate::error::PipelineError;
use crate::models::{QueryRecord, Turn};

/// Filters for listing a user's history.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub course_id: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one completed query record.
    async fn append(&self, record: &QueryRecord) -> Result<(), PipelineError>;

    /// List the user's records, newest first.
    async fn list(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<QueryRecord>, PipelineError>;

    /// Distinct conversation ids for the user, newest first.
    async fn conversations(&self, user_id: &str) -> Result<Vec<String>, PipelineError>;

    /// Delete one record owned by the user.
    async fn delete(&self, user_id: &str, query_id: &str) -> Result<(), PipelineError>;

    /// The last `limit` turns of a conversation, oldest first, for prompt
    /// history injection.
    async fn recent_turns(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, PipelineError>;
}

// ============ SQLite ============

pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueryRecord, PipelineError> {
    let citations_json: String = row.get("citations");
    let citations: Vec<String> =
        serde_json::from_str(&citations_json).map_err(PipelineError::persistence)?;
    Ok(QueryRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        course_id: row.get("course_id"),
        question: row.get("question"),
        answer: row.get("answer"),
        citations,
        conversation_id: row.get("conversation_id"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, record: &QueryRecord) -> Result<(), PipelineError> {
        let citations =
            serde_json::to_string(&record.citations).map_err(PipelineError::persistence)?;
        sqlx::query(
            r#"
            INSERT INTO query_history
                (id, user_id, course_id, question, answer, citations, conversation_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.course_id)
        .bind(&record.question)
        .bind(&record.answer)
        .bind(citations)
        .bind(&record.conversation_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;
        Ok(())
    }

    async fn list(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<QueryRecord>, PipelineError> {
        // Newest first; id breaks timestamp ties deterministically.
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, course_id, question, answer, citations, conversation_id, created_at
            FROM query_history
            WHERE user_id = ?
              AND (? IS NULL OR course_id = ?)
              AND (? IS NULL OR conversation_id = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(&filter.course_id)
        .bind(&filter.course_id)
        .bind(&filter.conversation_id)
        .bind(&filter.conversation_id)
        .bind(if filter.limit > 0 { filter.limit } else { 50 })
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn conversations(&self, user_id: &str) -> Result<Vec<String>, PipelineError> {
        let rows = sqlx::query_scalar(
            r#"
            SELECT conversation_id
            FROM query_history
            WHERE user_id = ?
            GROUP BY conversation_id
            ORDER BY MAX(created_at) DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;
        Ok(rows)
    }

    async fn delete(&self, user_id: &str, query_id: &str) -> Result<(), PipelineError> {
        let result = sqlx::query("DELETE FROM query_history WHERE id = ? AND user_id = ?")
            .bind(query_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::persistence)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::RecordNotFound(query_id.to_string()));
        }
        Ok(())
    }

    async fn recent_turns(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT question, answer
            FROM query_history
            WHERE user_id = ? AND conversation_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;

        let mut turns: Vec<Turn> = rows
            .iter()
            .map(|row| Turn {
                question: row.get("question"),
                answer: row.get("answer"),
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }
}

// ============ In-memory ============

/// In-memory history for tests.
#[derive(Default)]
pub struct MemoryHistory {
    records: RwLock<Vec<QueryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, in insertion order. Test helper.
    pub fn records(&self) -> Vec<QueryRecord> {
        self.records.read().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, record: &QueryRecord) -> Result<(), PipelineError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| PipelineError::persistence(e.to_string()))?;
        records.push(record.clone());
        Ok(())
    }

    async fn list(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<QueryRecord>, PipelineError> {
        let records = self
            .records
            .read()
            .map_err(|e| PipelineError::persistence(e.to_string()))?;
        let mut matched: Vec<QueryRecord> = records
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter(|r| {
                filter
                    .course_id
                    .as_ref()
                    .is_none_or(|course| &r.course_id == course)
            })
            .filter(|r| {
                filter
                    .conversation_id
                    .as_ref()
                    .is_none_or(|conv| &r.conversation_id == conv)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit > 0 {
            filter.limit as usize
        } else {
            50
        };
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn conversations(&self, user_id: &str) -> Result<Vec<String>, PipelineError> {
        let records = self
            .records
            .read()
            .map_err(|e| PipelineError::persistence(e.to_string()))?;
        let mut seen = Vec::new();
        let mut sorted: Vec<&QueryRecord> =
            records.iter().filter(|r| r.user_id == user_id).collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for record in sorted {
            if !seen.contains(&record.conversation_id) {
                seen.push(record.conversation_id.clone());
            }
        }
        Ok(seen)
    }

    async fn delete(&self, user_id: &str, query_id: &str) -> Result<(), PipelineError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| PipelineError::persistence(e.to_string()))?;
        let before = records.len();
        records.retain(|r| !(r.id == query_id && r.user_id == user_id));
        if records.len() == before {
            return Err(PipelineError::RecordNotFound(query_id.to_string()));
        }
        Ok(())
    }

    async fn recent_turns(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, PipelineError> {
        let records = self
            .records
            .read()
            .map_err(|e| PipelineError::persistence(e.to_string()))?;
        let mut matched: Vec<&QueryRecord> = records
            .iter()
            .filter(|r| r.user_id == user_id && r.conversation_id == conversation_id)
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let mut turns: Vec<Turn> = matched
            .into_iter()
            .take(limit)
            .map(|r| Turn {
                question: r.question.clone(),
                answer: r.answer.clone(),
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, user: &str, conv: &str, created_at: i64) -> QueryRecord {
        QueryRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            course_id: "db101".to_string(),
            question: format!("question {id}"),
            answer: format!("answer {id}"),
            citations: vec!["chunk-1".to_string()],
            conversation_id: conv.to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_user_and_newest_first() {
        let store = MemoryHistory::new();
        store.append(&record("q1", "alice", "conv-a", 100)).await.unwrap();
        store.append(&record("q2", "alice", "conv-a", 200)).await.unwrap();
        store.append(&record("q3", "bob", "conv-b", 300)).await.unwrap();

        let listed = store
            .list("alice", &HistoryFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["q2", "q1"]);
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let store = MemoryHistory::new();
        store.append(&record("q1", "alice", "conv-a", 100)).await.unwrap();

        let err = store.delete("bob", "q1").await.unwrap_err();
        assert!(matches!(err, PipelineError::RecordNotFound(_)));
        assert_eq!(store.records().len(), 1);

        store.delete("alice", "q1").await.unwrap();
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_recent_turns_oldest_first_and_limited() {
        let store = MemoryHistory::new();
        for i in 0..4 {
            store
                .append(&record(&format!("q{i}"), "alice", "conv-a", i))
                .await
                .unwrap();
        }
        let turns = store.recent_turns("alice", "conv-a", 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question, "question q2");
        assert_eq!(turns[1].question, "question q3");
    }

    #[tokio::test]
    async fn test_conversations_distinct_newest_first() {
        let store = MemoryHistory::new();
        store.append(&record("q1", "alice", "conv-a", 100)).await.unwrap();
        store.append(&record("q2", "alice", "conv-b", 200)).await.unwrap();
        store.append(&record("q3", "alice", "conv-a", 300)).await.unwrap();

        let conversations = store.conversations("alice").await.unwrap();
        assert_eq!(conversations, vec!["conv-a", "conv-b"]);
    }
}
