//! Course and enrollment access.
//!
//! Enrollment is owned by the course entity upstream; the pipeline only
//! needs the read side to enforce course scope before retrieval. The write
//! operations exist for the CLI so a deployment can seed courses and
//! enrollments without a separate admin surface.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::PipelineError;
use crate::models::CourseScope;

/// Read-only enrollment checks used by the query orchestrator.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Whether `user_id` may query `course_id`.
    async fn is_enrolled(&self, user_id: &str, course_id: &str) -> Result<bool, PipelineError>;
}

// ============ SQLite ============

pub struct SqliteEnrollments {
    pool: SqlitePool,
}

impl SqliteEnrollments {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a course if it does not exist, or update its title.
    pub async fn upsert_course(&self, course_id: &str, title: &str) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO courses (id, title, created_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET title = excluded.title
            "#,
        )
        .bind(course_id)
        .bind(title)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;
        Ok(())
    }

    /// Enroll a user in a course. Enrolling twice is a no-op.
    pub async fn enroll(&self, user_id: &str, course_id: &str) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO enrollments (user_id, course_id, created_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id, course_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;
        Ok(())
    }

    /// List all courses with their enrolled users.
    pub async fn scopes(&self) -> Result<Vec<CourseScope>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, e.user_id
            FROM courses c
            LEFT JOIN enrollments e ON e.course_id = c.id
            ORDER BY c.id, e.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;

        let mut scopes: Vec<CourseScope> = Vec::new();
        for row in rows {
            let course_id: String = row.get("id");
            let user_id: Option<String> = row.get("user_id");
            match scopes.last_mut() {
                Some(scope) if scope.course_id == course_id => {
                    if let Some(user) = user_id {
                        scope.user_ids.push(user);
                    }
                }
                _ => scopes.push(CourseScope {
                    course_id,
                    user_ids: user_id.into_iter().collect(),
                }),
            }
        }
        Ok(scopes)
    }
}

#[async_trait]
impl EnrollmentStore for SqliteEnrollments {
    async fn is_enrolled(&self, user_id: &str, course_id: &str) -> Result<bool, PipelineError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM enrollments WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::persistence)?;
        Ok(found.is_some())
    }
}

// ============ In-memory ============

/// In-memory enrollment set for tests.
#[derive(Default)]
pub struct MemoryEnrollments {
    enrolled: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryEnrollments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, user_id: &str, course_id: &str) {
        let mut enrolled = self.enrolled.write().unwrap();
        enrolled
            .entry(course_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl EnrollmentStore for MemoryEnrollments {
    async fn is_enrolled(&self, user_id: &str, course_id: &str) -> Result<bool, PipelineError> {
        let enrolled = self
            .enrolled
            .read()
            .map_err(|e| PipelineError::persistence(e.to_string()))?;
        Ok(enrolled
            .get(course_id)
            .is_some_and(|users| users.contains(user_id)))
    }
}
