//! # Lectern CLI
//!
//! The `lectern` binary drives the course-material query service: database
//! initialization, course/enrollment seeding, material ingestion, one-off
//! queries, history inspection, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! lectern --config ./config/lectern.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lectern init` | Create the SQLite database and run schema migrations |
//! | `lectern course add <id> <title>` | Create or rename a course |
//! | `lectern course enroll <course> <user>` | Enroll a user in a course |
//! | `lectern ingest <dir> --course <id>` | Chunk, embed, and index a directory of material |
//! | `lectern query "<question>" --course <id> --user <id>` | Run one query through the pipeline |
//! | `lectern history --user <id>` | List a user's query records |
//! | `lectern serve` | Start the HTTP server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use lectern::config::load_config;
use lectern::courses::SqliteEnrollments;
use lectern::embedding::create_embedder;
use lectern::history::{HistoryFilter, HistoryStore, SqliteHistory};
use lectern::ingest::ingest_directory;
use lectern::pipeline::{build_app, QueryRequest};
use lectern::store::SqliteVectorStore;
use lectern::{db, migrate, server};

/// Lectern — a retrieval-augmented query service for course materials.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lectern.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lectern",
    about = "Lectern — a retrieval-augmented query service for course materials",
    version,
    long_about = "Lectern ingests extracted course documents, chunks and embeds them, and \
    answers course-scoped questions by retrieving relevant chunks, assembling a bounded \
    context, and calling a configurable LLM provider, persisting each answered query to \
    the asking user's history."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lectern.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (chunks,
    /// chunk_vectors, courses, enrollments, query_history). Idempotent.
    Init,

    /// Manage courses and enrollments.
    Course {
        #[command(subcommand)]
        command: CourseCommands,
    },

    /// Ingest a directory of extracted course material.
    ///
    /// Walks the directory for matching files (`.md`, `.txt` by default),
    /// chunks each, embeds the chunks, and indexes them under the course.
    /// Re-ingesting replaces each document's previous chunks.
    Ingest {
        /// Directory containing extracted material.
        dir: PathBuf,

        /// Course the material belongs to.
        #[arg(long)]
        course: String,
    },

    /// Run one query through the pipeline and print the answer.
    Query {
        /// The question to answer.
        question: String,

        /// Course scope for retrieval.
        #[arg(long)]
        course: String,

        /// The asking user (must be enrolled in the course).
        #[arg(long)]
        user: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,
    },

    /// List a user's query history.
    History {
        #[arg(long)]
        user: String,

        /// Filter by course.
        #[arg(long)]
        course: Option<String>,

        /// Filter by conversation.
        #[arg(long)]
        conversation: Option<String>,

        /// Maximum number of records.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum CourseCommands {
    /// Create a course, or update its title if it exists.
    Add {
        /// Course identifier (e.g. `db101`).
        id: String,
        /// Display title.
        title: String,
    },

    /// Enroll a user in a course.
    Enroll {
        /// Course identifier.
        course_id: String,
        /// User identifier.
        user_id: String,
    },

    /// List courses and their enrolled users.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lectern=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("ok: database initialized at {}", config.db.path.display());
        }

        Commands::Course { command } => {
            let pool = db::connect(&config).await?;
            let enrollments = SqliteEnrollments::new(pool.clone());
            match command {
                CourseCommands::Add { id, title } => {
                    enrollments.upsert_course(&id, &title).await?;
                    println!("ok: course {id}");
                }
                CourseCommands::Enroll { course_id, user_id } => {
                    enrollments.enroll(&user_id, &course_id).await?;
                    println!("ok: {user_id} enrolled in {course_id}");
                }
                CourseCommands::List => {
                    let scopes = enrollments.scopes().await?;
                    if scopes.is_empty() {
                        println!("No courses.");
                    }
                    for scope in scopes {
                        println!("{} ({} enrolled)", scope.course_id, scope.user_ids.len());
                        for user in scope.user_ids {
                            println!("    {user}");
                        }
                    }
                }
            }
            pool.close().await;
        }

        Commands::Ingest { dir, course } => {
            let pool = db::connect(&config).await?;
            let embedder = create_embedder(&config.embedding)?;
            let store = Arc::new(SqliteVectorStore::new(pool.clone()));
            let report = ingest_directory(&config, store, embedder, &course, &dir).await?;
            println!("ingest {}", dir.display());
            println!("  documents: {}", report.documents);
            println!("  chunks written: {}", report.chunks);
            if report.skipped > 0 {
                println!("  skipped: {}", report.skipped);
            }
            println!("ok");
            pool.close().await;
        }

        Commands::Query {
            question,
            course,
            user,
            conversation,
        } => {
            let pool = db::connect(&config).await?;
            let app = build_app(&config, pool.clone())?;
            let response = app
                .pipeline
                .run(QueryRequest {
                    user_id: user,
                    course_id: course,
                    question,
                    conversation_id: conversation,
                })
                .await?;

            println!("{}", response.answer);
            println!();
            println!("conversation: {}", response.conversation_id);
            for (i, citation) in response.citations.iter().enumerate() {
                println!("  [{}] chunk {}", i + 1, citation);
            }
            pool.close().await;
        }

        Commands::History {
            user,
            course,
            conversation,
            limit,
        } => {
            let pool = db::connect(&config).await?;
            let history = SqliteHistory::new(pool.clone());
            let records = history
                .list(
                    &user,
                    &HistoryFilter {
                        course_id: course,
                        conversation_id: conversation,
                        limit,
                        offset: 0,
                    },
                )
                .await?;

            if records.is_empty() {
                println!("No records.");
            }
            for record in records {
                let date = chrono::DateTime::from_timestamp(record.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{} [{}] {}", date, record.course_id, record.question);
                println!("    {}", record.answer.replace('\n', " "));
                println!("    id: {}  conversation: {}", record.id, record.conversation_id);
                println!();
            }
            pool.close().await;
        }

        Commands::Serve => {
            let pool = db::connect(&config).await?;
            let app = build_app(&config, pool)?;
            server::run_server(&config, app).await?;
        }
    }

    Ok(())
}
