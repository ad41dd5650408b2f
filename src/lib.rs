//! # Lectern
//!
//! A retrieval-augmented query service for course materials.
//!
//! Lectern ingests extracted course documents, chunks and embeds them, and
//! answers course-scoped student questions by retrieving relevant chunks,
//! assembling a token-bounded context, and calling a configurable LLM
//! provider. Every answered query is persisted to the asking user's
//! history with citations back to the grounding chunks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │  Ingest   │──▶│ Chunk+Embed  │──▶│  SQLite    │
//! │ (md/txt) │   │   pipeline   │   │ vectors    │
//! └──────────┘   └──────────────┘   └─────┬─────┘
//!                                         │
//!            ┌──────────┐   ┌──────────┐  │
//!  question ▶│ Retrieve │──▶│ Assemble │◀─┘
//!            └────┬─────┘   └────┬─────┘
//!                 │              ▼
//!                 │        ┌──────────┐   ┌──────────┐
//!                 └───────▶│ Generate │──▶│ History  │
//!                          │  (LLM)   │   │ (SQLite) │
//!                          └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lectern init                                   # create database
//! lectern course add db101 "Databases 101"
//! lectern course enroll db101 alice
//! lectern ingest ./materials/db101 --course db101
//! lectern query "What is a B-tree?" --course db101 --user alice
//! lectern serve                                  # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed pipeline error taxonomy |
//! | [`chunker`] | Boundary-aware text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store abstraction |
//! | [`retriever`] | Scoped similarity retrieval |
//! | [`context`] | Token-budgeted context assembly |
//! | [`generation`] | LLM provider abstraction |
//! | [`pipeline`] | Query orchestration |
//! | [`ingest`] | Document ingestion pipeline |
//! | [`history`] | Query history persistence |
//! | [`courses`] | Course and enrollment access |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunker;
pub mod config;
pub mod context;
pub mod courses;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod history;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod retriever;
pub mod retry;
pub mod server;
pub mod store;
