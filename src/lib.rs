#![allow(clippy::doc_markdown)] // Allow technical terms like MySQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Keel Core
//!
//! Persistence core for record repositories and a database-backed job queue.
//!
//! ## Overview
//!
//! - A **filter DSL compiler** turning nested JSON key/operator/value trees into
//!   parameterized MySQL fragments. Every literal becomes a bound `?` parameter.
//! - A **repository** mapping typed records onto tables through a static accessor table,
//!   with hydration and **dirty-field tracking** so saves write only what changed.
//! - An **atomic job reservation** algorithm built on `SELECT … FOR UPDATE SKIP LOCKED`,
//!   with stale-reservation recovery and a dead-letter queue.
//!
//! ## Module Organization
//!
//! - [`query_builder`] - Filter expressions, DSL parsing, statement compilation, pagination
//! - [`database`] - The [`Connection`](database::Connection) trait, MySQL sessions, and an
//!   in-memory engine
//! - [`models`] - Records, descriptors and the [`QueueJob`](models::QueueJob) entity
//! - [`repository`] - CRUD, repository-bound queries and the job queue
//! - [`worker`] - A polling worker loop over the job queue
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust
//! use keel_core::database::MemoryDatabase;
//! use keel_core::repository::{JobQueueRepository, PushOptions};
//! use keel_core::test_utils::install_queue_jobs_table;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let db = MemoryDatabase::new();
//! install_queue_jobs_table(&db);
//! let queue = JobQueueRepository::new(Arc::new(db.connect()));
//!
//! queue.push("mail", &json!({"to": "ops@example.com"}), PushOptions::default()).await.unwrap();
//! let job = queue.reserve_next("mail", Duration::from_secs(60)).await.unwrap();
//! assert_eq!(job.map(|j| j.attempts), Some(1));
//! # });
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod query_builder;
pub mod repository;
pub mod test_utils;
pub mod utils;
pub mod worker;

pub use config::{ConfigManager, DatabaseConfig, KeelConfig, QueueConfig, WorkerConfig};
pub use database::{Connection, DatabaseConnection, MemoryDatabase};
pub use error::{KeelError, Result};
pub use models::{Entity, QueueJob, Record, RecordDescriptor};
pub use query_builder::{compile_filter, Condition, QueryBuilder, SqlFragment};
pub use repository::{JobQueueRepository, PushOptions, Query, Repository};
pub use worker::{JobHandler, Worker, WorkerOptions, WorkerSummary};
