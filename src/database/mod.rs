//! # Database Operations
//!
//! Connection layer shared by the repository and the job queue.
//!
//! ## Key Components
//!
//! - [`connection`] - The [`Connection`] trait, nested transaction depth tracking, and the
//!   MySQL implementation over a SQLx pool
//! - [`value`] - Value coercion for binding and typed decoding for record setters
//! - [`memory`] - An in-process engine for the emitted SQL subset with row-lock semantics,
//!   used by the test suites
//!
//! ## Dialect
//!
//! Statements use `?` placeholders, backtick-quoted identifiers, `LIMIT offset, count` and
//! `FOR UPDATE [SKIP LOCKED]`. Booleans are always bound as `0`/`1`.

pub mod connection;
pub mod memory;
pub mod value;

pub use connection::{
    Connection, DatabaseConnection, DepthTransition, ExecuteResult, MySqlSession, Row,
    TransactionDepth,
};
pub use memory::{LoggedStatement, MemoryConnection, MemoryDatabase};
