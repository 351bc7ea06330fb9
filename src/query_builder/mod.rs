//! # Query Builder System
//!
//! Filter DSL compilation and SQL statement building for MySQL.
//!
//! ## Key Components
//!
//! - [`conditions`] - The normalized filter expression tree and its compiler
//! - [`dsl`] - Parses the JSON filter mapping into that tree, rejecting malformed shapes
//! - [`builder`] - SELECT / aggregate / UPDATE / DELETE / INSERT compilation
//! - [`pagination`] - `LIMIT offset, count` rendering and page clamping
//!
//! ## Example Usage
//!
//! ```rust
//! use keel_core::query_builder::{compile_filter, QueryBuilder};
//! use serde_json::json;
//!
//! let fragment = compile_filter(&json!({"age": ["BETWEEN", 18, 65]})).unwrap();
//! assert_eq!(fragment.sql, "`age` BETWEEN ? AND ?");
//!
//! let statement = QueryBuilder::new("users")
//!     .where_filter(&json!({"status": "active"}))
//!     .unwrap()
//!     .order_desc("created_at")
//!     .limit(10)
//!     .build_select()
//!     .unwrap();
//! assert_eq!(
//!     statement.sql,
//!     "SELECT * FROM `users` WHERE `status` = ? ORDER BY `created_at` DESC LIMIT 10"
//! );
//! ```
//!
//! Every literal becomes a `?` placeholder; compiled fragments never contain values.

pub mod builder;
pub mod conditions;
pub mod dsl;
pub mod pagination;

pub use builder::{Aggregate, Direction, QueryBuilder, Statement, AGGREGATE_ALIAS};
pub use conditions::{quote_identifier, CompareOp, Condition, SqlFragment};
pub use dsl::{compile_filter, parse_filter};
pub use pagination::{clamp_page, last_page, Paginated, Pagination, UNBOUNDED_LIMIT};
