//! # Models
//!
//! - [`record`] - Field accessor tables, [`Record`] identity/snapshot tracking and hydration
//! - [`queue_job`] - The queued work item persisted in `queue_jobs`

pub mod queue_job;
pub mod record;

pub use queue_job::QueueJob;
pub use record::{Entity, FieldAccessor, Getter, Record, RecordDescriptor, Setter};
