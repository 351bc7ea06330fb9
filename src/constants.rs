//! # System Constants
//!
//! Names and defaults shared by the repository, the job queue and the worker loop.

/// Table backing [`QueueJob`](crate::models::QueueJob)
pub const QUEUE_JOBS_TABLE: &str = "queue_jobs";

/// Suffix appended to a queue name when a job is dead-lettered
pub const DEAD_LETTER_SUFFIX: &str = "-failed";

/// Primary key column every record table carries
pub const ID_COLUMN: &str = "id";

/// Queue job defaults, used when configuration leaves a value unset
pub mod queue {
    pub const DEFAULT_QUEUE: &str = "default";
    pub const DEFAULT_RESERVATION_TIMEOUT_SECONDS: u64 = 60;
    pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
    pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 10;
}

/// Worker loop defaults
pub mod worker {
    pub const DEFAULT_IDLE_SLEEP_MS: u64 = 1_000;
    pub const DEFAULT_MAX_RUNTIME_SECONDS: u64 = 3_600;
    pub const DEFAULT_MAX_JOBS: u64 = 0;
}

/// Dead-letter queue name for `queue`
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}
