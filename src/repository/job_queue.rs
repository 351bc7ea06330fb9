//! # Job Queue Repository
//!
//! Atomic reservation of queued jobs for competing workers.
//!
//! ## Job states
//!
//! | State | Row shape |
//! |---|---|
//! | Available | `reserved_at IS NULL`, `completed_at IS NULL`, `attempts < max_attempts` |
//! | Reserved | `reserved_at` within the reservation timeout |
//! | Stale-reserved | `reserved_at` older than the timeout (worker presumed dead) |
//! | Completed | `completed_at` set |
//! | Dead-lettered | `failed_at` set, queue renamed to `"{queue}-failed"` |
//!
//! Reservation runs in a transaction and selects the oldest eligible row with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers never receive the same job. Stale
//! reservations are eligible regardless of their attempt count; a recovered job whose
//! attempts then exceed `max_attempts` is dead-lettered instead of returned.

use super::Repository;
use crate::constants::{dead_letter_queue, queue as defaults};
use crate::database::Connection;
use crate::error::{KeelError, Result};
use crate::models::{QueueJob, Record};
use crate::utils::clock::{Clock, SystemClock};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Options for [`JobQueueRepository::push`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Seconds before the job becomes available
    pub delay: Duration,
    /// Overrides the repository default
    pub max_attempts: Option<i64>,
}

impl PushOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

fn seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct JobQueueRepository {
    jobs: Repository<QueueJob>,
    clock: Arc<dyn Clock>,
    default_max_attempts: i64,
}

impl JobQueueRepository {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self::with_clock(connection, Arc::new(SystemClock))
    }

    pub fn with_clock(connection: Arc<dyn Connection>, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Repository::new(connection),
            clock,
            default_max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: i64) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// The underlying record repository
    pub fn jobs(&self) -> &Repository<QueueJob> {
        &self.jobs
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Reserve the oldest eligible job on `queue`, or `None` when nothing is eligible.
    ///
    /// Any failure inside the transaction rolls it back and surfaces as
    /// [`KeelError::TransactionFailure`].
    #[instrument(skip(self))]
    pub async fn reserve_next(
        &self,
        queue: &str,
        reservation_timeout: Duration,
    ) -> Result<Option<Record<QueueJob>>> {
        let connection = self.jobs.connection();
        connection
            .begin()
            .await
            .map_err(|e| KeelError::transaction_failure("reserve_next", e))?;

        match self.reserve_locked(queue, reservation_timeout).await {
            Ok(job) => {
                connection
                    .commit()
                    .await
                    .map_err(|e| KeelError::transaction_failure("reserve_next", e))?;
                Ok(job)
            }
            Err(cause) => {
                warn!(error = %cause, "Reservation failed; rolling back");
                if let Err(rollback_error) = connection.rollback().await {
                    error!(error = %rollback_error, "Rollback after failed reservation also failed");
                }
                Err(KeelError::transaction_failure("reserve_next", cause))
            }
        }
    }

    async fn reserve_locked(
        &self,
        queue: &str,
        reservation_timeout: Duration,
    ) -> Result<Option<Record<QueueJob>>> {
        let now = self.clock.now();
        let stale_before = now.saturating_sub(seconds(reservation_timeout));

        let filter = json!({
            "queue_name": queue,
            "available_at": ["<=", now],
            "completed_at": null,
            "OR": [
                {"reserved_at": null, "attempts": ["<", {"column": "max_attempts"}]},
                {"reserved_at": ["<", stale_before]}
            ]
        });

        let candidate = self
            .jobs
            .query(&filter)?
            .order_asc("available_at")
            .order_asc("id")
            .lock_for_update(true)
            .first()
            .await?;

        let Some(mut job) = candidate else {
            debug!("No eligible job");
            return Ok(None);
        };

        let stale = job.reserved_at.is_some();
        job.attempts += 1;

        if stale && job.attempts > job.max_attempts {
            job.failed_at = Some(now);
            job.queue_name = dead_letter_queue(queue);
            self.jobs.save(&mut job).await?;
            warn!(
                job_id = job.id(),
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                dead_letter_queue = %job.queue_name,
                "Stale job exhausted its attempts; moved to dead-letter queue"
            );
            return Ok(None);
        }

        if stale {
            job.error = None;
            info!(job_id = job.id(), attempts = job.attempts, "Recovered stale reservation");
        }

        job.reserved_at = Some(now);
        self.jobs.save(&mut job).await?;

        info!(job_id = job.id(), attempts = job.attempts, "Reserved job");
        Ok(Some(job))
    }

    /// Jobs on `queue` that are not completed and still have attempts left
    pub async fn count_jobs_in_queue(&self, queue: &str) -> Result<u64> {
        self.jobs
            .count(&json!({
                "queue_name": queue,
                "attempts": ["<", {"column": "max_attempts"}],
                "completed_at": null
            }))
            .await
    }

    /// Delete every row on `queue`
    #[instrument(skip(self))]
    pub async fn clear_queue(&self, queue: &str) -> Result<u64> {
        let removed = self
            .jobs
            .query(&json!({"queue_name": queue}))?
            .delete()
            .await?;
        info!(removed, "Cleared queue");
        Ok(removed)
    }

    /// Enqueue a job
    #[instrument(skip(self, payload))]
    pub async fn push(
        &self,
        queue: &str,
        payload: &Value,
        options: PushOptions,
    ) -> Result<Record<QueueJob>> {
        let max_attempts = options.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts < 1 {
            return Err(KeelError::InvalidInput(format!(
                "max_attempts must be at least 1, got {max_attempts}"
            )));
        }

        let available_at = self.clock.now().saturating_add(seconds(options.delay));
        let mut job = Record::new(QueueJob::new(queue, payload, max_attempts, available_at));
        self.jobs.save(&mut job).await?;

        debug!(job_id = job.id(), available_at, "Pushed job");
        Ok(job)
    }

    pub async fn find(&self, id: i64) -> Result<Option<Record<QueueJob>>> {
        self.jobs.find_by_id(id).await
    }

    /// Record successful completion
    pub async fn mark_completed(&self, job: &mut Record<QueueJob>) -> Result<()> {
        job.completed_at = Some(self.clock.now());
        job.error = None;
        self.jobs.save(job).await?;
        debug!(job_id = job.id(), "Job completed");
        Ok(())
    }

    /// Hand a failed job back to the queue after `delay`. Returns `false` when the job had no
    /// attempts left and was dead-lettered instead.
    pub async fn release(
        &self,
        job: &mut Record<QueueJob>,
        error: &str,
        delay: Duration,
    ) -> Result<bool> {
        if !job.has_attempts_remaining() {
            self.bury(job, error).await?;
            return Ok(false);
        }

        job.error = Some(error.to_string());
        job.reserved_at = None;
        job.available_at = self.clock.now().saturating_add(seconds(delay));
        self.jobs.save(job).await?;

        debug!(job_id = job.id(), attempts = job.attempts, "Released job for retry");
        Ok(true)
    }

    /// Move a job to its queue's dead-letter queue
    pub async fn bury(&self, job: &mut Record<QueueJob>, error: &str) -> Result<()> {
        let original_queue = job.queue_name.clone();
        job.error = Some(error.to_string());
        job.failed_at = Some(self.clock.now());
        job.reserved_at = None;
        job.queue_name = dead_letter_queue(&original_queue);
        self.jobs.save(job).await?;

        warn!(
            job_id = job.id(),
            queue = %original_queue,
            dead_letter_queue = %job.queue_name,
            "Job moved to dead-letter queue"
        );
        Ok(())
    }

    /// Move every dead-lettered job of `queue` back with a fresh attempt budget
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, queue: &str) -> Result<u64> {
        let mut values = IndexMap::new();
        values.insert("queue_name".to_string(), Value::from(queue));
        values.insert("attempts".to_string(), Value::from(0));
        values.insert("available_at".to_string(), Value::from(self.clock.now()));
        values.insert("reserved_at".to_string(), Value::Null);
        values.insert("failed_at".to_string(), Value::Null);
        values.insert("error".to_string(), Value::Null);

        let moved = self
            .jobs
            .query(&json!({"queue_name": dead_letter_queue(queue)}))?
            .update(&values)
            .await?;
        info!(moved, "Requeued dead-lettered jobs");
        Ok(moved)
    }
}
