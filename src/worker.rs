//! # Worker Loop
//!
//! Polls a queue through [`JobQueueRepository::reserve_next`], runs a [`JobHandler`] for
//! each reserved job and records the outcome. Handler failures release the job for retry
//! after the configured delay; jobs out of attempts go to the dead-letter queue.

use crate::config::KeelConfig;
use crate::error::Result;
use crate::logging::{log_error, log_queue_operation};
use crate::models::QueueJob;
use crate::repository::JobQueueRepository;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Executes one job's payload
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub queue: String,
    pub reservation_timeout: Duration,
    /// Stop after this many jobs
    pub max_jobs: Option<u64>,
    /// Stop once this much wall-clock time has passed
    pub max_runtime: Option<Duration>,
    pub idle_sleep: Duration,
    pub retry_delay: Duration,
    /// Stop instead of sleeping when no job is eligible
    pub stop_when_empty: bool,
}

impl WorkerOptions {
    pub fn from_config(config: &KeelConfig) -> Self {
        Self {
            queue: config.queue.default_queue.clone(),
            reservation_timeout: config.queue.reservation_timeout(),
            max_jobs: (config.worker.max_jobs > 0).then_some(config.worker.max_jobs),
            max_runtime: (config.worker.max_runtime_seconds > 0)
                .then(|| Duration::from_secs(config.worker.max_runtime_seconds)),
            idle_sleep: Duration::from_millis(config.worker.idle_sleep_ms),
            retry_delay: config.queue.retry_delay(),
            stop_when_empty: false,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&KeelConfig::default())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxJobs,
    MaxRuntime,
    QueueEmpty,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub stop_reason: StopReason,
}

pub struct Worker<H> {
    id: String,
    queue: JobQueueRepository,
    handler: H,
    options: WorkerOptions,
    stop: Arc<AtomicBool>,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(queue: JobQueueRepository, handler: H, options: WorkerOptions) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            queue,
            handler,
            options,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Flag that ends the loop before its next reservation
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    #[instrument(skip(self), fields(worker_id = %self.id, queue = %self.options.queue))]
    pub async fn run(&self) -> Result<WorkerSummary> {
        let started = Instant::now();
        let mut summary = WorkerSummary {
            worker_id: self.id.clone(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            dead_lettered: 0,
            stop_reason: StopReason::Stopped,
        };

        info!("Worker started");

        summary.stop_reason = loop {
            if self.stop.load(Ordering::SeqCst) {
                break StopReason::Stopped;
            }
            if self.options.max_jobs.is_some_and(|max| summary.processed >= max) {
                break StopReason::MaxJobs;
            }
            if self
                .options
                .max_runtime
                .is_some_and(|max| started.elapsed() >= max)
            {
                break StopReason::MaxRuntime;
            }

            let reserved = self
                .queue
                .reserve_next(&self.options.queue, self.options.reservation_timeout)
                .await?;

            let Some(mut job) = reserved else {
                if self.options.stop_when_empty {
                    break StopReason::QueueEmpty;
                }
                debug!(sleep_ms = millis(self.options.idle_sleep), "Queue idle");
                tokio::time::sleep(self.options.idle_sleep).await;
                continue;
            };

            summary.processed += 1;
            match self.handler.handle(&job).await {
                Ok(()) => {
                    self.queue.mark_completed(&mut job).await?;
                    summary.succeeded += 1;
                    log_queue_operation(
                        "complete",
                        &self.options.queue,
                        job.id(),
                        "succeeded",
                        None,
                    );
                }
                Err(handler_error) => {
                    summary.failed += 1;
                    let message = format!("{handler_error:#}");
                    log_error("worker", "handle", &message, Some(&self.options.queue));

                    let requeued = self
                        .queue
                        .release(&mut job, &message, self.options.retry_delay)
                        .await?;
                    if !requeued {
                        summary.dead_lettered += 1;
                    }
                    log_queue_operation(
                        "release",
                        &self.options.queue,
                        job.id(),
                        if requeued { "retrying" } else { "dead_lettered" },
                        Some(&message),
                    );
                }
            }
        };

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            stop_reason = ?summary.stop_reason,
            "Worker stopped"
        );
        Ok(summary)
    }
}
