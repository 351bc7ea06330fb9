use crate::constants::QUEUE_JOBS_TABLE;
use crate::database::value::decode;
use crate::error::Result;
use crate::models::record::{Entity, RecordDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// QueueJob is one unit of queued work
/// Maps to the `queue_jobs` table; timestamps are epoch seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub queue_name: String,
    /// JSON document handed to the job handler
    pub payload: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub available_at: i64,
    pub reserved_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub error: Option<String>,
    /// Filled by the database on insert
    pub created_at: Option<String>,
}

fn nullable_int(value: Option<i64>) -> Option<Value> {
    Some(value.map_or(Value::Null, Value::from))
}

impl Entity for QueueJob {
    fn descriptor() -> &'static RecordDescriptor<Self> {
        static DESCRIPTOR: OnceLock<RecordDescriptor<QueueJob>> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            RecordDescriptor::<QueueJob>::new(QUEUE_JOBS_TABLE, "QueueJob")
                .field(
                    "queue_name",
                    |j| Some(Value::from(j.queue_name.clone())),
                    |j, v| {
                        j.queue_name = decode::text("queue_name", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "payload",
                    |j| Some(Value::from(j.payload.clone())),
                    |j, v| {
                        j.payload = decode::text("payload", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "attempts",
                    |j| Some(Value::from(j.attempts)),
                    |j, v| {
                        j.attempts = decode::int("attempts", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "max_attempts",
                    |j| Some(Value::from(j.max_attempts)),
                    |j, v| {
                        j.max_attempts = decode::int("max_attempts", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "available_at",
                    |j| Some(Value::from(j.available_at)),
                    |j, v| {
                        j.available_at = decode::int("available_at", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "reserved_at",
                    |j| nullable_int(j.reserved_at),
                    |j, v| {
                        j.reserved_at = decode::int("reserved_at", v)?;
                        Ok(())
                    },
                )
                .field(
                    "completed_at",
                    |j| nullable_int(j.completed_at),
                    |j, v| {
                        j.completed_at = decode::int("completed_at", v)?;
                        Ok(())
                    },
                )
                .field(
                    "failed_at",
                    |j| nullable_int(j.failed_at),
                    |j, v| {
                        j.failed_at = decode::int("failed_at", v)?;
                        Ok(())
                    },
                )
                .field(
                    "error",
                    |j| Some(j.error.clone().map_or(Value::Null, Value::from)),
                    |j, v| {
                        j.error = decode::text("error", v)?;
                        Ok(())
                    },
                )
                .generated(
                    "created_at",
                    |j| j.created_at.clone().map(Value::from),
                    |j, v| {
                        j.created_at = decode::text("created_at", v)?;
                        Ok(())
                    },
                )
        })
    }
}

impl QueueJob {
    /// New job for `queue`, available at `available_at`
    pub fn new(queue: &str, payload: &Value, max_attempts: i64, available_at: i64) -> Self {
        Self {
            queue_name: queue.to_string(),
            payload: payload.to_string(),
            max_attempts,
            available_at,
            ..Default::default()
        }
    }

    /// Decode the payload document
    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some() && self.completed_at.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Reserved longer ago than `timeout` seconds at time `now`
    pub fn is_stale(&self, now: i64, timeout: i64) -> bool {
        match (self.reserved_at, self.completed_at) {
            (Some(reserved_at), None) => reserved_at < now - timeout,
            _ => false,
        }
    }
}
