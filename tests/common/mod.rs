//! Shared fixtures for the integration tests: a `Widget` entity over an in-memory
//! `widgets` table and queue fixtures driven by a manual clock.

#![allow(dead_code)]

pub mod strategies;

use keel_core::database::value::decode;
use keel_core::database::{MemoryConnection, MemoryDatabase};
use keel_core::models::{Entity, Record, RecordDescriptor};
use keel_core::repository::{JobQueueRepository, Repository};
use keel_core::test_utils::install_queue_jobs_table;
use keel_core::utils::ManualClock;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

pub const WIDGET_CREATED_AT: &str = "2026-02-03 04:05:06";
pub const QUEUE_START: i64 = 1_000_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Widget {
    pub name: Option<String>,
    pub score: i64,
    pub active: bool,
    pub category: Option<String>,
    pub created_at: Option<String>,
}

impl Entity for Widget {
    fn descriptor() -> &'static RecordDescriptor<Self> {
        static DESCRIPTOR: OnceLock<RecordDescriptor<Widget>> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            RecordDescriptor::<Widget>::new("widgets", "Widget")
                .field(
                    "name",
                    |w| w.name.clone().map(Value::from),
                    |w, v| {
                        w.name = decode::text("name", v)?;
                        Ok(())
                    },
                )
                .field(
                    "score",
                    |w| Some(Value::from(w.score)),
                    |w, v| {
                        w.score = decode::int("score", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "active",
                    |w| Some(Value::from(w.active)),
                    |w, v| {
                        w.active = decode::boolean("active", v)?.unwrap_or_default();
                        Ok(())
                    },
                )
                .field(
                    "category",
                    |w| w.category.clone().map(Value::from),
                    |w, v| {
                        w.category = decode::text("category", v)?;
                        Ok(())
                    },
                )
                .generated(
                    "created_at",
                    |w| w.created_at.clone().map(Value::from),
                    |w, v| {
                        w.created_at = decode::text("created_at", v)?;
                        Ok(())
                    },
                )
        })
    }
}

impl Widget {
    pub fn named(name: &str, score: i64) -> Self {
        Self {
            name: Some(name.to_string()),
            score,
            active: true,
            ..Default::default()
        }
    }
}

pub fn widget_db() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(
        "widgets",
        &[
            ("name", Value::Null),
            ("score", Value::from(0)),
            ("active", Value::from(1)),
            ("category", Value::from("general")),
            ("created_at", Value::from(WIDGET_CREATED_AT)),
        ],
    );
    db
}

/// Repository plus the concrete connection for statement inspection
pub fn widget_repo(db: &MemoryDatabase) -> (Repository<Widget>, Arc<MemoryConnection>) {
    let connection = Arc::new(db.connect());
    (Repository::new(connection.clone()), connection)
}

/// Insert `widget-1 .. widget-n` with scores 1..=n; odd ids are active
pub async fn seed_widgets(repo: &Repository<Widget>, count: i64) -> Vec<Record<Widget>> {
    let mut saved = Vec::new();
    for i in 1..=count {
        let mut widget = repo.create_record(Widget {
            active: i % 2 == 1,
            ..Widget::named(&format!("widget-{i}"), i)
        });
        repo.save(&mut widget).await.expect("seed widget");
        saved.push(widget);
    }
    saved
}

pub struct QueueFixture {
    pub db: MemoryDatabase,
    pub clock: Arc<ManualClock>,
}

impl QueueFixture {
    pub fn new() -> Self {
        let db = MemoryDatabase::new();
        install_queue_jobs_table(&db);
        Self {
            db,
            clock: Arc::new(ManualClock::new(QUEUE_START)),
        }
    }

    /// A queue repository on its own session
    pub fn queue(&self) -> JobQueueRepository {
        JobQueueRepository::with_clock(Arc::new(self.db.connect()), self.clock.clone())
    }

    /// A queue repository plus its session, for transaction control and fault injection
    pub fn queue_with_connection(&self) -> (JobQueueRepository, Arc<MemoryConnection>) {
        let connection = Arc::new(self.db.connect());
        (
            JobQueueRepository::with_clock(connection.clone(), self.clock.clone()),
            connection,
        )
    }
}
