//! # Repository
//!
//! Typed CRUD over one entity's table, built on the filter compiler and the
//! [`Connection`] trait.
//!
//! ```rust
//! use keel_core::database::MemoryDatabase;
//! use keel_core::models::QueueJob;
//! use keel_core::repository::Repository;
//! use keel_core::test_utils::install_queue_jobs_table;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let db = MemoryDatabase::new();
//! install_queue_jobs_table(&db);
//! let repo: Repository<QueueJob> = Repository::new(Arc::new(db.connect()));
//!
//! let mut job = repo.create_record(QueueJob::new("mail", &json!({}), 3, 0));
//! repo.save(&mut job).await.unwrap();
//! assert_eq!(repo.count(&json!({"queue_name": "mail"})).await.unwrap(), 1);
//! # });
//! ```

pub mod job_queue;
pub mod query;

pub use job_queue::{JobQueueRepository, PushOptions};
pub use query::Query;

use crate::constants::ID_COLUMN;
use crate::database::{Connection, ExecuteResult, Row};
use crate::error::{KeelError, Result};
use crate::models::{Entity, Record};
use crate::query_builder::{
    compile_filter, Condition, QueryBuilder, SqlFragment, Statement, UNBOUNDED_LIMIT,
};
use indexmap::IndexMap;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// CRUD access to the table behind `E`
pub struct Repository<E> {
    connection: Arc<dyn Connection>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &std::any::type_name::<E>())
            .finish()
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            _entity: PhantomData,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn table(&self) -> &'static str {
        E::descriptor().table
    }

    pub fn entity_name(&self) -> &'static str {
        E::descriptor().entity
    }

    /// Start a query over rows matching `filter`
    pub fn query(&self, filter: &Value) -> Result<Query<E>> {
        let builder = QueryBuilder::new(self.table()).where_filter(filter)?;
        Ok(Query::new(self.clone(), builder))
    }

    /// Expose the filter compiler: `(fragment, params)` for `filter`
    pub fn get_filter_array(&self, filter: &Value) -> Result<SqlFragment> {
        compile_filter(filter)
    }

    /// Wrap a fresh value as a new, unsaved record
    pub fn create_record(&self, data: E) -> Record<E> {
        Record::new(data)
    }

    pub fn hydrate(&self, row: &Row, prefix: Option<&str>) -> Result<Record<E>> {
        Record::hydrate(row, prefix)
    }

    /// The single record matching `filter`, if any
    pub async fn find_one(&self, filter: &Value) -> Result<Option<Record<E>>> {
        let query = self.query(filter)?;
        let mut records = query.clone().limit(2).execute().await?;

        if records.len() > 1 {
            let count = query.count().await?;
            return Err(KeelError::NonUniqueResult {
                entity: self.entity_name().to_string(),
                count: usize::try_from(count).unwrap_or(usize::MAX),
            });
        }
        Ok(records.pop())
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Record<E>>> {
        let statement = QueryBuilder::new(self.table())
            .where_condition(Condition::equals(ID_COLUMN, id))
            .limit(1)
            .build_select()?;

        match self.fetch(&statement).await?.first() {
            Some(row) => Ok(Some(Record::hydrate(row, None)?)),
            None => Ok(None),
        }
    }

    /// Records matching `filter`. `limit = -1` means no limit.
    pub async fn find_many(
        &self,
        offset: u64,
        limit: i64,
        filter: &Value,
        order: &[(&str, &str)],
    ) -> Result<Vec<Record<E>>> {
        let mut query = self.query(filter)?;
        for (field, direction) in order {
            query = query.order_by(field, direction);
        }

        query = match limit {
            -1 if offset > 0 => query.limit(UNBOUNDED_LIMIT).offset(offset),
            -1 => query,
            l if l >= 0 => query.limit(l.unsigned_abs()).offset(offset),
            other => {
                return Err(KeelError::InvalidInput(format!(
                    "limit must be -1 or non-negative, got {other}"
                )))
            }
        };

        query.execute().await
    }

    pub async fn exists(&self, id: i64) -> Result<bool> {
        let statement = QueryBuilder::new(self.table())
            .where_condition(Condition::equals(ID_COLUMN, id))
            .build_aggregate(crate::query_builder::Aggregate::Count, None)?;
        let rows = self.fetch(&statement).await?;
        Ok(query::aggregate_count(&rows)? > 0)
    }

    pub async fn count(&self, filter: &Value) -> Result<u64> {
        self.query(filter)?.count().await
    }

    /// Insert a row from explicit column values and return it as read back from storage
    pub async fn create(&self, fields: IndexMap<String, Value>) -> Result<Record<E>> {
        let id = self.insert(&fields).await?;
        self.reread(id).await
    }

    /// Insert a new record or write only its dirty fields. Returns whether a statement ran.
    pub async fn save(&self, record: &mut Record<E>) -> Result<bool> {
        if record.is_new() {
            let mut values = record.insertable_values();
            if let Some(id) = record.id() {
                values.shift_insert(0, ID_COLUMN.to_string(), Value::from(id));
            }

            let id = self.insert(&values).await?;
            let row = self.reread_row(id).await?;
            if record.id().is_none() {
                record.set_id(id)?;
            }
            record
                .absorb_row(&row)
                .map_err(|e| KeelError::persist_failed(self.entity_name(), e))?;
            record.mark_persisted();

            debug!(entity = self.entity_name(), id, "Record inserted");
            return Ok(true);
        }

        let id = record.id().ok_or_else(|| {
            KeelError::InvalidState(format!(
                "persisted {} record has no id",
                self.entity_name()
            ))
        })?;

        let changes = record.dirty_fields();
        if changes.is_empty() {
            return Ok(false);
        }

        let statement = QueryBuilder::new(self.table())
            .where_condition(Condition::equals(ID_COLUMN, id))
            .build_update(&changes)?;
        self.run(&statement)
            .await
            .map_err(|e| KeelError::persist_failed(self.entity_name(), e))?;

        debug!(
            entity = self.entity_name(),
            id,
            fields = ?changes.keys().collect::<Vec<_>>(),
            "Record updated"
        );
        record.accept_changes(changes);
        Ok(true)
    }

    /// Delete a persisted record by id
    pub async fn delete(&self, record: &Record<E>) -> Result<()> {
        let id = match (record.is_new(), record.id()) {
            (false, Some(id)) => id,
            _ => {
                return Err(KeelError::InvalidState(format!(
                    "cannot delete a {} that was never persisted",
                    self.entity_name()
                )))
            }
        };

        let statement = QueryBuilder::new(self.table())
            .where_condition(Condition::equals(ID_COLUMN, id))
            .build_delete()?;
        let result = self
            .run(&statement)
            .await
            .map_err(|e| KeelError::persist_failed(self.entity_name(), e))?;

        if result.rows_affected == 0 {
            warn!(entity = self.entity_name(), id, "Delete matched no row");
        }
        Ok(())
    }

    async fn insert(&self, values: &IndexMap<String, Value>) -> Result<i64> {
        let statement = QueryBuilder::build_insert(self.table(), values);
        let result = self
            .run(&statement)
            .await
            .map_err(|e| KeelError::persist_failed(self.entity_name(), e))?;

        let explicit = values.get(ID_COLUMN).and_then(Value::as_i64);
        result
            .last_insert_id
            .and_then(|id| i64::try_from(id).ok())
            .or(explicit)
            .ok_or_else(|| {
                KeelError::persist_failed(self.entity_name(), "insert returned no generated id")
            })
    }

    async fn reread_row(&self, id: i64) -> Result<Row> {
        let statement = QueryBuilder::new(self.table())
            .where_condition(Condition::equals(ID_COLUMN, id))
            .limit(1)
            .build_select()?;

        let rows = self
            .fetch(&statement)
            .await
            .map_err(|e| KeelError::persist_failed(self.entity_name(), e))?;
        rows.into_iter().next().ok_or_else(|| {
            KeelError::persist_failed(
                self.entity_name(),
                format!("row {id} not found after insert"),
            )
        })
    }

    async fn reread(&self, id: i64) -> Result<Record<E>> {
        let row = self.reread_row(id).await?;
        Record::hydrate(&row, None).map_err(|e| KeelError::persist_failed(self.entity_name(), e))
    }

    pub(crate) async fn fetch(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.connection
            .fetch_all(&statement.sql, &statement.params)
            .await
    }

    pub(crate) async fn run(&self, statement: &Statement) -> Result<ExecuteResult> {
        self.connection
            .execute(&statement.sql, &statement.params)
            .await
    }
}
