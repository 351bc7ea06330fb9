//! Repository-bound query: a [`QueryBuilder`] plus the repository that executes it.

use super::Repository;
use crate::constants::ID_COLUMN;
use crate::database::value::{as_f64, as_i64, key_string};
use crate::database::Row;
use crate::error::{KeelError, Result};
use crate::models::{Entity, Record};
use crate::query_builder::{
    clamp_page, last_page, Aggregate, CompareOp, Condition, Paginated, QueryBuilder,
    AGGREGATE_ALIAS,
};
use indexmap::IndexMap;
use serde_json::Value;
use std::ops::ControlFlow;
use tracing::debug;

#[derive(Debug)]
pub struct Query<E> {
    repository: Repository<E>,
    builder: QueryBuilder,
}

impl<E> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            builder: self.builder.clone(),
        }
    }
}

impl<E: Entity> Query<E> {
    pub(crate) fn new(repository: Repository<E>, builder: QueryBuilder) -> Self {
        Self {
            repository,
            builder,
        }
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    fn map(mut self, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    /// AND another DSL filter onto this query
    pub fn filter(mut self, filter: &Value) -> Result<Self> {
        self.builder = self.builder.where_filter(filter)?;
        Ok(self)
    }

    pub fn where_condition(self, condition: Condition) -> Self {
        self.map(|b| b.where_condition(condition))
    }

    pub fn select(self, fields: &[&str]) -> Self {
        self.map(|b| b.select(fields))
    }

    pub fn order_by(self, field: &str, direction: &str) -> Self {
        self.map(|b| b.order_by(field, direction))
    }

    pub fn order_asc(self, field: &str) -> Self {
        self.map(|b| b.order_asc(field))
    }

    pub fn order_desc(self, field: &str) -> Self {
        self.map(|b| b.order_desc(field))
    }

    pub fn limit(self, limit: u64) -> Self {
        self.map(|b| b.limit(limit))
    }

    pub fn offset(self, offset: u64) -> Self {
        self.map(|b| b.offset(offset))
    }

    /// Lock the selected rows until the surrounding transaction ends
    pub fn lock_for_update(self, skip_locked: bool) -> Self {
        self.map(|b| b.lock_for_update(skip_locked))
    }

    /// Raw rows for the compiled SELECT
    pub async fn rows(&self) -> Result<Vec<Row>> {
        let statement = self.builder.build_select()?;
        self.repository.fetch(&statement).await
    }

    /// Hydrated records
    pub async fn execute(&self) -> Result<Vec<Record<E>>> {
        self.rows()
            .await?
            .iter()
            .map(|row| Record::hydrate(row, None))
            .collect()
    }

    pub async fn first(&self) -> Result<Option<Record<E>>> {
        Ok(self.clone().limit(1).execute().await?.into_iter().next())
    }

    /// Values of one column, in query order
    pub async fn pluck(&self, column: &str) -> Result<Vec<Value>> {
        let rows = self.clone().select(&[column]).rows().await?;
        Ok(rows
            .into_iter()
            .map(|mut row| row.shift_remove(column).unwrap_or(Value::Null))
            .collect())
    }

    /// Values of `column` keyed by the string form of `key`; later rows win on duplicate keys
    pub async fn pluck_keyed(&self, column: &str, key: &str) -> Result<IndexMap<String, Value>> {
        let rows = self.clone().select(&[key, column]).rows().await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let k = row.get(key).map(key_string).unwrap_or_default();
                let v = row.get(column).cloned().unwrap_or(Value::Null);
                (k, v)
            })
            .collect())
    }

    /// Count first, then fetch the requested page clamped into range
    pub async fn paginate(&self, per_page: u64, page: u64) -> Result<Paginated<Record<E>>> {
        if per_page == 0 {
            return Err(KeelError::InvalidInput(
                "per_page must be greater than zero".to_string(),
            ));
        }

        let total = self.count().await?;
        let current_page = clamp_page(page, total, per_page);
        let items = self
            .clone()
            .map(|b| b.paginate(current_page, per_page))
            .execute()
            .await?;

        Ok(Paginated {
            items,
            total,
            per_page,
            current_page,
            last_page: last_page(total, per_page),
        })
    }

    /// Visit matching records in batches of `size`.
    ///
    /// Without an explicit order, batches walk ascending ids (keyset), so rows inserted or
    /// deleted between batches never shift later ones. With an order, batches are
    /// offset pages of that order. A limit or offset already set on the query bounds the
    /// window of rows visited. Returns `true` when every batch was visited.
    pub async fn chunk<F>(&self, size: u64, mut callback: F) -> Result<bool>
    where
        F: FnMut(Vec<Record<E>>) -> ControlFlow<()>,
    {
        if size == 0 {
            return Err(KeelError::InvalidInput(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let keyset = !self.builder.has_order();
        let mut remaining = self.builder.get_limit();
        let mut offset = self.builder.get_offset().unwrap_or(0);
        let mut last_id: Option<i64> = None;
        let mut batch: u64 = 0;

        loop {
            let take = remaining.map_or(size, |left| left.min(size));
            if take == 0 {
                break;
            }

            let mut batch_query = self.clone();
            if keyset {
                batch_query = batch_query.order_asc(ID_COLUMN);
                if let Some(after) = last_id {
                    batch_query = batch_query
                        .where_condition(Condition::compare(ID_COLUMN, CompareOp::Gt, after));
                }
            }

            let records = batch_query.limit(take).offset(offset).execute().await?;
            let fetched = u64::try_from(records.len()).unwrap_or(u64::MAX);
            if fetched == 0 {
                break;
            }

            batch += 1;
            if keyset {
                last_id = records.last().and_then(|r| r.id());
                offset = 0;
            } else {
                offset += fetched;
            }
            remaining = remaining.map(|left| left.saturating_sub(fetched));

            debug!(batch, rows = fetched, "Chunk batch");
            if callback(records).is_break() {
                return Ok(false);
            }
            if fetched < take {
                break;
            }
        }

        Ok(true)
    }

    /// Bulk UPDATE of the matching rows; returns rows changed
    pub async fn update(&self, values: &IndexMap<String, Value>) -> Result<u64> {
        let statement = self.builder.build_update(values)?;
        Ok(self.repository.run(&statement).await?.rows_affected)
    }

    /// Bulk DELETE of the matching rows; returns rows removed
    pub async fn delete(&self) -> Result<u64> {
        let statement = self.builder.build_delete()?;
        Ok(self.repository.run(&statement).await?.rows_affected)
    }

    async fn aggregate(&self, aggregate: Aggregate, column: Option<&str>) -> Result<Value> {
        let statement = self.builder.build_aggregate(aggregate, column)?;
        let rows = self.repository.fetch(&statement).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(AGGREGATE_ALIAS))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn count(&self) -> Result<u64> {
        let statement = self.builder.build_aggregate(Aggregate::Count, None)?;
        let rows = self.repository.fetch(&statement).await?;
        aggregate_count(&rows)
    }

    /// Smallest value of `column`; `Null` when nothing matches
    pub async fn min(&self, column: &str) -> Result<Value> {
        self.aggregate(Aggregate::Min, Some(column)).await
    }

    pub async fn max(&self, column: &str) -> Result<Value> {
        self.aggregate(Aggregate::Max, Some(column)).await
    }

    pub async fn sum(&self, column: &str) -> Result<Value> {
        self.aggregate(Aggregate::Sum, Some(column)).await
    }

    pub async fn avg(&self, column: &str) -> Result<Option<f64>> {
        Ok(as_f64(&self.aggregate(Aggregate::Avg, Some(column)).await?))
    }
}

/// Read `COUNT(*) AS aggregate` from a result set
pub(crate) fn aggregate_count(rows: &[Row]) -> Result<u64> {
    let value = rows
        .first()
        .and_then(|row| row.get(AGGREGATE_ALIAS))
        .ok_or_else(|| KeelError::DatabaseError("COUNT returned no row".to_string()))?;

    as_i64(value)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| KeelError::DatabaseError(format!("COUNT returned {value}")))
}
