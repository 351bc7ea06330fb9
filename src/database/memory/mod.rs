//! # In-Memory Database
//!
//! A [`Connection`] implementation that executes the SQL subset emitted by the query
//! builder against in-process tables. It models the parts of MySQL the persistence core
//! depends on:
//!
//! - auto-increment `id` and column defaults
//! - per-session row locks taken by `SELECT … FOR UPDATE` inside a transaction; a
//!   contended lock fails with a lock-wait error, `SKIP LOCKED` skips the row
//! - nested transactions with undo-log rollback
//! - a statement log and one-shot fault injection for tests
//!
//! ```rust
//! use keel_core::database::MemoryDatabase;
//! use serde_json::json;
//!
//! let db = MemoryDatabase::new();
//! db.create_table("widgets", &[("name", json!(null)), ("score", json!(0))]);
//! let conn = db.connect();
//! assert_eq!(conn.transaction_depth_hint(), 0);
//! ```

mod sql;

use super::connection::{Connection, DepthTransition, ExecuteResult, Row, TransactionDepth};
use crate::database::value::{as_f64, coerce};
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sql::{sort_key_cmp, AggregateFunc, Expr, OrderTerm, Projection, Statement};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

const LOCK_WAIT_TIMEOUT: &str = "Lock wait timeout exceeded; try restarting transaction";

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<String>,
    defaults: Row,
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

impl Table {
    fn check_column(&self, table: &str, column: &str, clause: &str) -> Result<()> {
        if column == "id" || self.columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(KeelError::DatabaseError(format!(
                "Unknown column '{column}' in '{clause}' of table '{table}'"
            )))
        }
    }
}

#[derive(Debug, Default)]
struct DatabaseState {
    tables: HashMap<String, Table>,
    locks: HashMap<(String, i64), u64>,
    next_session: u64,
}

impl DatabaseState {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| KeelError::DatabaseError(format!("Table '{name}' doesn't exist")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| KeelError::DatabaseError(format!("Table '{name}' doesn't exist")))
    }

    fn locked_by_other(&self, table: &str, id: i64, session: u64) -> bool {
        self.locks
            .get(&(table.to_string(), id))
            .is_some_and(|owner| *owner != session)
    }
}

/// A statement as received by a [`MemoryConnection`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
struct Undo {
    table: String,
    id: i64,
    before: Option<Row>,
}

/// Shared in-memory database; each [`MemoryDatabase::connect`] opens an independent session
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table. `id` is implicit; each column carries its default.
    pub fn create_table(&self, name: &str, columns: &[(&str, Value)]) {
        let table = Table {
            columns: columns.iter().map(|(c, _)| c.to_string()).collect(),
            defaults: columns
                .iter()
                .map(|(c, v)| (c.to_string(), coerce(v.clone())))
                .collect(),
            rows: BTreeMap::new(),
            next_id: 1,
        };
        self.state.lock().tables.insert(name.to_string(), table);
    }

    /// Open a new session
    pub fn connect(&self) -> MemoryConnection {
        let session = {
            let mut state = self.state.lock();
            state.next_session += 1;
            state.next_session
        };

        MemoryConnection {
            state: Arc::clone(&self.state),
            session,
            depth: TransactionDepth::new(),
            undo: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
        }
    }

    /// Snapshot of a table's rows in id order
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of row locks currently held across all sessions
    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }
}

/// One session against a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<DatabaseState>>,
    session: u64,
    depth: TransactionDepth,
    undo: Mutex<Vec<Undo>>,
    log: Mutex<Vec<LoggedStatement>>,
    failures: Mutex<Vec<(String, String)>>,
    last_error: Mutex<Option<String>>,
}

impl MemoryConnection {
    /// Every data statement received so far
    pub fn statements(&self) -> Vec<LoggedStatement> {
        self.log.lock().clone()
    }

    pub fn statement_count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn clear_statements(&self) {
        self.log.lock().clear();
    }

    /// Make the next statement whose SQL contains `pattern` fail with `message`
    pub fn fail_when(&self, pattern: &str, message: &str) {
        self.failures
            .lock()
            .push((pattern.to_string(), message.to_string()));
    }

    /// Synchronous view of the transaction depth
    pub fn transaction_depth_hint(&self) -> usize {
        self.depth.current()
    }

    fn in_transaction(&self) -> bool {
        self.depth.current() > 0
    }

    fn fail(&self, message: String) -> KeelError {
        *self.last_error.lock() = Some(message.clone());
        KeelError::DatabaseError(message)
    }

    fn remember(&self, error: KeelError) -> KeelError {
        let message = match &error {
            KeelError::DatabaseError(message) => message.clone(),
            other => other.to_string(),
        };
        *self.last_error.lock() = Some(message);
        error
    }

    fn receive(&self, sql: &str, params: &[Value]) -> Result<Statement> {
        self.log.lock().push(LoggedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        let injected = {
            let mut failures = self.failures.lock();
            failures
                .iter()
                .position(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|index| failures.remove(index).1)
        };
        if let Some(message) = injected {
            return Err(self.fail(message));
        }

        sql::parse(sql, params).map_err(|e| self.fail(e.to_string()))
    }

    fn record_undo(&self, table: &str, id: i64, before: Option<Row>) {
        if self.in_transaction() {
            self.undo.lock().push(Undo {
                table: table.to_string(),
                id,
                before,
            });
        }
    }

    fn lock_rows(&self, state: &mut DatabaseState, table: &str, ids: &[i64]) {
        if self.in_transaction() {
            for id in ids {
                state.locks.insert((table.to_string(), *id), self.session);
            }
        }
    }

    fn release_locks(&self) {
        let session = self.session;
        self.state.lock().locks.retain(|_, owner| *owner != session);
    }

    fn rollback_undo(&self) {
        let entries: Vec<Undo> = std::mem::take(&mut *self.undo.lock());
        let mut state = self.state.lock();
        for entry in entries.into_iter().rev() {
            if let Some(table) = state.tables.get_mut(&entry.table) {
                match entry.before {
                    Some(row) => {
                        table.rows.insert(entry.id, row);
                    }
                    None => {
                        table.rows.remove(&entry.id);
                    }
                }
            }
        }
    }

    fn select(&self, statement: Statement) -> Result<Vec<Row>> {
        let Statement::Select {
            projection,
            table: table_name,
            filter,
            order,
            offset,
            limit,
            lock,
        } = statement
        else {
            return Err(KeelError::DatabaseError(
                "fetch_all expects a SELECT statement".to_string(),
            ));
        };

        let mut state = self.state.lock();
        let table = state.table(&table_name)?;
        validate_columns(table, &table_name, filter.as_ref(), &order)?;

        let mut ids = matching_ids(table, filter.as_ref(), &order);

        if let Some(skip_locked) = lock {
            if skip_locked {
                ids.retain(|id| !state.locked_by_other(&table_name, *id, self.session));
            }
        }

        let ids: Vec<i64> = ids
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX)))
            .collect();

        if lock.is_some() {
            if ids
                .iter()
                .any(|id| state.locked_by_other(&table_name, *id, self.session))
            {
                return Err(self.fail(LOCK_WAIT_TIMEOUT.to_string()));
            }
            self.lock_rows(&mut state, &table_name, &ids);
        }

        let table = state.table(&table_name)?;
        let rows: Vec<&Row> = ids.iter().filter_map(|id| table.rows.get(id)).collect();

        match projection {
            Projection::All => Ok(rows.into_iter().cloned().collect()),
            Projection::Columns(columns) => {
                for column in &columns {
                    table.check_column(&table_name, column, "field list")?;
                }
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        columns
                            .iter()
                            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                            .collect()
                    })
                    .collect())
            }
            Projection::Aggregate {
                func,
                column,
                alias,
            } => {
                if let Some(column) = &column {
                    table.check_column(&table_name, column, "field list")?;
                }
                let value = aggregate(func, column.as_deref(), &rows);
                let mut row = Row::new();
                row.insert(alias, value);
                Ok(vec![row])
            }
        }
    }

    fn insert(&self, table_name: &str, columns: Vec<String>, values: Vec<Value>) -> Result<ExecuteResult> {
        let mut state = self.state.lock();
        let table = state.table_mut(table_name)?;

        for column in &columns {
            table.check_column(table_name, column, "field list")?;
        }

        let mut row = Row::new();
        let explicit_id = columns
            .iter()
            .position(|c| c == "id")
            .and_then(|i| values.get(i))
            .and_then(crate::database::value::as_i64);
        let id = explicit_id.unwrap_or(table.next_id);
        if table.rows.contains_key(&id) {
            return Err(self.fail(format!("Duplicate entry '{id}' for key 'PRIMARY'")));
        }

        row.insert("id".to_string(), Value::from(id));
        for column in &table.columns {
            let value = columns
                .iter()
                .position(|c| c == column)
                .and_then(|i| values.get(i).cloned())
                .unwrap_or_else(|| table.defaults.get(column).cloned().unwrap_or(Value::Null));
            row.insert(column.clone(), coerce(value));
        }

        table.next_id = table.next_id.max(id + 1);
        table.rows.insert(id, row);
        self.record_undo(table_name, id, None);
        self.lock_rows(&mut state, table_name, &[id]);

        Ok(ExecuteResult {
            rows_affected: 1,
            last_insert_id: u64::try_from(id).ok(),
        })
    }

    fn target_ids(
        &self,
        state: &DatabaseState,
        table_name: &str,
        filter: Option<&Expr>,
        order: &[OrderTerm],
        limit: Option<u64>,
    ) -> Result<Vec<i64>> {
        let table = state.table(table_name)?;
        validate_columns(table, table_name, filter, order)?;

        let ids: Vec<i64> = matching_ids(table, filter, order)
            .into_iter()
            .take(limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX)))
            .collect();

        if ids
            .iter()
            .any(|id| state.locked_by_other(table_name, *id, self.session))
        {
            return Err(self.fail(LOCK_WAIT_TIMEOUT.to_string()));
        }
        Ok(ids)
    }

    fn update(
        &self,
        table_name: &str,
        assignments: Vec<(String, Value)>,
        filter: Option<Expr>,
        order: Vec<OrderTerm>,
        limit: Option<u64>,
    ) -> Result<ExecuteResult> {
        let mut state = self.state.lock();
        {
            let table = state.table(table_name)?;
            for (column, _) in &assignments {
                table.check_column(table_name, column, "field list")?;
            }
        }
        let ids = self.target_ids(&state, table_name, filter.as_ref(), &order, limit)?;

        let mut changed = 0;
        for id in &ids {
            let table = state.table_mut(table_name)?;
            let Some(row) = table.rows.get_mut(id) else {
                continue;
            };
            let before = row.clone();
            for (column, value) in &assignments {
                row.insert(column.clone(), coerce(value.clone()));
            }
            if *row != before {
                changed += 1;
                self.record_undo(table_name, *id, Some(before));
            }
        }
        self.lock_rows(&mut state, table_name, &ids);

        Ok(ExecuteResult {
            rows_affected: changed,
            last_insert_id: None,
        })
    }

    fn delete(
        &self,
        table_name: &str,
        filter: Option<Expr>,
        order: Vec<OrderTerm>,
        limit: Option<u64>,
    ) -> Result<ExecuteResult> {
        let mut state = self.state.lock();
        let ids = self.target_ids(&state, table_name, filter.as_ref(), &order, limit)?;

        let table = state.table_mut(table_name)?;
        let mut removed = 0;
        for id in &ids {
            if let Some(before) = table.rows.remove(id) {
                removed += 1;
                self.record_undo(table_name, *id, Some(before));
            }
        }

        Ok(ExecuteResult {
            rows_affected: removed,
            last_insert_id: None,
        })
    }
}

fn validate_columns(
    table: &Table,
    table_name: &str,
    filter: Option<&Expr>,
    order: &[OrderTerm],
) -> Result<()> {
    let mut columns = Vec::new();
    if let Some(filter) = filter {
        filter.columns(&mut columns);
    }
    for column in &columns {
        table.check_column(table_name, column, "where clause")?;
    }
    for term in order {
        table.check_column(table_name, &term.column, "order clause")?;
    }
    Ok(())
}

fn matching_ids(table: &Table, filter: Option<&Expr>, order: &[OrderTerm]) -> Vec<i64> {
    let mut rows: Vec<(&i64, &Row)> = table
        .rows
        .iter()
        .filter(|(_, row)| {
            filter.map_or(true, |expr| {
                expr.matches(&|column: &str| row.get(column).cloned().unwrap_or(Value::Null))
            })
        })
        .collect();

    if !order.is_empty() {
        rows.sort_by(|(_, a), (_, b)| {
            for term in order {
                let left = a.get(&term.column).unwrap_or(&Value::Null);
                let right = b.get(&term.column).unwrap_or(&Value::Null);
                let ord = sort_key_cmp(left, right);
                let ord = if term.descending { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    rows.into_iter().map(|(id, _)| *id).collect()
}

fn aggregate(func: AggregateFunc, column: Option<&str>, rows: &[&Row]) -> Value {
    let values: Vec<&Value> = match column {
        None => return Value::from(rows.len()),
        Some(column) => rows
            .iter()
            .filter_map(|row| row.get(column))
            .filter(|v| !v.is_null())
            .collect(),
    };

    match func {
        AggregateFunc::Count => Value::from(values.len()),
        AggregateFunc::Min => values
            .into_iter()
            .min_by(|a, b| sort_key_cmp(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunc::Max => values
            .into_iter()
            .max_by(|a, b| sort_key_cmp(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunc::Sum => {
            if values.is_empty() {
                return Value::Null;
            }
            if values.iter().all(|v| v.is_i64()) {
                Value::from(values.iter().filter_map(|v| v.as_i64()).sum::<i64>())
            } else {
                Value::from(values.iter().filter_map(|v| as_f64(v)).sum::<f64>())
            }
        }
        AggregateFunc::Avg => {
            if values.is_empty() {
                return Value::Null;
            }
            let total: f64 = values.iter().filter_map(|v| as_f64(v)).sum();
            Value::from(total / values.len() as f64)
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        debug!(sql = %sql, params = params.len(), session = self.session, "memory fetch_all");
        self.receive(sql, params)
            .and_then(|statement| self.select(statement))
            .map_err(|e| self.remember(e))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        debug!(sql = %sql, params = params.len(), session = self.session, "memory execute");
        let outcome = match self.receive(sql, params)? {
            Statement::Insert {
                table,
                columns,
                values,
            } => self.insert(&table, columns, values),
            Statement::Update {
                table,
                assignments,
                filter,
                order,
                limit,
            } => self.update(&table, assignments, filter, order, limit),
            Statement::Delete {
                table,
                filter,
                order,
                limit,
            } => self.delete(&table, filter, order, limit),
            Statement::Select { .. } => Err(KeelError::DatabaseError(
                "execute expects INSERT, UPDATE or DELETE".to_string(),
            )),
        };
        outcome.map_err(|e| self.remember(e))
    }

    async fn begin(&self) -> Result<()> {
        self.depth.enter();
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.depth.exit()? == DepthTransition::Outermost {
            self.undo.lock().clear();
            self.release_locks();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.depth.exit()? == DepthTransition::Outermost {
            self.rollback_undo();
            self.release_locks();
        }
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.depth.current()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}
