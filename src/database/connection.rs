//! Connection abstraction and the MySQL implementation backed by SQLx.
//!
//! The persistence core only ever talks to a [`Connection`]: a session that executes
//! parameterized statements (`?` placeholders, backtick-quoted identifiers) and supports
//! nested transactions through a depth counter. Only the outermost begin/commit/rollback
//! reaches the server.

use crate::config::DatabaseConfig;
use crate::error::{KeelError, Result};
use crate::logging::log_database_operation;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A fetched row: column name to raw value, in select order
pub type Row = IndexMap<String, Value>;

/// Outcome of a data-modifying statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// A database session able to run parameterized statements
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a row-returning statement
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a data-modifying statement
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Current nesting depth; 0 means autocommit
    fn transaction_depth(&self) -> usize;

    /// Message of the most recent failed statement on this session
    fn last_error(&self) -> Option<String>;
}

/// Whether a begin/commit/rollback touched the real transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthTransition {
    Outermost,
    Nested,
}

/// Nested transaction bookkeeping shared by connection implementations
#[derive(Debug, Default)]
pub struct TransactionDepth(AtomicUsize);

impl TransactionDepth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn enter(&self) -> DepthTransition {
        match self.0.fetch_add(1, Ordering::SeqCst) {
            0 => DepthTransition::Outermost,
            _ => DepthTransition::Nested,
        }
    }

    /// Undo an `enter` whose real BEGIN failed
    pub fn abandon(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }

    pub fn exit(&self) -> Result<DepthTransition> {
        match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
        {
            Ok(1) => Ok(DepthTransition::Outermost),
            Ok(_) => Ok(DepthTransition::Nested),
            Err(_) => Err(KeelError::InvalidState(
                "no open transaction on this connection".to_string(),
            )),
        }
    }
}

/// Owner of the MySQL connection pool
pub struct DatabaseConnection {
    pool: MySqlPool,
}

impl DatabaseConnection {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let started = Instant::now();
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Database pool established"
        );
        log_database_operation(
            "connect",
            None,
            None,
            "ok",
            u64::try_from(started.elapsed().as_millis()).ok(),
            None,
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS health")
            .fetch_one(&self.pool)
            .await?;

        let health: i64 = row.try_get("health")?;
        Ok(health == 1)
    }

    /// Check out a dedicated session; transactions are scoped to it
    pub async fn session(&self) -> Result<MySqlSession> {
        let conn = self.pool.acquire().await?;
        Ok(MySqlSession::new(conn))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// One pooled MySQL connection implementing [`Connection`]
pub struct MySqlSession {
    conn: tokio::sync::Mutex<PoolConnection<MySql>>,
    depth: TransactionDepth,
    last_error: Mutex<Option<String>>,
}

impl MySqlSession {
    pub fn new(conn: PoolConnection<MySql>) -> Self {
        Self {
            conn: tokio::sync::Mutex::new(conn),
            depth: TransactionDepth::new(),
            last_error: Mutex::new(None),
        }
    }

    fn record<T>(&self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| {
            let message = e.to_string();
            *self.last_error.lock() = Some(message.clone());
            KeelError::DatabaseError(message)
        })
    }

    async fn raw(&self, statement: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let executor: &mut sqlx::MySqlConnection = &mut conn;
        let result = sqlx::Executor::execute(executor, sqlx::raw_sql(statement)).await;
        self.record(result).map(|_| ())
    }
}

#[async_trait]
impl Connection for MySqlSession {
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        debug!(sql = %sql, params = params.len(), "fetch_all");

        let mut conn = self.conn.lock().await;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query.fetch_all(&mut **conn).await;
        let rows = self.record(result)?;

        rows.iter()
            .map(|row| self.record(decode_row(row)))
            .collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        debug!(sql = %sql, params = params.len(), "execute");

        let mut conn = self.conn.lock().await;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query.execute(&mut **conn).await;
        let done = self.record(result)?;

        Ok(ExecuteResult {
            rows_affected: done.rows_affected(),
            last_insert_id: match done.last_insert_id() {
                0 => None,
                id => Some(id),
            },
        })
    }

    async fn begin(&self) -> Result<()> {
        if self.depth.enter() == DepthTransition::Outermost {
            if let Err(e) = self.raw("START TRANSACTION").await {
                self.depth.abandon();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        match self.depth.exit()? {
            DepthTransition::Outermost => self.raw("COMMIT").await,
            DepthTransition::Nested => Ok(()),
        }
    }

    async fn rollback(&self) -> Result<()> {
        match self.depth.exit()? {
            DepthTransition::Outermost => self.raw("ROLLBACK").await,
            DepthTransition::Nested => {
                warn!("Nested rollback only unwinds the depth counter; outer transaction still open");
                Ok(())
            }
        }
    }

    fn transaction_depth(&self) -> usize {
        self.depth.current()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn decode_row(row: &MySqlRow) -> std::result::Result<Row, sqlx::Error> {
    let mut out = Row::with_capacity(row.len());

    for (index, column) in row.columns().iter().enumerate() {
        let is_null = row.try_get_raw(index)?.is_null();
        let value = if is_null {
            Value::Null
        } else {
            decode_column(row, index, column.type_info().name())?
        };
        out.insert(column.name().to_string(), value);
    }

    Ok(out)
}

fn decode_column(
    row: &MySqlRow,
    index: usize,
    type_name: &str,
) -> std::result::Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Value::from(row.try_get::<i64, _>(index)?)
        }
        t if t.ends_with("UNSIGNED") => Value::from(row.try_get::<u64, _>(index)?),
        "FLOAT" => float_value(f64::from(row.try_get::<f32, _>(index)?)),
        "DOUBLE" => float_value(row.try_get::<f64, _>(index)?),
        "JSON" => row.try_get::<Value, _>(index)?,
        "DATETIME" => Value::from(
            row.try_get::<chrono::NaiveDateTime, _>(index)?
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        ),
        "TIMESTAMP" => Value::from(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(index)?
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        ),
        "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
            Value::from(String::from_utf8_lossy(&bytes).into_owned())
        }
        // VARCHAR, CHAR, TEXT, DECIMAL, ENUM, TIME all arrive as text
        _ => Value::from(row.try_get_unchecked::<String, _>(index)?),
    };

    Ok(value)
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
