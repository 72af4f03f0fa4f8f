//! Physical connection drivers.
//!
//! The pool never talks to a database directly; it goes through a [`Driver`],
//! which knows how to open, probe and close native handles and how to run a
//! statement on one of them.
//!
//! Two drivers ship with the crate:
//! - [`SqliteDriver`] opens `sqlx` SQLite connections
//! - [`MemoryDriver`] is an in-process loopback whose handles can be killed
//!   from the outside and whose result sets are scripted, which makes pool
//!   behavior observable without a database server

use crate::db::types::{ResultRow, Value, ValueType};
use crate::error::{DbError, DbResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Opens and operates native database handles.
pub trait Driver: Send + Sync + 'static {
    type Handle: Send + 'static;
    type Row: ResultRow + Send + 'static;

    /// Short driver name for logs.
    fn name(&self) -> &'static str;

    /// Open a new physical connection.
    fn connect(&self) -> impl Future<Output = DbResult<Self::Handle>> + Send;

    /// Round-trip probe. Fails if the handle is no longer usable.
    fn ping(&self, handle: &mut Self::Handle) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the handle gracefully.
    fn close(&self, handle: Self::Handle) -> impl Future<Output = DbResult<()>> + Send;

    /// Run a query and return all rows in cursor order.
    fn fetch_all(
        &self,
        handle: &mut Self::Handle,
        sql: &str,
    ) -> impl Future<Output = DbResult<Vec<Self::Row>>> + Send;

    /// Run a statement and return the number of affected rows.
    fn execute(
        &self,
        handle: &mut Self::Handle,
        sql: &str,
    ) -> impl Future<Output = DbResult<u64>> + Send;
}

// =============================================================================
// SQLite
// =============================================================================

/// Driver opening `sqlx` SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    options: SqliteConnectOptions,
}

impl SqliteDriver {
    /// Create a driver from a connection URL such as `sqlite:data.db`.
    ///
    /// Missing database files are created.
    pub fn new(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?
            .create_if_missing(true);
        Ok(Self { options })
    }

    pub fn from_options(options: SqliteConnectOptions) -> Self {
        Self { options }
    }
}

impl Driver for SqliteDriver {
    type Handle = SqliteConnection;
    type Row = SqliteRow;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> DbResult<SqliteConnection> {
        self.options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect: {}", e),
                "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite",
            )
        })
    }

    async fn ping(&self, handle: &mut SqliteConnection) -> DbResult<()> {
        handle.ping().await.map_err(DbError::from)
    }

    async fn close(&self, handle: SqliteConnection) -> DbResult<()> {
        handle.close().await.map_err(DbError::from)
    }

    async fn fetch_all(&self, handle: &mut SqliteConnection, sql: &str) -> DbResult<Vec<SqliteRow>> {
        let rows = sqlx::query(sql).fetch_all(&mut *handle).await?;
        debug!(rows = rows.len(), "Fetched rows");
        Ok(rows)
    }

    async fn execute(&self, handle: &mut SqliteConnection, sql: &str) -> DbResult<u64> {
        let result = sqlx::query(sql).execute(&mut *handle).await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// In-process loopback
// =============================================================================

/// Handle issued by [`MemoryDriver`]. Clones share the same liveness flag.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    id: u64,
    alive: Arc<AtomicBool>,
}

impl MemoryHandle {
    /// Process-unique handle number.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Sever the handle as if the server had dropped it.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// A scripted result row.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl MemoryRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build rows sharing one column list.
    pub fn table(columns: &[&str], rows: Vec<Vec<Value>>) -> Vec<MemoryRow> {
        let columns = Arc::new(columns.iter().map(|c| c.to_string()).collect::<Vec<_>>());
        rows.into_iter()
            .map(|values| MemoryRow::new(Arc::clone(&columns), values))
            .collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl ResultRow for MemoryRow {
    fn find_column(&self, alias: &str) -> DbResult<usize> {
        self.columns
            .iter()
            .position(|c| c == alias)
            .ok_or_else(|| DbError::unknown_column_alias(alias))
    }

    fn get_value(&self, index: usize, value_type: ValueType) -> DbResult<Value> {
        let value = self.values.get(index).ok_or_else(|| {
            DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index,
                self.values.len()
            ))
        })?;
        match (value_type, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ValueType::Integer, Value::Integer(_))
            | (ValueType::Float, Value::Float(_))
            | (ValueType::Text, Value::Text(_))
            | (ValueType::Boolean, Value::Boolean(_))
            | (ValueType::Binary, Value::Bytes(_)) => Ok(value.clone()),
            (ValueType::Float, Value::Integer(v)) => Ok(Value::Float(*v as f64)),
            (ValueType::Boolean, Value::Integer(v)) => Ok(Value::Boolean(*v != 0)),
            (expected, found) => Err(DbError::internal(format!(
                "Failed to decode column {}: expected {}, found {:?}",
                index, expected, found
            ))),
        }
    }
}

/// In-process driver with scripted result sets.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    next_id: AtomicU64,
    refuse: AtomicBool,
    latency_ms: AtomicU64,
    results: RwLock<HashMap<String, Vec<MemoryRow>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles opened so far.
    pub fn opened(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }

    /// Delay every `ping` and `fetch_all` by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Release);
    }

    /// Register the rows returned for `sql`.
    pub fn script(&self, sql: impl Into<String>, rows: Vec<MemoryRow>) {
        if let Ok(mut results) = self.results.write() {
            results.insert(sql.into(), rows);
        }
    }

    async fn delay(&self) {
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn check(handle: &MemoryHandle) -> DbResult<()> {
        if handle.is_alive() {
            Ok(())
        } else {
            Err(DbError::connection(
                format!("Handle {} is closed", handle.id),
                "Reopen the connection",
            ))
        }
    }
}

impl Driver for MemoryDriver {
    type Handle = MemoryHandle;
    type Row = MemoryRow;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> DbResult<MemoryHandle> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(DbError::connection(
                "Connection refused",
                "Check that the server is running and accessible",
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(MemoryHandle {
            id,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn ping(&self, handle: &mut MemoryHandle) -> DbResult<()> {
        self.delay().await;
        Self::check(handle)
    }

    async fn close(&self, handle: MemoryHandle) -> DbResult<()> {
        handle.kill();
        Ok(())
    }

    async fn fetch_all(&self, handle: &mut MemoryHandle, sql: &str) -> DbResult<Vec<MemoryRow>> {
        self.delay().await;
        Self::check(handle)?;
        let results = self
            .results
            .read()
            .map_err(|_| DbError::internal("Scripted result table poisoned"))?;
        results.get(sql).cloned().ok_or_else(|| {
            DbError::database(
                format!("No scripted result for statement: {}", sql),
                None,
                "Register the statement with MemoryDriver::script",
            )
        })
    }

    async fn execute(&self, handle: &mut MemoryHandle, _sql: &str) -> DbResult<u64> {
        Self::check(handle)?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_handles_are_distinct() {
        let driver = MemoryDriver::new();
        let a = driver.connect().await.unwrap();
        let b = driver.connect().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(driver.opened(), 2);
    }

    #[tokio::test]
    async fn test_memory_ping_detects_kill() {
        let driver = MemoryDriver::new();
        let mut handle = driver.connect().await.unwrap();
        assert!(driver.ping(&mut handle).await.is_ok());
        handle.kill();
        assert!(driver.ping(&mut handle).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_refuse() {
        let driver = MemoryDriver::new();
        driver.refuse_connections(true);
        assert!(matches!(
            driver.connect().await,
            Err(DbError::Connection { .. })
        ));
        driver.refuse_connections(false);
        assert!(driver.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_scripted_results() {
        let driver = MemoryDriver::new();
        driver.script(
            "SELECT 1",
            MemoryRow::table(&["one"], vec![vec![Value::Integer(1)]]),
        );
        let mut handle = driver.connect().await.unwrap();
        let rows = driver.fetch_all(&mut handle, "SELECT 1").await.unwrap();
        assert_eq!(rows.len(), 1);
        let idx = rows[0].find_column("one").unwrap();
        assert_eq!(
            rows[0].get_value(idx, ValueType::Integer).unwrap(),
            Value::Integer(1)
        );
        assert!(driver.fetch_all(&mut handle, "SELECT 2").await.is_err());
    }

    #[test]
    fn test_memory_row_decoding() {
        let rows = MemoryRow::table(
            &["a", "b"],
            vec![vec![Value::Integer(3), Value::Null]],
        );
        let row = &rows[0];
        assert_eq!(row.get_value(0, ValueType::Float).unwrap(), Value::Float(3.0));
        assert_eq!(row.get_value(1, ValueType::Text).unwrap(), Value::Null);
        assert!(row.get_value(0, ValueType::Text).is_err());
        assert!(row.get_value(5, ValueType::Text).is_err());
        assert!(matches!(
            row.find_column("c"),
            Err(DbError::UnknownColumnAlias { .. })
        ));
    }

    #[tokio::test]
    async fn test_sqlite_driver_roundtrip() {
        let driver = SqliteDriver::new("sqlite::memory:").unwrap();
        let mut handle = driver.connect().await.unwrap();
        driver.ping(&mut handle).await.unwrap();
        driver
            .execute(&mut handle, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        let affected = driver
            .execute(&mut handle, "INSERT INTO t (id, name) VALUES (1, 'a'), (2, 'b')")
            .await
            .unwrap();
        assert_eq!(affected, 2);
        let rows = driver
            .fetch_all(&mut handle, "SELECT id AS t_id, name AS t_name FROM t ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let idx = rows[1].find_column("t_name").unwrap();
        assert_eq!(
            rows[1].get_value(idx, ValueType::Text).unwrap(),
            Value::Text("b".into())
        );
        driver.close(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_driver_unreachable_path() {
        let driver = SqliteDriver::new("sqlite:/nonexistent-dir/for/sqlstore/test.db").unwrap();
        assert!(matches!(
            driver.connect().await,
            Err(DbError::Connection { .. })
        ));
    }
}
