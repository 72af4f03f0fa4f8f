//! Integration tests for connection pool acquisition, reuse and shutdown.

use sqlstore::config::PoolOptions;
use sqlstore::db::{Connection, ConnectionPool, ConnectionState, MemoryDriver, SqliteDriver};
use sqlstore::error::DbError;
use std::collections::HashSet;
use std::time::Duration;
use tempfile::NamedTempFile;

fn memory_pool(max: u32) -> ConnectionPool<MemoryDriver> {
    ConnectionPool::new(
        MemoryDriver::new(),
        PoolOptions {
            max_connections: Some(max),
            acquire_timeout_secs: Some(1),
            ..Default::default()
        },
    )
    .unwrap()
}

async fn handle_id(conn: &Connection<MemoryDriver>) -> u64 {
    conn.handle().await.unwrap().id()
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let pool = memory_pool(10);
    let c1 = pool.get_connection().await.unwrap();
    let h1 = handle_id(&c1).await;
    pool.release(&c1).unwrap();
    assert_eq!(pool.size(), 1);

    let c2 = pool.get_connection().await.unwrap();
    assert_eq!(c1, c2);
    assert_eq!(handle_id(&c2).await, h1);
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.driver().opened(), 1);
}

#[tokio::test]
async fn test_held_connections_are_distinct() {
    let pool = memory_pool(10);
    let c1 = pool.get_connection().await.unwrap();
    let c2 = pool.get_connection().await.unwrap();
    assert_ne!(c1, c2);
    assert_ne!(handle_id(&c1).await, handle_id(&c2).await);
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.active_count(), 2);
}

#[tokio::test]
async fn test_staleness() {
    let pool = memory_pool(10);
    let conn = pool.get_connection().await.unwrap();
    conn.release().unwrap();

    assert!(pool.is_stale(&conn, Duration::ZERO));
    assert!(!pool.is_stale(&conn, Duration::from_millis(100)));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(pool.is_stale(&conn, Duration::from_millis(100)));
}

#[tokio::test]
async fn test_forced_validity_detects_closed_handle() {
    let pool = memory_pool(10);
    let conn = pool.get_connection().await.unwrap();
    assert!(pool.is_valid(&conn, true).await);

    conn.handle().await.unwrap().kill();

    // The cheap check only sees a present handle.
    assert!(pool.is_valid(&conn, false).await);
    assert!(!pool.is_valid(&conn, true).await);
}

#[tokio::test]
async fn test_concurrent_acquisitions_are_distinct() {
    const WORKERS: usize = 8;
    const PER_WORKER: usize = 10;

    let pool = memory_pool(100);
    let mut tasks = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut held = Vec::with_capacity(PER_WORKER);
            for _ in 0..PER_WORKER {
                held.push(pool.get_connection().await.unwrap());
            }
            let mut ids = Vec::with_capacity(PER_WORKER);
            for conn in &held {
                ids.push((conn.id(), conn.handle().await.unwrap().id()));
            }
            (held, ids)
        }));
    }

    let mut wrappers = HashSet::new();
    let mut handles = HashSet::new();
    let mut held = Vec::new();
    for task in tasks {
        let (conns, ids) = task.await.unwrap();
        for (wrapper, handle) in ids {
            assert!(wrappers.insert(wrapper), "wrapper {} handed out twice", wrapper);
            assert!(handles.insert(handle), "handle {} handed out twice", handle);
        }
        held.extend(conns);
    }

    assert_eq!(wrappers.len(), WORKERS * PER_WORKER);
    assert!(pool.size() >= WORKERS * PER_WORKER);
    for conn in &held {
        conn.release().unwrap();
    }
    assert_eq!(pool.idle_count(), WORKERS * PER_WORKER);
}

#[tokio::test]
async fn test_double_release_rejected() {
    let pool = memory_pool(10);
    let conn = pool.get_connection().await.unwrap();
    pool.release(&conn).unwrap();

    let err = pool.release(&conn).unwrap_err();
    assert!(matches!(err, DbError::ConnectionState { .. }));
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_stale_loan_cannot_release() {
    let pool = memory_pool(10);
    let c1 = pool.get_connection().await.unwrap();
    c1.release().unwrap();
    let c2 = pool.get_connection().await.unwrap();
    assert_eq!(c1, c2);

    // c1 still points at the wrapper now lent to c2.
    assert!(matches!(c1.release(), Err(DbError::ConnectionState { .. })));
    assert!(matches!(c1.execute("select 1").await, Err(DbError::ConnectionState { .. })));
    assert!(matches!(c1.handle().await, Err(DbError::ConnectionState { .. })));
    assert_eq!(c2.state(), ConnectionState::Active);
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.idle_count(), 0);

    // The wrapper was not handed back, so a second borrower gets a new one.
    let c3 = pool.get_connection().await.unwrap();
    assert_ne!(c2, c3);
    assert_eq!(pool.active_count(), 2);
    assert_eq!(pool.idle_count(), 0);

    c2.release().unwrap();
    drop(c1);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.active_count(), 1);
}

#[tokio::test]
async fn test_dropped_connection_returns_slot() {
    let pool = memory_pool(1);
    {
        let _conn = pool.get_connection().await.unwrap();
        assert_eq!(pool.active_count(), 1);
    }
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.active_count(), 0);

    // Saturated at one connection: only the returned wrapper can serve this.
    let conn = pool.get_connection().await.unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.driver().opened(), 1);

    // Dropping after an explicit release changes nothing.
    conn.release().unwrap();
    drop(conn);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn test_use_after_close_fails() {
    let pool = memory_pool(10);
    let held = pool.get_connection().await.unwrap();
    let idle = pool.get_connection().await.unwrap();
    idle.release().unwrap();

    pool.close().await;
    assert!(pool.is_closed());
    assert_eq!(pool.size(), 0);
    assert_eq!(held.state(), ConnectionState::Closed);

    assert!(matches!(held.execute("select 1").await, Err(DbError::PoolClosed)));
    assert!(matches!(held.release(), Err(DbError::PoolClosed)));
    assert!(matches!(pool.get_connection().await, Err(DbError::PoolClosed)));
    assert!(!pool.is_valid(&held, false).await);

    // Closing twice is a no-op.
    pool.close().await;
}

#[tokio::test]
async fn test_failed_connect_leaves_size_unchanged() {
    let pool = memory_pool(2);
    let conn = pool.get_connection().await.unwrap();

    pool.driver().refuse_connections(true);
    let err = pool.get_connection().await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    assert!(err.is_retryable());
    assert_eq!(pool.size(), 1);

    // The reserved slot was handed back: both slots are usable again.
    pool.driver().refuse_connections(false);
    let second = pool.get_connection().await.unwrap();
    assert_ne!(conn, second);
    assert_eq!(pool.size(), 2);
}

#[tokio::test]
async fn test_saturated_pool_times_out() {
    let pool = memory_pool(1);
    let _held = pool.get_connection().await.unwrap();

    let started = std::time::Instant::now();
    let err = pool.get_connection().await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_waiter_receives_released_connection() {
    let pool = memory_pool(1);
    let held = pool.get_connection().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_connection().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    held.release().unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
}

#[tokio::test]
async fn test_dead_idle_handle_is_replaced() {
    let pool = memory_pool(10);
    let c1 = pool.get_connection().await.unwrap();
    c1.handle().await.unwrap().kill();
    c1.release().unwrap();

    let c2 = pool.get_connection().await.unwrap();
    assert_ne!(c1, c2);
    assert_eq!(c1.state(), ConnectionState::Closed);
    assert!(pool.is_valid(&c2, true).await);
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.driver().opened(), 2);
}

#[tokio::test]
async fn test_expired_idle_connections_are_reaped() {
    let pool = ConnectionPool::new(
        MemoryDriver::new(),
        PoolOptions {
            idle_timeout_secs: Some(1),
            ..Default::default()
        },
    )
    .unwrap();
    let conn = pool.get_connection().await.unwrap();
    conn.release().unwrap();
    assert_eq!(pool.reap_idle().await, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(pool.reap_idle().await, 1);
    assert_eq!(pool.size(), 0);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_sqlite_pool_reuse_and_validity() {
    let temp_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}", temp_file.path().to_str().unwrap());
    let pool = ConnectionPool::new(SqliteDriver::new(&url).unwrap(), PoolOptions::default()).unwrap();

    let c1 = pool.get_connection().await.unwrap();
    c1.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
        .await
        .unwrap();
    assert_eq!(
        c1.execute("INSERT INTO t (id, name) VALUES (1, 'a'), (2, 'b')")
            .await
            .unwrap(),
        2
    );
    let c2 = pool.get_connection().await.unwrap();
    assert_ne!(c1, c2);
    assert_eq!(c2.fetch_all("SELECT id FROM t").await.unwrap().len(), 2);

    c1.release().unwrap();
    let c3 = pool.get_connection().await.unwrap();
    assert_eq!(c1, c3);
    assert!(pool.is_valid(&c3, true).await);
    c2.release().unwrap();
    assert_eq!(pool.idle_count(), 1);

    pool.close().await;
    assert!(matches!(c3.fetch_all("SELECT 1").await, Err(DbError::PoolClosed)));
    assert!(!pool.is_valid(&c3, true).await);
}
