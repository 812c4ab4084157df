//! Connection pool tests against the in-memory database

use std::sync::Arc;
use std::time::Duration;

use rivven_sqlio::prelude::*;
use rivven_sqlio::testing::MemoryDatabase;

fn pool(db: &MemoryDatabase, max_size: usize) -> ConnectionPool {
    ConnectionPool::lazy(
        PoolConfig::new("memory://pool")
            .with_max_size(max_size)
            .with_acquire_timeout(Duration::from_millis(50)),
        Arc::new(db.clone()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_pool_opens_connections_on_demand() {
    let db = MemoryDatabase::new();
    let pool = pool(&db, 3);
    assert_eq!(pool.size(), 0);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.in_use(), 2);
    assert_eq!(db.counters().connections_opened, 2);

    drop(first);
    drop(second);
    assert_eq!(pool.idle(), 2);
    assert_eq!(pool.in_use(), 0);

    let _again = pool.acquire().await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.connections_created, 2);
    assert_eq!(stats.acquisitions, 3);
    assert_eq!(stats.reused, 1);
    assert_eq!(db.counters().connections_opened, 2);
}

#[tokio::test]
async fn test_pool_exhaustion_times_out() {
    let db = MemoryDatabase::new();
    let pool = pool(&db, 1);

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(err.is_retriable());
    assert_eq!(pool.stats().exhausted_count, 1);

    drop(held);
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let db = MemoryDatabase::new();
    let pool = ConnectionPool::lazy(
        PoolConfig::new("memory://pool")
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(5)),
        Arc::new(db.clone()),
    )
    .unwrap();

    let mut held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|lease| lease.is_held()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    held.release();
    held.release();

    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(db.counters().connections_opened, 1);
}

#[tokio::test]
async fn test_discarded_connection_is_not_reused() {
    let db = MemoryDatabase::new();
    let pool = pool(&db, 2);

    let mut lease = pool.acquire().await.unwrap();
    lease.discard();
    drop(lease);
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.idle(), 0);

    let _fresh = pool.acquire().await.unwrap();
    assert_eq!(db.counters().connections_opened, 2);
    assert_eq!(pool.stats().connections_closed, 1);
}

#[tokio::test]
async fn test_invalid_idle_connection_is_replaced() {
    let db = MemoryDatabase::new();
    db.create_table("t", &["id"]);
    let pool = pool(&db, 2);

    drop(pool.acquire().await.unwrap());
    db.invalidate_connections();

    let lease = pool.acquire().await.unwrap();
    assert!(lease.conn().unwrap().query("SELECT * FROM t", &[]).await.is_ok());
    assert_eq!(pool.stats().health_check_failures, 1);
    assert_eq!(db.counters().connections_opened, 2);
}

#[tokio::test]
async fn test_closed_pool_refuses_acquire() {
    let db = MemoryDatabase::new();
    let pool = pool(&db, 2);
    drop(pool.acquire().await.unwrap());

    pool.close().await;
    assert!(pool.is_closed());
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.acquire().await.unwrap_err().category(), ErrorCategory::Connection);
}

#[test]
fn test_pool_reports_database_type() {
    let db = MemoryDatabase::new();
    assert_eq!(pool(&db, 1).database_type(), DatabaseType::PostgreSQL);
}
