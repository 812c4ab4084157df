//! Shared fixtures for rivven-sqlio integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rivven_sqlio::prelude::*;
use rivven_sqlio::testing::MemoryDatabase;

pub const ITEMS: &str = "items";

/// Table `items(id, name)` with ids `0..rows`
pub fn seeded_db(rows: i64) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(ITEMS, &["id", "name"]);
    db.insert_rows(
        ITEMS,
        (0..rows).map(|i| vec![Value::Int64(i), Value::String(format!("item-{}", i))]),
    );
    db
}

pub const EVENTS: &str = "events";

/// Table `events(id, grp)` with ids `0..rows` and `grp = id / 10`, so every
/// group key is shared by ten rows
pub fn grouped_db(rows: i64) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(EVENTS, &["id", "grp"]);
    db.insert_rows(
        EVENTS,
        (0..rows).map(|i| vec![Value::Int64(i), Value::Int64(i / 10)]),
    );
    db
}

pub fn events_schema() -> Schema {
    Schema::new(vec![
        ColumnSpec::new("id", SqlType::BigInt),
        ColumnSpec::new("grp", SqlType::BigInt),
    ])
}

pub fn items_schema() -> Schema {
    Schema::new(vec![
        ColumnSpec::new("id", SqlType::BigInt),
        ColumnSpec::new("name", SqlType::Text),
    ])
}

/// Configuration with millisecond backoffs so retry tests stay fast
pub fn fast_config() -> SqlioConfig {
    let mut config = SqlioConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter = 0.0;
    config
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_initial_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(5))
        .with_jitter(0.0)
}

pub fn connector(db: &MemoryDatabase, config: SqlioConfig) -> SqlConnector {
    SqlConnector::new(db.pool(8).unwrap(), Arc::new(PostgresDialect), config).unwrap()
}

pub fn record_id(record: &Record) -> i64 {
    record.get("id").and_then(Datum::as_i64).unwrap()
}

/// Drain a read, returning the ids of every row event in arrival order
pub async fn drain_ids(handle: &mut ReadHandle) -> Vec<i64> {
    let mut ids = Vec::new();
    while let Some(event) = handle.next_event().await {
        if let ReadEvent::Row { record, .. } = event {
            ids.push(record_id(&record));
        }
    }
    ids
}

pub fn sorted(mut ids: Vec<i64>) -> Vec<i64> {
    ids.sort_unstable();
    ids
}
