//! Batch writer tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::StreamExt;
use rivven_sqlio::prelude::*;
use rivven_sqlio::testing::MemoryDatabase;

const SINK: &str = "sink_items";

fn sink_db() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(SINK, &["id", "name"]);
    db
}

fn records(range: std::ops::Range<i64>) -> Vec<Record> {
    let schema = Arc::new(items_schema());
    range
        .map(|i| {
            Record::new(
                Arc::clone(&schema),
                vec![Datum::Int(i), Datum::Text(format!("item-{}", i))],
            )
            .unwrap()
        })
        .collect()
}

fn writer(db: &MemoryDatabase, max_rows: usize) -> BatchWriter {
    BatchWriter::new(
        db.pool(4).unwrap(),
        Arc::new(PostgresDialect),
        WriteTarget::new(SINK).with_upsert_key(["id"]),
        BatchConfig::default()
            .with_max_rows(max_rows)
            .with_flush_interval(Duration::from_secs(60))
            .with_retry(fast_retry()),
    )
    .unwrap()
}

fn stored_ids(db: &MemoryDatabase) -> Vec<i64> {
    sorted(
        db.rows(SINK)
            .iter()
            .filter_map(|row| row.get_by_name("id").and_then(Value::as_i64))
            .collect(),
    )
}

// ==================== Batching Tests ====================

#[tokio::test]
async fn test_write_commits_full_batches() {
    let db = sink_db();
    let mut writer = writer(&db, 10);

    let mut commits = Vec::new();
    for record in records(0..25) {
        if let Some(commit) = writer.write(record).await.unwrap() {
            commits.push(commit);
        }
    }
    assert_eq!(commits.len(), 2);
    assert_eq!(writer.buffered(), 5);
    assert_eq!(db.row_count(SINK), 20);

    let last = writer.flush().await.unwrap().unwrap();
    assert_eq!(last.sequence, 3);
    assert_eq!(last.rows, 5);
    assert!(writer.flush().await.unwrap().is_none());

    assert_eq!(stored_ids(&db), (0..25).collect::<Vec<_>>());
    let stats = writer.stats();
    assert_eq!(stats.batches_committed, 3);
    assert_eq!(stats.records_written, 25);
}

#[tokio::test]
async fn test_byte_bound_closes_batch_early() {
    let db = sink_db();
    let mut writer = BatchWriter::new(
        db.pool(2).unwrap(),
        Arc::new(PostgresDialect),
        WriteTarget::new(SINK).with_upsert_key(["id"]),
        BatchConfig::default()
            .with_max_rows(1000)
            .with_max_bytes(1)
            .with_retry(fast_retry()),
    )
    .unwrap();

    for record in records(0..3) {
        let commit = writer.write(record).await.unwrap().unwrap();
        assert_eq!(commit.rows, 1);
    }
    assert_eq!(db.row_count(SINK), 3);
}

#[tokio::test]
async fn test_transient_commit_failure_is_retried_once() {
    let db = sink_db();
    db.fail_commit(5);
    let writer = writer(&db, 1000);

    let results: Vec<Result<CommitResult>> = writer
        .run(futures::stream::iter(records(0..10_000)))
        .collect()
        .await;

    assert_eq!(results.len(), 10);
    for (index, result) in results.iter().enumerate() {
        let commit = result.as_ref().unwrap();
        assert_eq!(commit.sequence, index as u64 + 1);
        assert_eq!(commit.rows, 1000);
        let expected_attempts = if commit.sequence == 5 { 2 } else { 1 };
        assert_eq!(commit.attempts, expected_attempts);
    }
    assert_eq!(db.row_count(SINK), 10_000);
    assert_eq!(db.counters().commits, 10);
}

#[tokio::test]
async fn test_replayed_batches_leave_one_copy() {
    let db = sink_db();

    let first: Vec<_> = writer(&db, 100)
        .run(futures::stream::iter(records(0..500)))
        .collect()
        .await;
    assert!(first.iter().all(Result::is_ok));

    // a restarted writer replays the tail it could not confirm
    let replay: Vec<_> = writer(&db, 100)
        .run(futures::stream::iter(records(300..600)))
        .collect()
        .await;
    assert!(replay.iter().all(Result::is_ok));

    assert_eq!(db.row_count(SINK), 600);
    assert_eq!(stored_ids(&db), (0..600).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_insert_mode_duplicates_replays() {
    let db = sink_db();
    let target = WriteTarget::new(SINK).with_mode(WriteMode::Insert);

    for _ in 0..2 {
        let mut writer = BatchWriter::new(
            db.pool(2).unwrap(),
            Arc::new(PostgresDialect),
            target.clone(),
            BatchConfig::default().with_retry(fast_retry()),
        )
        .unwrap();
        for record in records(0..10) {
            writer.write(record).await.unwrap();
        }
        writer.flush().await.unwrap();
    }
    assert_eq!(db.row_count(SINK), 20);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_permanent_failure_keeps_batch_pending() {
    let db = sink_db();
    db.reject_commits(true);
    let mut writer = writer(&db, 5);

    let mut batch = records(0..5);
    let last = batch.pop().unwrap();
    for record in batch {
        assert!(writer.write(record).await.unwrap().is_none());
    }
    match writer.write(last).await {
        Err(Error::Write {
            sequence, attempts, ..
        }) => {
            assert_eq!(sequence, 1);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let pending = writer.pending_batch().unwrap();
    assert_eq!(pending.sequence(), 1);
    assert_eq!(pending.len(), 5);
    assert_eq!(db.row_count(SINK), 0);

    let blocked = writer.write(records(5..6).remove(0)).await.unwrap_err();
    assert!(matches!(blocked, Error::BatchPending { sequence: 1 }));
    assert_eq!(writer.stats().batches_failed, 1);

    db.reject_commits(false);
    let commit = writer.flush().await.unwrap().unwrap();
    assert_eq!(commit.sequence, 1);
    assert_eq!(commit.rows, 5);
    assert!(writer.pending_batch().is_none());
    assert_eq!(stored_ids(&db), (0..5).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_failed_batch_can_be_taken_for_dead_lettering() {
    let db = sink_db();
    db.reject_commits(true);
    let mut writer = writer(&db, 3);

    for record in records(0..3) {
        let _ = writer.write(record).await;
    }
    let failed = writer.take_failed_batch().unwrap();
    assert_eq!(failed.sequence(), 1);
    assert_eq!(failed.into_records().len(), 3);

    db.reject_commits(false);
    for record in records(3..6) {
        let _ = writer.write(record).await.unwrap();
    }
    assert_eq!(stored_ids(&db), vec![3, 4, 5]);
}

#[tokio::test]
async fn test_run_stops_after_first_error() {
    let db = sink_db();
    let writer = writer(&db, 10);
    db.reject_commits(true);

    let results: Vec<_> = writer
        .run(futures::stream::iter(records(0..100)))
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(Error::Write { sequence: 1, .. })));
}

#[test]
fn test_upsert_requires_key() {
    let db = sink_db();
    let err = BatchWriter::new(
        db.pool(1).unwrap(),
        Arc::new(PostgresDialect),
        WriteTarget::new(SINK),
        BatchConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    let err = WriteTarget::new(SINK)
        .with_columns(["name"])
        .with_upsert_key(["id"])
        .validate()
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

// ==================== Background Writer Tests ====================

#[tokio::test]
async fn test_spawned_writer_reports_each_batch() {
    let db = sink_db();
    let mut handle = writer(&db, 50).spawn(futures::stream::iter(records(0..120)));

    let mut rows = Vec::new();
    while let Some(result) = handle.next_result().await {
        rows.push(result.unwrap().rows);
    }
    assert_eq!(rows, vec![50, 50, 20]);
    assert_eq!(handle.stats().records_written, 120);

    let writer = handle.finish().await.unwrap();
    assert!(writer.pending_batch().is_none());
    assert_eq!(db.row_count(SINK), 120);
}

#[tokio::test]
async fn test_flush_interval_commits_partial_batch() {
    let db = sink_db();
    let writer = BatchWriter::new(
        db.pool(2).unwrap(),
        Arc::new(PostgresDialect),
        WriteTarget::new(SINK).with_upsert_key(["id"]),
        BatchConfig::default()
            .with_max_rows(1000)
            .with_flush_interval(Duration::from_millis(20))
            .with_retry(fast_retry()),
    )
    .unwrap();

    // three records, then the input stays open
    let input = futures::stream::iter(records(0..3)).chain(futures::stream::pending());
    let mut handle = writer.spawn(input);

    let commit = tokio::time::timeout(Duration::from_secs(5), handle.next_result())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(commit.rows, 3);
    assert_eq!(db.row_count(SINK), 3);
}

#[tokio::test(start_paused = true)]
async fn test_flush_interval_counts_from_first_buffered_row() {
    let db = sink_db();
    let writer = BatchWriter::new(
        db.pool(2).unwrap(),
        Arc::new(PostgresDialect),
        WriteTarget::new(SINK).with_upsert_key(["id"]),
        BatchConfig::default()
            .with_max_rows(1000)
            .with_flush_interval(Duration::from_millis(50))
            .with_retry(fast_retry()),
    )
    .unwrap();

    // one record after an idle stretch longer than the interval
    let late = records(0..1).into_iter().next().unwrap();
    let input = futures::stream::once(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        late
    })
    .chain(futures::stream::pending());
    let started = tokio::time::Instant::now();
    let mut handle = writer.spawn(input);

    let commit = handle.next_result().await.unwrap().unwrap();
    assert_eq!(commit.rows, 1);
    assert!(started.elapsed() >= Duration::from_millis(170));
}

#[tokio::test(start_paused = true)]
async fn test_write_commits_batch_older_than_flush_interval() {
    let db = sink_db();
    let mut writer = BatchWriter::new(
        db.pool(2).unwrap(),
        Arc::new(PostgresDialect),
        WriteTarget::new(SINK).with_upsert_key(["id"]),
        BatchConfig::default()
            .with_max_rows(1000)
            .with_flush_interval(Duration::from_millis(50))
            .with_retry(fast_retry()),
    )
    .unwrap();
    let mut input = records(0..3).into_iter();

    assert!(writer.write(input.next().unwrap()).await.unwrap().is_none());
    tokio::time::advance(Duration::from_millis(20)).await;
    assert!(writer.write(input.next().unwrap()).await.unwrap().is_none());

    tokio::time::advance(Duration::from_millis(40)).await;
    let commit = writer.write(input.next().unwrap()).await.unwrap().unwrap();
    assert_eq!(commit.rows, 3);
    assert_eq!(writer.buffered(), 0);
    assert_eq!(stored_ids(&db), vec![0, 1, 2]);
}

// ==================== Connector Writer Tests ====================

#[tokio::test]
async fn test_connector_writer_uses_configured_upsert_key() {
    let db = sink_db();
    let mut config = fast_config();
    config.upsert_key = vec!["id".to_string()];
    config.batch.max_rows = 40;
    let connector = connector(&db, config);

    let results: Vec<_> = connector
        .submit_rows(
            WriteTarget::new(SINK),
            futures::stream::iter(records(0..100)),
        )
        .unwrap()
        .collect()
        .await;

    let rows: Vec<u64> = results.into_iter().map(|r| r.unwrap().rows).collect();
    assert_eq!(rows, vec![40, 40, 20]);
    assert_eq!(db.row_count(SINK), 100);
}
