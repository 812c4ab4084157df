//! Connector facade tests: planning, schema resolution and estimates

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use rivven_sqlio::prelude::*;

// ==================== Planning Tests ====================

#[tokio::test]
async fn test_split_queries_render_literal_sql() {
    let db = seeded_db(1000);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS)
        .with_partition_column("id")
        .with_num_partitions(4);

    let sql = connector.split_queries(&query).await.unwrap();
    assert_eq!(sql.len(), 4);
    assert!(sql[0].contains("\"id\" >= 0") && sql[0].contains("\"id\" < 250"));
    assert!(sql[3].contains("\"id\" >= 750") && sql[3].contains("\"id\" < 1000"));
    assert!(sql.iter().all(|s| s.contains("ORDER BY \"id\" ASC")));

    // the plan is not kept
    assert!(connector.arena(query.id()).is_none());
    assert_eq!(connector.plan_splits(&query).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_planning_twice_is_rejected_until_forgotten() {
    let db = seeded_db(100);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS).with_partition_column("id");

    connector.plan_splits(&query).await.unwrap();
    let err = connector.plan_splits(&query).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Split);

    assert!(connector.forget(query.id()));
    assert!(!connector.forget(query.id()));
    assert!(connector.plan_splits(&query).await.is_ok());
}

#[tokio::test]
async fn test_target_split_size_drives_split_count() {
    let db = seeded_db(1000);
    let mut config = fast_config();
    config.target_split_size = 300;
    let connector = connector(&db, config);
    let query = QueryDescriptor::table(None, ITEMS).with_partition_column("id");

    let splits = connector.plan_splits(&query).await.unwrap();
    assert_eq!(splits.len(), 4);
    let estimated: u64 = splits.iter().filter_map(|s| s.size_estimate()).sum();
    assert_eq!(estimated, 1000);
}

#[tokio::test]
async fn test_explicit_bounds_still_read_every_row() {
    let db = seeded_db(1000);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS)
        .with_partition_column("id")
        .with_bounds(100_i64, 499_i64)
        .with_num_partitions(4)
        .with_schema(items_schema());

    let splits = connector.plan_splits(&query).await.unwrap();
    assert_eq!(splits.len(), 4);
    connector.forget(query.id());

    let mut handle = connector.read(&query).await.unwrap();
    let ids = drain_ids(&mut handle).await;
    handle.join().await.unwrap();

    assert_eq!(sorted(ids), (0..1000).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_explicit_bounds_must_be_ordered() {
    let db = seeded_db(10);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS)
        .with_partition_column("id")
        .with_bounds(10_i64, 5_i64);

    let err = connector.plan_splits(&query).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[tokio::test]
async fn test_unsafe_query_text_is_rejected() {
    let db = seeded_db(10);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::sql("SELECT * FROM items; DROP TABLE items");

    assert!(connector.plan_splits(&query).await.is_err());
    assert_eq!(db.row_count(ITEMS), 10);
}

// ==================== Estimate Tests ====================

#[tokio::test]
async fn test_stale_statistics_fall_back_to_count() {
    let db = seeded_db(1000);
    db.set_stale_statistics(true);
    let mut config = fast_config();
    config.target_split_size = 250;
    let connector = connector(&db, config);
    let query = QueryDescriptor::table(None, ITEMS).with_order_by("name");

    let splits = connector.plan_splits(&query).await.unwrap();
    assert_eq!(splits.len(), 4);
    assert!(splits
        .iter()
        .all(|s| matches!(s.bounds(), SplitBounds::OffsetWindow { .. })));
}

#[tokio::test]
async fn test_estimate_timeout_degrades_to_single_split() {
    let db = seeded_db(1000);
    db.set_query_delay(Some(Duration::from_millis(500)));
    let mut config = fast_config();
    config.estimate_timeout_ms = 20;
    let connector = connector(&db, config);
    let query = QueryDescriptor::table(None, ITEMS)
        .with_partition_column("id")
        .with_num_partitions(8);

    let splits = connector.plan_splits(&query).await.unwrap();
    assert_eq!(splits.len(), 1);
    assert!(matches!(splits[0].bounds(), SplitBounds::Whole));
}

#[tokio::test]
async fn test_transient_estimate_failure_degrades_to_single_split() {
    let db = seeded_db(100);
    db.fail_next_queries(5);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS).with_partition_column("id");

    let splits = connector.plan_splits(&query).await.unwrap();
    assert_eq!(splits.len(), 1);
    assert!(matches!(splits[0].bounds(), SplitBounds::Whole));
}

#[tokio::test]
async fn test_empty_table_plans_one_empty_split() {
    let db = seeded_db(0);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS)
        .with_partition_column("id")
        .with_schema(items_schema());

    let mut handle = connector.read(&query).await.unwrap();
    assert!(drain_ids(&mut handle).await.is_empty());
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.splits_completed, 1);
    assert_eq!(summary.rows, 0);
}

// ==================== Schema Tests ====================

#[tokio::test]
async fn test_schema_is_inferred_from_sample() {
    let db = seeded_db(50);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS).with_inferred_schema(10);

    let schema = connector.resolve_schema(&query).await.unwrap();
    let columns: Vec<(&str, &SqlType)> = schema
        .columns()
        .iter()
        .map(|c| (c.name.as_str(), &c.sql_type))
        .collect();
    assert_eq!(
        columns,
        vec![("id", &SqlType::BigInt), ("name", &SqlType::Text)]
    );
}

#[tokio::test]
async fn test_explicit_schema_is_not_queried() {
    let db = seeded_db(10);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS).with_schema(items_schema());

    let before = db.counters().queries;
    let schema = connector.resolve_schema(&query).await.unwrap();
    assert_eq!(schema.len(), 2);
    assert_eq!(db.counters().queries, before);
}

// ==================== Re-split Tests ====================

#[tokio::test]
async fn test_request_resplit_of_suspended_reader() {
    let db = seeded_db(400);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS)
        .with_partition_column("id")
        .with_num_partitions(1)
        .with_schema(items_schema());

    let splits = connector.plan_splits(&query).await.unwrap();
    let split = Arc::clone(&splits[0]);
    let mut reader = connector
        .read_split(&query, Arc::clone(&split), None)
        .await
        .unwrap();

    let mut ids = Vec::new();
    while ids.len() < 100 {
        if let ReadItem::Row(record) = reader.pull().await.unwrap() {
            ids.push(record_id(&record));
        }
    }
    let checkpoint = reader.suspend().unwrap();

    let children = connector.request_resplit(&split, &checkpoint, 3).unwrap();
    assert_eq!(children.len(), 3);
    let state = connector
        .arena(query.id())
        .unwrap()
        .lock()
        .state(split.id())
        .unwrap();
    assert_eq!(state, SplitState::Replaced);

    for child in children {
        let mut reader = connector.read_split(&query, child, None).await.unwrap();
        while let ReadItem::Row(record) = reader.pull().await.unwrap() {
            ids.push(record_id(&record));
        }
    }
    assert_eq!(ids, (0..400).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_request_resplit_inside_a_key_group() {
    let db = grouped_db(100);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, EVENTS)
        .with_partition_column("grp")
        .with_num_partitions(1)
        .with_schema(events_schema());

    let splits = connector.plan_splits(&query).await.unwrap();
    let split = Arc::clone(&splits[0]);
    let mut reader = connector
        .read_split(&query, Arc::clone(&split), None)
        .await
        .unwrap();

    let mut ids = Vec::new();
    while ids.len() < 33 {
        if let ReadItem::Row(record) = reader.pull().await.unwrap() {
            ids.push(record_id(&record));
        }
    }
    let checkpoint = reader.suspend().unwrap();

    let children = connector.request_resplit(&split, &checkpoint, 3).unwrap();
    assert_eq!(children.len(), 3);
    for child in children {
        let mut reader = connector.read_split(&query, child, None).await.unwrap();
        while let ReadItem::Row(record) = reader.pull().await.unwrap() {
            ids.push(record_id(&record));
        }
    }
    assert_eq!(ids, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_split_of_other_query_is_rejected() {
    let db = seeded_db(10);
    let connector = connector(&db, fast_config());
    let first = QueryDescriptor::table(None, ITEMS).with_partition_column("id");
    let second = QueryDescriptor::table(None, ITEMS).with_partition_column("id");

    let splits = connector.plan_splits(&first).await.unwrap();
    let err = connector
        .read_split(&second, Arc::clone(&splits[0]), None)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Split);
}

#[tokio::test]
async fn test_resume_requires_a_plan() {
    let db = seeded_db(10);
    let connector = connector(&db, fast_config());
    let query = QueryDescriptor::table(None, ITEMS).with_partition_column("id");

    let err = connector
        .resume(&query, Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Split);
}
