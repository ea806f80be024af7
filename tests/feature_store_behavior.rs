//! Behavior-driven tests for the feature store
//!
//! Every property is checked against both the in-memory store and the
//! `DuckDB` warehouse, since the materializer treats them interchangeably.

use std::sync::Arc;

use ferromerge_core::{
    FeatureKey, FeatureStore, GroupFreshness, GroupWrite, MemoryFeatureStore, SourceType,
    UpsertOutcome, Warehouse, WarehouseConfig, WarehouseError,
};
use tempfile::{tempdir, TempDir};

fn stores() -> Vec<(&'static str, Arc<dyn FeatureStore>, Option<TempDir>)> {
    let temp = tempdir().expect("tempdir");
    let warehouse = Warehouse::open(WarehouseConfig {
        ferromerge_home: temp.path().to_path_buf(),
        db_path: temp.path().join("features.duckdb"),
        max_pool_size: 4,
    })
    .expect("warehouse open");

    vec![
        ("memory", Arc::new(MemoryFeatureStore::new()), None),
        ("duckdb", Arc::new(warehouse), Some(temp)),
    ]
}

fn key() -> FeatureKey {
    FeatureKey::new("BTC", "2025-10-20").expect("key")
}

fn price(observed_at_ms: i64, close: f64) -> GroupWrite {
    GroupWrite::new(SourceType::Price, observed_at_ms)
        .with_value("price_close", Some(close))
        .with_value("price_volume", Some(1_250.0))
}

// =============================================================================
// Partial upsert: creation and idempotence
// =============================================================================

#[test]
fn when_first_source_writes_a_key_the_row_holds_only_that_group() {
    for (name, store, _guard) in stores() {
        // Given: An empty store
        // When: The price group is written for a new key
        let outcome = store.upsert_partial(&key(), &price(1_000, 67_000.0)).expect(name);

        // Then: The row exists with only the price group populated
        assert_eq!(outcome, UpsertOutcome::Applied, "{name}");
        let row = store.read(&key()).expect(name).expect("row");
        assert_eq!(row.value("price_close"), Some(67_000.0), "{name}");
        for other in [SourceType::Sentiment, SourceType::Technical, SourceType::Macro] {
            assert!(row.group(other).is_none(), "{name}: {other} should be absent");
        }
    }
}

#[test]
fn when_the_same_record_is_merged_twice_the_row_is_unchanged() {
    for (name, store, _guard) in stores() {
        // Given: A row written once
        store.upsert_partial(&key(), &price(1_000, 67_000.0)).expect(name);
        let once = store.read(&key()).expect(name).expect("row");

        // When: The identical write is replayed
        store.upsert_partial(&key(), &price(1_000, 67_000.0)).expect(name);
        let twice = store.read(&key()).expect(name).expect("row");

        // Then: Nothing accumulates
        assert_eq!(once, twice, "{name}");
    }
}

// =============================================================================
// Group isolation
// =============================================================================

#[test]
fn when_another_source_writes_the_key_existing_groups_are_untouched() {
    for (name, store, _guard) in stores() {
        // Given: A row with the price group
        store.upsert_partial(&key(), &price(1_000, 67_000.0)).expect(name);

        // When: Sentiment writes the same key, observed later
        let sentiment = GroupWrite::new(SourceType::Sentiment, 5_000)
            .with_value("sentiment_avg_score", Some(0.4));
        store.upsert_partial(&key(), &sentiment).expect(name);

        // Then: Both groups are present and price kept its values
        let row = store.read(&key()).expect(name).expect("row");
        assert_eq!(row.value("price_close"), Some(67_000.0), "{name}");
        assert_eq!(row.value("price_volume"), Some(1_250.0), "{name}");
        assert_eq!(row.value("sentiment_avg_score"), Some(0.4), "{name}");
        assert_eq!(row.observed_at(SourceType::Price), Some(1_000), "{name}");
        assert_eq!(row.observed_at(SourceType::Sentiment), Some(5_000), "{name}");
        assert_eq!(row.value("technical_rsi_14"), None, "{name}");
    }
}

#[test]
fn when_a_write_names_a_foreign_column_it_is_rejected() {
    for (name, store, _guard) in stores() {
        // Given: A sentiment write smuggling a price column
        let write = GroupWrite::new(SourceType::Sentiment, 1)
            .with_value("price_close", Some(1.0));

        // When / Then: The store refuses it and creates no row
        let error = store.upsert_partial(&key(), &write).expect_err(name);
        assert!(matches!(error, WarehouseError::ForeignColumn { .. }), "{name}: {error}");
        assert!(store.read(&key()).expect(name).is_none(), "{name}");
    }
}

// =============================================================================
// Last-observed-wins
// =============================================================================

#[test]
fn when_two_observations_arrive_in_either_order_the_later_one_wins() {
    for (name, store, _guard) in stores() {
        let early = FeatureKey::new("ETH", "2025-10-20").expect("key");
        let late = FeatureKey::new("SOL", "2025-10-20").expect("key");

        // Given: The same pair of writes applied in opposite orders to two keys
        store.upsert_partial(&early, &price(100, 1.0)).expect(name);
        store.upsert_partial(&early, &price(200, 2.0)).expect(name);

        store.upsert_partial(&late, &price(200, 2.0)).expect(name);
        let outcome = store.upsert_partial(&late, &price(100, 1.0)).expect(name);

        // Then: Both rows reflect the later observation
        assert_eq!(outcome, UpsertOutcome::Superseded, "{name}");
        for key in [&early, &late] {
            let row = store.read(key).expect(name).expect("row");
            assert_eq!(row.value("price_close"), Some(2.0), "{name}: {key}");
            assert_eq!(row.observed_at(SourceType::Price), Some(200), "{name}: {key}");
        }
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn when_every_source_writes_the_same_key_concurrently_no_group_is_lost() {
    for (name, store, _guard) in stores() {
        // Given: One writer thread per source, all targeting the same key
        std::thread::scope(|scope| {
            for (index, source) in SourceType::ALL.into_iter().enumerate() {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    let column = source.group().columns[0];
                    for round in 0..10_i64 {
                        let write = GroupWrite::new(source, round)
                            .with_value(column, Some(index as f64 + round as f64));
                        store.upsert_partial(&key(), &write).expect("concurrent upsert");
                    }
                });
            }
        });

        // Then: Every group holds its writer's final value
        let row = store.read(&key()).expect(name).expect("row");
        for (index, source) in SourceType::ALL.into_iter().enumerate() {
            let column = source.group().columns[0];
            assert_eq!(row.value(column), Some(index as f64 + 9.0), "{name}: {column}");
            assert_eq!(row.observed_at(source), Some(9), "{name}: {source}");
        }
    }
}

// =============================================================================
// Freshness and reads
// =============================================================================

#[test]
fn when_a_group_is_older_than_its_window_it_reports_stale() {
    for (name, store, _guard) in stores() {
        // Given: A price group observed at t=1000ms
        store.upsert_partial(&key(), &price(1_000, 67_000.0)).expect(name);
        let row = store.read(&key()).expect(name).expect("row");

        // Then: Freshness is explicit for present, old and absent groups
        assert_eq!(row.freshness(SourceType::Price, 1_500, 1_000), GroupFreshness::Fresh, "{name}");
        assert_eq!(row.freshness(SourceType::Price, 9_000, 1_000), GroupFreshness::Stale, "{name}");
        assert_eq!(
            row.freshness(SourceType::Onchain, 1_500, 1_000),
            GroupFreshness::Missing,
            "{name}"
        );
    }
}

#[test]
fn when_reading_an_entity_rows_come_back_in_date_order() {
    for (name, store, _guard) in stores() {
        // Given: Three dates written out of order
        for date in ["2025-10-22", "2025-10-20", "2025-10-21"] {
            let key = FeatureKey::new("BTC", date).expect("key");
            store.upsert_partial(&key, &price(1, 1.0)).expect(name);
        }
        store
            .upsert_partial(&FeatureKey::new("ETH", "2025-10-20").expect("key"), &price(1, 1.0))
            .expect(name);

        // When: The entity's rows are listed
        let rows = store.entity_rows("BTC").expect(name);

        // Then: Only that entity, oldest first
        let dates = rows.iter().map(|row| row.key.date().to_owned()).collect::<Vec<_>>();
        assert_eq!(dates, vec!["2025-10-20", "2025-10-21", "2025-10-22"], "{name}");
    }
}

// =============================================================================
// Column-scoped group writes
// =============================================================================

#[test]
fn when_a_later_poll_reports_fewer_columns_earlier_columns_survive() {
    for (name, store, _guard) in stores() {
        // Given: Macro values for the day, stamped at midnight
        let midnight = 1_760_918_400_000;
        let first_poll = GroupWrite::new(SourceType::Macro, midnight)
            .with_value("macro_fed_funds_rate", Some(4.33))
            .with_value("macro_us10y", Some(4.01));
        store.upsert_partial(&key(), &first_poll).expect(name);

        // When: The next poll for the same day only carries CPI
        let second_poll =
            GroupWrite::new(SourceType::Macro, midnight).with_value("macro_cpi_yoy", Some(3.0));
        let outcome = store.upsert_partial(&key(), &second_poll).expect(name);

        // Then: CPI lands and the earlier series are kept
        assert_eq!(outcome, UpsertOutcome::Applied, "{name}");
        let row = store.read(&key()).expect(name).expect("row");
        assert_eq!(row.value("macro_fed_funds_rate"), Some(4.33), "{name}");
        assert_eq!(row.value("macro_us10y"), Some(4.01), "{name}");
        assert_eq!(row.value("macro_cpi_yoy"), Some(3.0), "{name}");
        assert_eq!(row.value("macro_dxy"), None, "{name}");
    }
}

#[test]
fn when_an_older_partial_write_arrives_no_column_of_the_group_changes() {
    for (name, store, _guard) in stores() {
        // Given: A price group observed at t=200
        store.upsert_partial(&key(), &price(200, 2.0)).expect(name);

        // When: An older write names a column the stored group never had set
        let stale = GroupWrite::new(SourceType::Price, 100).with_value("price_open", Some(1.5));
        let outcome = store.upsert_partial(&key(), &stale).expect(name);

        // Then: The group guard rejects the whole write
        assert_eq!(outcome, UpsertOutcome::Superseded, "{name}");
        let row = store.read(&key()).expect(name).expect("row");
        assert_eq!(row.value("price_open"), None, "{name}");
        assert_eq!(row.value("price_close"), Some(2.0), "{name}");
    }
}
