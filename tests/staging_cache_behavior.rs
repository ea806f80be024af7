//! Behavior-driven tests for the staging cache

use std::time::Duration;

use ferromerge_core::{
    EntityKey, PartitionPolicy, SourceRecord, SourceType, StagingCache, UtcDateTime,
};

fn record(source: SourceType, entity: &str, value: f64) -> SourceRecord {
    let column = source.group().columns[0];
    SourceRecord::new(
        source,
        EntityKey::parse(entity).expect("entity"),
        UtcDateTime::parse("2025-10-20T08:00:00Z").expect("timestamp"),
        [(column, value)],
    )
    .expect("record")
}

fn cache(ttl: Duration, max_entries: usize) -> StagingCache {
    StagingCache::new(PartitionPolicy { ttl, max_entries })
}

const ENTITIES: [&str; 5] = ["BTC", "ETH", "SOL", "ADA", "XRP"];

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn when_capacity_is_exceeded_by_one_exactly_the_earliest_entry_is_evicted() {
    // Given: A price partition holding four entries
    let cache = cache(Duration::from_secs(600), 4);
    for (index, entity) in ENTITIES[..4].iter().enumerate() {
        let outcome = cache.publish(record(SourceType::Price, entity, index as f64)).await;
        assert!(outcome.evicted.is_none());
    }

    // When: A fifth distinct key is inserted
    let outcome = cache.publish(record(SourceType::Price, "XRP", 4.0)).await;

    // Then: Only BTC, the first insert, is gone
    assert_eq!(
        outcome.evicted.map(|key| key.entity.to_string()),
        Some(String::from("BTC"))
    );
    assert_eq!(cache.len(SourceType::Price).await, 4);
    assert_eq!(cache.evictions(SourceType::Price).await, 1);
}

#[tokio::test]
async fn when_a_full_partition_receives_an_existing_key_nothing_is_evicted() {
    // Given: A full partition
    let cache = cache(Duration::from_secs(600), 2);
    cache.publish(record(SourceType::Price, "BTC", 1.0)).await;
    cache.publish(record(SourceType::Price, "ETH", 2.0)).await;

    // When: BTC is written again
    let outcome = cache.publish(record(SourceType::Price, "BTC", 3.0)).await;

    // Then: The value is replaced and BTC moves to the back of the order
    assert!(outcome.replaced);
    assert!(outcome.evicted.is_none());
    let order = cache
        .get_all(SourceType::Price)
        .await
        .into_iter()
        .map(|record| record.entity().to_string())
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["ETH", "BTC"]);

    // And: The next new key evicts ETH rather than the rewritten BTC
    let outcome = cache.publish(record(SourceType::Price, "SOL", 4.0)).await;
    assert_eq!(
        outcome.evicted.map(|key| key.entity.to_string()),
        Some(String::from("ETH"))
    );
}

#[tokio::test]
async fn when_one_partition_overflows_other_partitions_are_untouched() {
    // Given: Price and macro partitions sharing a capacity of two
    let cache = cache(Duration::from_secs(600), 2);
    cache.publish(record(SourceType::Macro, "BTC", 5.25)).await;
    cache.publish(record(SourceType::Macro, "ETH", 5.25)).await;

    // When: Price receives more keys than it can hold
    for (index, entity) in ENTITIES.iter().enumerate() {
        cache.publish(record(SourceType::Price, entity, index as f64)).await;
    }

    // Then: Macro still holds both entries
    assert_eq!(cache.len(SourceType::Macro).await, 2);
    assert_eq!(cache.evictions(SourceType::Macro).await, 0);
    assert_eq!(cache.evictions(SourceType::Price).await, 3);
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_the_partition_ttl_elapses_entries_read_as_misses() {
    // Given: A 10s TTL partition with one entry
    let cache = cache(Duration::from_secs(10), 8);
    let btc = record(SourceType::Sentiment, "BTC", 0.4);
    cache.publish(btc.clone()).await;

    // When: Time advances just short of the TTL
    tokio::time::advance(Duration::from_secs(9)).await;

    // Then: The entry is still live
    assert_eq!(cache.get(&btc.cache_key()).await, Some(btc.clone()));

    // When: The TTL passes
    tokio::time::advance(Duration::from_secs(2)).await;

    // Then: The read is a miss and the entry is removed
    assert!(cache.get(&btc.cache_key()).await.is_none());
    assert_eq!(cache.len(SourceType::Sentiment).await, 0);
    assert_eq!(cache.stats().await[&SourceType::Sentiment].expirations, 1);
}

#[tokio::test(start_paused = true)]
async fn when_listing_a_partition_expired_entries_are_skipped() {
    // Given: One short-lived and one long-lived entry
    let cache = cache(Duration::from_secs(60), 8);
    let short = record(SourceType::Price, "BTC", 1.0);
    cache
        .put(short.cache_key(), short, Some(Duration::from_secs(1)))
        .await;
    cache.publish(record(SourceType::Price, "ETH", 2.0)).await;

    // When: The short TTL elapses
    tokio::time::advance(Duration::from_secs(2)).await;

    // Then: Only the live entry is listed
    let live = cache.get_all(SourceType::Price).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].entity().as_str(), "ETH");
}

#[tokio::test(start_paused = true)]
async fn when_the_sweeper_runs_it_purges_every_partition() {
    // Given: Expiring entries in two partitions
    let cache = cache(Duration::from_secs(5), 8);
    cache.publish(record(SourceType::Price, "BTC", 1.0)).await;
    cache.publish(record(SourceType::Onchain, "BTC", 900_000.0)).await;

    // When: The sweeper ticks after the TTL
    let sweeper = cache.spawn_sweeper(Duration::from_secs(3));
    tokio::time::sleep(Duration::from_secs(7)).await;

    // Then: Both partitions are empty without any read
    assert!(cache.is_empty().await);
    sweeper.abort();
}

// =============================================================================
// Ordering and concurrency
// =============================================================================

#[tokio::test]
async fn when_listing_a_partition_entries_come_back_in_insertion_order() {
    // Given: Five entries inserted in a known order
    let cache = cache(Duration::from_secs(600), 16);
    for (index, entity) in ENTITIES.iter().enumerate() {
        cache.publish(record(SourceType::Derivatives, entity, index as f64)).await;
    }

    // When: The oldest is read, which must not reorder anything
    let first = record(SourceType::Derivatives, "BTC", 0.0);
    assert!(cache.get(&first.cache_key()).await.is_some());

    // Then: get_all follows insertion order
    let order = cache
        .get_all(SourceType::Derivatives)
        .await
        .into_iter()
        .map(|record| record.entity().to_string())
        .collect::<Vec<_>>();
    assert_eq!(order, ENTITIES);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_collectors_publish_concurrently_every_entry_lands() {
    // Given: One task per source publishing five entities each
    let cache = cache(Duration::from_secs(600), 64);
    let tasks = SourceType::ALL
        .into_iter()
        .map(|source| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for (index, entity) in ENTITIES.iter().enumerate() {
                    cache.publish(record(source, entity, index as f64)).await;
                }
            })
        })
        .collect::<Vec<_>>();

    // When: All tasks complete
    for task in tasks {
        task.await.expect("publisher task");
    }

    // Then: Each partition holds exactly its five entries
    for source in SourceType::ALL {
        assert_eq!(cache.len(source).await, ENTITIES.len(), "{source}");
        assert_eq!(cache.evictions(source).await, 0, "{source}");
    }
}
