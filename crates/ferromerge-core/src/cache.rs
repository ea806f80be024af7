//! Staging cache for collector output.
//!
//! Partitioned by source type. Each partition has its own TTL and entry
//! ceiling; inserting beyond the ceiling evicts the least-recently-inserted
//! entry of that partition. Reads never reorder entries. Expired entries are
//! purged lazily on access and by [`StagingCache::sweep_expired`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::{CacheKey, SourceRecord, SourceType};

/// TTL and size bound of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPolicy {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 1024,
        }
    }
}

/// Result of a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// An entry with the same key was overwritten.
    pub replaced: bool,
    /// Key evicted to respect the partition ceiling.
    pub evicted: Option<CacheKey>,
}

/// Per-partition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub entries: usize,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: SourceRecord,
    sequence: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct Partition {
    policy: PartitionPolicy,
    entries: HashMap<CacheKey, CacheEntry>,
    insertion_order: BTreeMap<u64, CacheKey>,
    evictions: u64,
    expirations: u64,
}

impl Partition {
    fn new(policy: PartitionPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            insertion_order: BTreeMap::new(),
            evictions: 0,
            expirations: 0,
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.insertion_order.remove(&entry.sequence);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn stats(&self) -> PartitionStats {
        PartitionStats {
            entries: self.entries.len(),
            evictions: self.evictions,
            expirations: self.expirations,
        }
    }
}

#[derive(Debug)]
struct CacheInner {
    default_policy: PartitionPolicy,
    partitions: HashMap<SourceType, Partition>,
    next_sequence: u64,
}

impl CacheInner {
    fn partition_mut(&mut self, source: SourceType) -> &mut Partition {
        let policy = self.default_policy;
        self.partitions
            .entry(source)
            .or_insert_with(|| Partition::new(policy))
    }
}

/// Thread-safe, type-partitioned staging cache.
#[derive(Debug, Clone)]
pub struct StagingCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl Default for StagingCache {
    fn default() -> Self {
        Self::new(PartitionPolicy::default())
    }
}

impl StagingCache {
    /// Create a cache; partitions without an explicit policy use `default_policy`.
    pub fn new(default_policy: PartitionPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                default_policy,
                partitions: HashMap::new(),
                next_sequence: 0,
            })),
        }
    }

    pub fn with_policies(
        default_policy: PartitionPolicy,
        policies: impl IntoIterator<Item = (SourceType, PartitionPolicy)>,
    ) -> Self {
        let partitions = policies
            .into_iter()
            .map(|(source, policy)| (source, Partition::new(policy)))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                default_policy,
                partitions,
                next_sequence: 0,
            })),
        }
    }

    pub async fn policy(&self, source: SourceType) -> PartitionPolicy {
        let inner = self.inner.read().await;
        inner
            .partitions
            .get(&source)
            .map_or(inner.default_policy, |partition| partition.policy)
    }

    /// Insert or overwrite `key`. A `ttl` of `None` uses the partition TTL.
    pub async fn put(&self, key: CacheKey, record: SourceRecord, ttl: Option<Duration>) -> PutOutcome {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let partition = inner.partition_mut(key.source);
        let ttl = ttl.unwrap_or(partition.policy.ttl);
        let replaced = partition.remove(&key).is_some();

        let mut evicted = None;
        if !replaced && partition.entries.len() >= partition.policy.max_entries.max(1) {
            if let Some((_, oldest)) = partition.insertion_order.pop_first() {
                partition.entries.remove(&oldest);
                partition.evictions += 1;
                tracing::debug!(source = %key.source, entity = %oldest.entity, date = %oldest.date, "staging cache evicted oldest entry");
                evicted = Some(oldest);
            }
        }

        partition.insertion_order.insert(sequence, key.clone());
        partition.entries.insert(
            key,
            CacheEntry {
                record,
                sequence,
                expires_at: now + ttl,
            },
        );

        PutOutcome { replaced, evicted }
    }

    /// Publish a record under its own cache key with the partition TTL.
    pub async fn publish(&self, record: SourceRecord) -> PutOutcome {
        self.put(record.cache_key(), record, None).await
    }

    /// Fetch a live entry. An expired entry is removed and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<SourceRecord> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let partition = inner.partitions.get_mut(&key.source)?;
        let entry = partition.entries.get(key)?;
        if entry.expires_at > now {
            return Some(entry.record.clone());
        }

        partition.remove(key);
        partition.expirations += 1;
        None
    }

    /// Live entries of one partition in insertion order.
    pub async fn get_all(&self, source: SourceType) -> Vec<SourceRecord> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let Some(partition) = inner.partitions.get_mut(&source) else {
            return Vec::new();
        };
        partition.purge_expired(now);
        partition
            .insertion_order
            .values()
            .filter_map(|key| partition.entries.get(key))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Purge expired entries in every partition; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner
            .partitions
            .values_mut()
            .map(|partition| partition.purge_expired(now))
            .sum()
    }

    /// Entry count of one partition, expired entries included until purged.
    pub async fn len(&self, source: SourceType) -> usize {
        let inner = self.inner.read().await;
        inner
            .partitions
            .get(&source)
            .map_or(0, |partition| partition.entries.len())
    }

    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.read().await;
        inner
            .partitions
            .values()
            .all(|partition| partition.entries.is_empty())
    }

    pub async fn evictions(&self, source: SourceType) -> u64 {
        let inner = self.inner.read().await;
        inner
            .partitions
            .get(&source)
            .map_or(0, |partition| partition.evictions)
    }

    pub async fn stats(&self) -> BTreeMap<SourceType, PartitionStats> {
        let inner = self.inner.read().await;
        inner
            .partitions
            .iter()
            .map(|(source, partition)| (*source, partition.stats()))
            .collect()
    }

    /// Run [`Self::sweep_expired`] every `period` until the handle is aborted.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "staging cache sweep purged expired entries");
                }
            }
        })
    }
}
