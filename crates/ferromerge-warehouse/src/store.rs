//! Feature store contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::groups::SourceType;
use crate::row::{FeatureKey, FeatureRow, GroupWrite, UpsertOutcome};
use crate::WarehouseError;

/// Audit entry for one key merged by the materializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeLogEntry {
    pub run_id: String,
    pub source: SourceType,
    pub key: FeatureKey,
    pub status: &'static str,
    pub observed_at_ms: i64,
}

/// Keyed table whose only write primitive is an atomic column-group upsert.
///
/// Implementations must apply `upsert_partial` as a single atomic operation:
/// concurrent writes from different sources to the same key never interleave,
/// and a write never touches columns outside its group.
pub trait FeatureStore: Send + Sync {
    /// Create the row if absent (other groups null) or overwrite only the
    /// write's group, unless the stored group was observed later.
    fn upsert_partial(
        &self,
        key: &FeatureKey,
        write: &GroupWrite,
    ) -> Result<UpsertOutcome, WarehouseError>;

    fn read(&self, key: &FeatureKey) -> Result<Option<FeatureRow>, WarehouseError>;

    /// All rows for one entity ordered by date.
    fn entity_rows(&self, entity: &str) -> Result<Vec<FeatureRow>, WarehouseError>;

    fn record_merge(&self, entry: &MergeLogEntry) -> Result<(), WarehouseError> {
        let _ = entry;
        Ok(())
    }
}

/// Process-local feature store guarded by a single mutex.
#[derive(Debug, Default)]
pub struct MemoryFeatureStore {
    rows: Mutex<BTreeMap<FeatureKey, FeatureRow>>,
    merge_log: Mutex<Vec<MergeLogEntry>>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .expect("feature store lock is not poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn merge_log(&self) -> Vec<MergeLogEntry> {
        self.merge_log
            .lock()
            .expect("merge log lock is not poisoned")
            .clone()
    }
}

impl FeatureStore for MemoryFeatureStore {
    fn upsert_partial(
        &self,
        key: &FeatureKey,
        write: &GroupWrite,
    ) -> Result<UpsertOutcome, WarehouseError> {
        write.validate()?;
        let mut rows = self.rows.lock().expect("feature store lock is not poisoned");
        let row = rows
            .entry(key.clone())
            .or_insert_with(|| FeatureRow::empty(key.clone()));
        Ok(row.apply(write))
    }

    fn read(&self, key: &FeatureKey) -> Result<Option<FeatureRow>, WarehouseError> {
        let rows = self.rows.lock().expect("feature store lock is not poisoned");
        Ok(rows.get(key).cloned())
    }

    fn entity_rows(&self, entity: &str) -> Result<Vec<FeatureRow>, WarehouseError> {
        let rows = self.rows.lock().expect("feature store lock is not poisoned");
        Ok(rows
            .values()
            .filter(|row| row.key.entity() == entity)
            .cloned()
            .collect())
    }

    fn record_merge(&self, entry: &MergeLogEntry) -> Result<(), WarehouseError> {
        self.merge_log
            .lock()
            .expect("merge log lock is not poisoned")
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key() -> FeatureKey {
        FeatureKey::new("ETH", "2025-10-21").expect("valid key")
    }

    #[test]
    fn first_write_creates_row_with_other_groups_absent() {
        let store = MemoryFeatureStore::new();
        store
            .upsert_partial(
                &key(),
                &GroupWrite::new(SourceType::Onchain, 5).with_value("onchain_hash_rate", Some(1.5)),
            )
            .expect("upsert");

        let row = store.read(&key()).expect("read").expect("row exists");
        assert_eq!(row.value("onchain_hash_rate"), Some(1.5));
        assert!(row.group(SourceType::Price).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_writers_from_different_sources_do_not_clobber() {
        let store = Arc::new(MemoryFeatureStore::new());
        let handles = SourceType::ALL
            .into_iter()
            .map(|source| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for observed in 0..50 {
                        let column = source.group().columns[0];
                        let write = GroupWrite::new(source, observed)
                            .with_value(column, Some(observed as f64));
                        store.upsert_partial(&key(), &write).expect("upsert");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let row = store.read(&key()).expect("read").expect("row exists");
        for source in SourceType::ALL {
            assert_eq!(row.value(source.group().columns[0]), Some(49.0));
        }
    }

    #[test]
    fn rejects_write_with_foreign_column() {
        let store = MemoryFeatureStore::new();
        let write = GroupWrite::new(SourceType::Sentiment, 1).with_value("price_close", Some(1.0));
        assert!(store.upsert_partial(&key(), &write).is_err());
        assert!(store.is_empty());
    }
}
