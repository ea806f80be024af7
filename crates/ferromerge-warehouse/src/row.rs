//! Feature rows, keys, and column-group writes.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::groups::SourceType;
use crate::WarehouseError;

/// Primary key of a feature row: one entity on one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureKey {
    entity: String,
    date: String,
}

impl FeatureKey {
    /// Build a key from an entity identifier and a `YYYY-MM-DD` date.
    pub fn new(entity: impl Into<String>, date: impl Into<String>) -> Result<Self, WarehouseError> {
        let entity = entity.into();
        let date = date.into();
        if entity.trim().is_empty() {
            return Err(WarehouseError::InvalidData(String::from(
                "feature key entity must not be empty",
            )));
        }
        if !is_iso_date(&date) {
            return Err(WarehouseError::InvalidData(format!(
                "feature key date must be YYYY-MM-DD: '{date}'"
            )));
        }
        Ok(Self { entity, date })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn date(&self) -> &str {
        &self.date
    }
}

impl Display for FeatureKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.entity, self.date)
    }
}

fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    if !value.is_ascii() || bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &value[range];
        if part.bytes().all(|b| b.is_ascii_digit()) {
            part.parse().ok()
        } else {
            None
        }
    };
    matches!(
        (digits(0..4), digits(5..7), digits(8..10)),
        (Some(_), Some(month), Some(day)) if (1..=12).contains(&month) && (1..=31).contains(&day)
    )
}

/// Partial write covering columns of exactly one column group.
///
/// Only the columns named in `values` are assigned; other columns of the group
/// keep their stored value. An explicit `None` stores NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupWrite {
    pub source: SourceType,
    pub values: BTreeMap<String, Option<f64>>,
    pub observed_at_ms: i64,
}

impl GroupWrite {
    pub fn new(source: SourceType, observed_at_ms: i64) -> Self {
        Self {
            source,
            values: BTreeMap::new(),
            observed_at_ms,
        }
    }

    pub fn with_value(mut self, column: impl Into<String>, value: Option<f64>) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    /// Reject columns outside the source's group and non-finite values.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        let group = self.source.group();
        for (column, value) in &self.values {
            if !group.contains(column) {
                return Err(WarehouseError::ForeignColumn {
                    column: column.clone(),
                    owner: self.source,
                });
            }
            if value.is_some_and(|value| !value.is_finite()) {
                return Err(WarehouseError::InvalidData(format!(
                    "column '{column}' must be finite"
                )));
            }
        }
        Ok(())
    }

    /// Columns named by the write, as catalog identifiers in catalog order.
    pub fn assigned_values(&self) -> Vec<(&'static str, Option<f64>)> {
        self.source
            .group()
            .columns
            .iter()
            .filter_map(|column| self.values.get(*column).map(|value| (*column, *value)))
            .collect()
    }
}

/// Outcome of a partial upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// The group now reflects the write.
    Applied,
    /// The stored group was observed later than the write; nothing changed.
    Superseded,
}

/// Populated state of one column group inside a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub values: BTreeMap<String, Option<f64>>,
    pub observed_at_ms: i64,
}

/// Freshness of one group relative to a maximum age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupFreshness {
    Fresh,
    Stale,
    Missing,
}

/// Wide feature row: the union of every source's column group for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: FeatureKey,
    pub groups: BTreeMap<SourceType, GroupSnapshot>,
}

impl FeatureRow {
    pub fn empty(key: FeatureKey) -> Self {
        Self {
            key,
            groups: BTreeMap::new(),
        }
    }

    pub fn group(&self, source: SourceType) -> Option<&GroupSnapshot> {
        self.groups.get(&source)
    }

    pub fn observed_at(&self, source: SourceType) -> Option<i64> {
        self.group(source).map(|group| group.observed_at_ms)
    }

    /// Value of a qualified column; `None` when the group or column is null.
    pub fn value(&self, column: &str) -> Option<f64> {
        let owner = crate::groups::owner_of(column)?;
        self.group(owner)?.values.get(column).copied().flatten()
    }

    /// Apply a write with last-observed-wins semantics for its group.
    ///
    /// The group's observed-at decides whether the write lands at all; a
    /// landing write then overwrites only the columns it names.
    pub fn apply(&mut self, write: &GroupWrite) -> UpsertOutcome {
        if self
            .observed_at(write.source)
            .is_some_and(|current| current > write.observed_at_ms)
        {
            return UpsertOutcome::Superseded;
        }

        let snapshot = self.groups.entry(write.source).or_insert_with(|| GroupSnapshot {
            values: write
                .source
                .group()
                .columns
                .iter()
                .map(|column| ((*column).to_owned(), None))
                .collect(),
            observed_at_ms: write.observed_at_ms,
        });
        for (column, value) in write.assigned_values() {
            snapshot.values.insert(column.to_owned(), value);
        }
        snapshot.observed_at_ms = write.observed_at_ms;
        UpsertOutcome::Applied
    }

    pub fn freshness(&self, source: SourceType, now_ms: i64, max_age_ms: i64) -> GroupFreshness {
        match self.observed_at(source) {
            None => GroupFreshness::Missing,
            Some(observed) if now_ms.saturating_sub(observed) > max_age_ms => {
                GroupFreshness::Stale
            }
            Some(_) => GroupFreshness::Fresh,
        }
    }

    /// Flat JSON view with every catalog column (null when absent).
    pub fn to_flat_json(&self) -> Value {
        let mut object = Map::new();
        object.insert(String::from("entity"), Value::String(self.key.entity.clone()));
        object.insert(String::from("date"), Value::String(self.key.date.clone()));
        for source in SourceType::ALL {
            let group = source.group();
            let snapshot = self.group(source);
            for column in group.columns {
                let value = snapshot
                    .and_then(|snapshot| snapshot.values.get(*column).copied().flatten())
                    .and_then(Number::from_f64)
                    .map_or(Value::Null, Value::Number);
                object.insert((*column).to_owned(), value);
            }
            let observed = snapshot
                .map(|snapshot| Value::Number(Number::from(snapshot.observed_at_ms)))
                .unwrap_or(Value::Null);
            object.insert(group.observed_at_column.to_owned(), observed);
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FeatureKey {
        FeatureKey::new("BTC", "2025-10-20").expect("valid key")
    }

    #[test]
    fn rejects_malformed_dates() {
        assert!(FeatureKey::new("BTC", "2025-13-01").is_err());
        assert!(FeatureKey::new("BTC", "20251020").is_err());
        assert!(FeatureKey::new("", "2025-10-20").is_err());
    }

    #[test]
    fn write_rejects_foreign_columns() {
        let write = GroupWrite::new(SourceType::Price, 1).with_value("sentiment_avg_score", Some(0.1));
        assert!(matches!(
            write.validate(),
            Err(WarehouseError::ForeignColumn { .. })
        ));
    }

    #[test]
    fn apply_keeps_later_observation() {
        let mut row = FeatureRow::empty(key());
        let newer = GroupWrite::new(SourceType::Price, 200).with_value("price_close", Some(2.0));
        let older = GroupWrite::new(SourceType::Price, 100).with_value("price_close", Some(1.0));

        assert_eq!(row.apply(&newer), UpsertOutcome::Applied);
        assert_eq!(row.apply(&older), UpsertOutcome::Superseded);
        assert_eq!(row.value("price_close"), Some(2.0));
        assert_eq!(row.observed_at(SourceType::Price), Some(200));
    }

    #[test]
    fn apply_overwrites_only_named_columns() {
        let mut row = FeatureRow::empty(key());
        row.apply(&GroupWrite::new(SourceType::Price, 1).with_value("price_open", Some(1.0)));
        row.apply(&GroupWrite::new(SourceType::Price, 2).with_value("price_close", Some(3.0)));

        assert_eq!(row.value("price_open"), Some(1.0));
        assert_eq!(row.value("price_close"), Some(3.0));
        assert_eq!(row.observed_at(SourceType::Price), Some(2));

        row.apply(&GroupWrite::new(SourceType::Price, 3).with_value("price_open", None));
        assert_eq!(row.value("price_open"), None);
        assert_eq!(row.value("price_close"), Some(3.0));
    }

    #[test]
    fn freshness_reports_missing_and_stale_groups() {
        let mut row = FeatureRow::empty(key());
        row.apply(&GroupWrite::new(SourceType::Macro, 1_000));

        assert_eq!(row.freshness(SourceType::Macro, 1_500, 1_000), GroupFreshness::Fresh);
        assert_eq!(row.freshness(SourceType::Macro, 5_000, 1_000), GroupFreshness::Stale);
        assert_eq!(row.freshness(SourceType::Price, 5_000, 1_000), GroupFreshness::Missing);
    }

    #[test]
    fn flat_json_lists_every_catalog_column() {
        let mut row = FeatureRow::empty(key());
        row.apply(&GroupWrite::new(SourceType::Price, 7).with_value("price_close", Some(67_000.0)));
        let json = row.to_flat_json();

        assert_eq!(json["entity"], "BTC");
        assert_eq!(json["price_close"], 67_000.0);
        assert_eq!(json["price_observed_at"], 7);
        assert!(json["sentiment_avg_score"].is_null());
        assert!(json["technical_observed_at"].is_null());
    }
}
