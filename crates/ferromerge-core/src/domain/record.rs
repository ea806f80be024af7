use std::collections::BTreeMap;

use ferromerge_warehouse::{FeatureKey, GroupWrite, SourceType, WarehouseError};
use serde::{Deserialize, Serialize};

use crate::domain::{normalize_date, EntityKey, UtcDateTime};
use crate::ValidationError;

/// Staging-cache key: one source's view of one entity on one date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub source: SourceType,
    pub entity: EntityKey,
    pub date: String,
}

/// One normalized unit of data from one source.
///
/// Column names are qualified catalog names of the source's group; values are
/// always finite. Records are immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    source: SourceType,
    entity: EntityKey,
    observed_at: UtcDateTime,
    date: String,
    columns: BTreeMap<String, f64>,
}

impl SourceRecord {
    /// Build a record, qualifying short column names with the group prefix.
    pub fn new<I, K>(
        source: SourceType,
        entity: EntityKey,
        observed_at: UtcDateTime,
        columns: I,
    ) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let group = source.group();
        let mut qualified = BTreeMap::new();
        for (name, value) in columns {
            let name = name.as_ref();
            let Some(column) = group.qualify(name) else {
                return Err(ValidationError::ForeignColumn {
                    column: name.to_owned(),
                    group: source.as_str(),
                });
            };
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue {
                    column: column.to_owned(),
                });
            }
            qualified.insert(column.to_owned(), value);
        }

        Ok(Self {
            source,
            entity,
            date: observed_at.date(),
            observed_at,
            columns: qualified,
        })
    }

    /// Override the calendar date the record is merged under.
    pub fn with_date(mut self, date: &str) -> Result<Self, ValidationError> {
        self.date = normalize_date(date)?;
        Ok(self)
    }

    pub const fn source(&self) -> SourceType {
        self.source
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub const fn observed_at(&self) -> UtcDateTime {
        self.observed_at
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn columns(&self) -> &BTreeMap<String, f64> {
        &self.columns
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            source: self.source,
            entity: self.entity.clone(),
            date: self.date.clone(),
        }
    }

    pub fn feature_key(&self) -> Result<FeatureKey, WarehouseError> {
        FeatureKey::new(self.entity.as_str(), self.date.as_str())
    }

    /// Group write carrying every column of the record.
    pub fn to_group_write(&self) -> GroupWrite {
        self.columns.iter().fold(
            GroupWrite::new(self.source, self.observed_at.unix_millis()),
            |write, (column, value)| write.with_value(column.as_str(), Some(*value)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed() -> UtcDateTime {
        UtcDateTime::parse("2025-10-20T14:00:00Z").expect("timestamp")
    }

    fn btc() -> EntityKey {
        EntityKey::parse("BTC").expect("entity")
    }

    #[test]
    fn qualifies_short_column_names() {
        let record = SourceRecord::new(
            SourceType::Price,
            btc(),
            observed(),
            [("close", 67_000.0), ("price_open", 66_500.0)],
        )
        .expect("record");

        assert_eq!(record.columns().get("price_close"), Some(&67_000.0));
        assert_eq!(record.columns().get("price_open"), Some(&66_500.0));
        assert_eq!(record.date(), "2025-10-20");
    }

    #[test]
    fn rejects_columns_of_another_group() {
        let err = SourceRecord::new(SourceType::Sentiment, btc(), observed(), [("close", 1.0)])
            .expect_err("must fail");
        assert!(matches!(err, ValidationError::ForeignColumn { .. }));
    }

    #[test]
    fn rejects_non_finite_values() {
        let err = SourceRecord::new(SourceType::Price, btc(), observed(), [("close", f64::NAN)])
            .expect_err("must fail");
        assert!(matches!(err, ValidationError::NonFiniteValue { .. }));
    }

    #[test]
    fn explicit_date_overrides_observed_date() {
        let record = SourceRecord::new(SourceType::Macro, btc(), observed(), [("dxy", 104.2)])
            .expect("record")
            .with_date("2025-10-19")
            .expect("date");

        assert_eq!(record.cache_key().date, "2025-10-19");
        let write = record.to_group_write();
        assert_eq!(write.observed_at_ms, observed().unix_millis());
        assert_eq!(write.values.get("macro_dxy"), Some(&Some(104.2)));
    }
}
