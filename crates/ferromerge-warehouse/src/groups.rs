//! Column-group catalog.
//!
//! Every feature column belongs to exactly one source type. The catalog is the
//! only place column names are defined; SQL built from it never interpolates
//! caller-provided identifiers.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WarehouseError;

/// Upstream source type. Each owns one disjoint column group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Price,
    Sentiment,
    Technical,
    Macro,
    Onchain,
    Derivatives,
}

impl SourceType {
    pub const ALL: [Self; 6] = [
        Self::Price,
        Self::Sentiment,
        Self::Technical,
        Self::Macro,
        Self::Onchain,
        Self::Derivatives,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Sentiment => "sentiment",
            Self::Technical => "technical",
            Self::Macro => "macro",
            Self::Onchain => "onchain",
            Self::Derivatives => "derivatives",
        }
    }

    /// Column group owned by this source.
    pub fn group(self) -> &'static ColumnGroup {
        &GROUPS[self as usize]
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = WarehouseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "price" => Ok(Self::Price),
            "sentiment" | "news" => Ok(Self::Sentiment),
            "technical" => Ok(Self::Technical),
            "macro" => Ok(Self::Macro),
            "onchain" | "on_chain" => Ok(Self::Onchain),
            "derivatives" => Ok(Self::Derivatives),
            other => Err(WarehouseError::UnknownSource(other.to_owned())),
        }
    }
}

/// Disjoint set of feature columns owned by one source type.
#[derive(Debug)]
pub struct ColumnGroup {
    pub source: SourceType,
    pub columns: &'static [&'static str],
    /// Unix-millisecond observation time of the last record merged into the group.
    pub observed_at_column: &'static str,
}

impl ColumnGroup {
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    /// Resolve a short (`close`) or qualified (`price_close`) column name.
    pub fn qualify(&self, column: &str) -> Option<&'static str> {
        if let Some(found) = self.columns.iter().copied().find(|name| *name == column) {
            return Some(found);
        }

        let prefix = self.source.as_str();
        self.columns.iter().copied().find(|name| {
            name.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|short| short == column)
        })
    }
}

/// Source type owning a qualified column, if any.
pub fn owner_of(column: &str) -> Option<SourceType> {
    SourceType::ALL
        .into_iter()
        .find(|source| source.group().contains(column))
}

static GROUPS: [ColumnGroup; 6] = [
    ColumnGroup {
        source: SourceType::Price,
        columns: &[
            "price_open",
            "price_high",
            "price_low",
            "price_close",
            "price_volume",
        ],
        observed_at_column: "price_observed_at",
    },
    ColumnGroup {
        source: SourceType::Sentiment,
        columns: &[
            "sentiment_avg_score",
            "sentiment_article_count",
            "sentiment_positive_ratio",
        ],
        observed_at_column: "sentiment_observed_at",
    },
    ColumnGroup {
        source: SourceType::Technical,
        columns: &[
            "technical_rsi_14",
            "technical_macd",
            "technical_macd_signal",
            "technical_sma_20",
            "technical_ema_50",
        ],
        observed_at_column: "technical_observed_at",
    },
    ColumnGroup {
        source: SourceType::Macro,
        columns: &[
            "macro_fed_funds_rate",
            "macro_cpi_yoy",
            "macro_dxy",
            "macro_us10y",
        ],
        observed_at_column: "macro_observed_at",
    },
    ColumnGroup {
        source: SourceType::Onchain,
        columns: &[
            "onchain_active_addresses",
            "onchain_transaction_count",
            "onchain_hash_rate",
            "onchain_exchange_netflow",
        ],
        observed_at_column: "onchain_observed_at",
    },
    ColumnGroup {
        source: SourceType::Derivatives,
        columns: &[
            "derivatives_funding_rate",
            "derivatives_open_interest",
            "derivatives_long_short_ratio",
        ],
        observed_at_column: "derivatives_observed_at",
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn groups_are_indexed_by_source() {
        for source in SourceType::ALL {
            assert_eq!(source.group().source, source);
        }
    }

    #[test]
    fn groups_are_disjoint() {
        let mut seen = HashSet::new();
        for source in SourceType::ALL {
            for column in source.group().columns {
                assert!(seen.insert(*column), "column {column} appears twice");
            }
            assert!(seen.insert(source.group().observed_at_column));
        }
    }

    #[test]
    fn qualifies_short_and_full_names() {
        let group = SourceType::Price.group();
        assert_eq!(group.qualify("close"), Some("price_close"));
        assert_eq!(group.qualify("price_close"), Some("price_close"));
        assert_eq!(group.qualify("avg_score"), None);
        assert_eq!(
            SourceType::Technical.group().qualify("rsi_14"),
            Some("technical_rsi_14")
        );
    }

    #[test]
    fn finds_owner_of_column() {
        assert_eq!(owner_of("sentiment_avg_score"), Some(SourceType::Sentiment));
        assert_eq!(owner_of("avg_score"), None);
    }

    #[test]
    fn parses_source_aliases() {
        assert_eq!("news".parse::<SourceType>().ok(), Some(SourceType::Sentiment));
        assert_eq!(" OnChain ".parse::<SourceType>().ok(), Some(SourceType::Onchain));
        assert!(matches!(
            "weather".parse::<SourceType>(),
            Err(WarehouseError::UnknownSource(_))
        ));
    }
}
