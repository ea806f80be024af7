use serde::Deserialize;

use crate::collector::{Collector, FetchFuture, Normalized, RawPayload};
use crate::domain::{EntityKey, SourceType, UtcDateTime};

use super::{build_record, cursor_query, entity_list, parse_entries, HttpSource};

#[derive(Debug, Deserialize)]
struct IndicatorEntry {
    symbol: String,
    #[serde(default)]
    date: Option<String>,
    observed_at: UtcDateTime,
    #[serde(default)]
    rsi_14: Option<f64>,
    #[serde(default)]
    macd: Option<f64>,
    #[serde(default)]
    macd_signal: Option<f64>,
    #[serde(default)]
    sma_20: Option<f64>,
    #[serde(default)]
    ema_50: Option<f64>,
}

/// Precomputed technical indicators.
#[derive(Debug, Clone)]
pub struct TechnicalCollector {
    http: HttpSource,
    entities: Vec<EntityKey>,
}

impl TechnicalCollector {
    pub fn new(http: HttpSource, entities: Vec<EntityKey>) -> Self {
        Self { http, entities }
    }
}

impl Collector for TechnicalCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Technical
    }

    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a> {
        Box::pin(async move {
            let mut query = vec![("symbols", entity_list(&self.entities))];
            query.extend(cursor_query(cursor));
            self.http.get("/v1/indicators", &query).await
        })
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        let mut normalized = Normalized::default();
        for entry in parse_entries::<IndicatorEntry>(payload, "indicators", &mut normalized) {
            if entry.rsi_14.is_some_and(|rsi| !(0.0..=100.0).contains(&rsi)) {
                normalized.drop_one("indicators", "rsi outside [0, 100]");
                continue;
            }
            let record = build_record(
                SourceType::Technical,
                &entry.symbol,
                entry.observed_at,
                entry.date.as_deref(),
                [
                    ("rsi_14", entry.rsi_14),
                    ("macd", entry.macd),
                    ("macd_signal", entry.macd_signal),
                    ("sma_20", entry.sma_20),
                    ("ema_50", entry.ema_50),
                ],
            );
            normalized.push(record, "indicators");
        }
        normalized
    }
}
