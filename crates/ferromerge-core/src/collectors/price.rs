use serde::Deserialize;

use crate::collector::{Collector, FetchFuture, Normalized, RawPayload};
use crate::domain::{EntityKey, SourceType, UtcDateTime};

use super::{build_record, cursor_query, entity_list, parse_entries, HttpSource};

#[derive(Debug, Deserialize)]
struct BarEntry {
    symbol: String,
    #[serde(default)]
    date: Option<String>,
    observed_at: UtcDateTime,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

/// Daily OHLCV bars from an exchange price API.
#[derive(Debug, Clone)]
pub struct PriceCollector {
    http: HttpSource,
    entities: Vec<EntityKey>,
}

impl PriceCollector {
    pub fn new(http: HttpSource, entities: Vec<EntityKey>) -> Self {
        Self { http, entities }
    }
}

impl Collector for PriceCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Price
    }

    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a> {
        Box::pin(async move {
            let mut query = vec![("symbols", entity_list(&self.entities))];
            query.extend(cursor_query(cursor));
            self.http.get("/v1/bars", &query).await
        })
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        let mut normalized = Normalized::default();
        for bar in parse_entries::<BarEntry>(payload, "bars", &mut normalized) {
            let bounds_ok = match (bar.high, bar.low) {
                (Some(high), Some(low)) => high >= low,
                _ => true,
            };
            if !bounds_ok {
                normalized.drop_one("bars", "high below low");
                continue;
            }

            let record = build_record(
                SourceType::Price,
                &bar.symbol,
                bar.observed_at,
                bar.date.as_deref(),
                [
                    ("open", bar.open),
                    ("high", bar.high),
                    ("low", bar.low),
                    ("close", bar.close),
                    ("volume", bar.volume),
                ],
            );
            normalized.push(record, "bars");
        }
        normalized
    }
}
