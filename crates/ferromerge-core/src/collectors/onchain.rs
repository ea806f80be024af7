use serde::Deserialize;

use crate::collector::{Collector, FetchFuture, Normalized, RawPayload};
use crate::domain::{EntityKey, SourceType, UtcDateTime};

use super::{build_record, cursor_query, entity_list, parse_entries, HttpSource};

#[derive(Debug, Deserialize)]
struct MetricEntry {
    asset: String,
    #[serde(default)]
    date: Option<String>,
    observed_at: UtcDateTime,
    #[serde(default)]
    active_addresses: Option<f64>,
    #[serde(default)]
    transaction_count: Option<f64>,
    #[serde(default)]
    hash_rate: Option<f64>,
    #[serde(default)]
    exchange_netflow: Option<f64>,
}

/// Network activity metrics from an on-chain data provider.
#[derive(Debug, Clone)]
pub struct OnchainCollector {
    http: HttpSource,
    entities: Vec<EntityKey>,
}

impl OnchainCollector {
    pub fn new(http: HttpSource, entities: Vec<EntityKey>) -> Self {
        Self { http, entities }
    }
}

impl Collector for OnchainCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Onchain
    }

    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a> {
        Box::pin(async move {
            let mut query = vec![("assets", entity_list(&self.entities))];
            query.extend(cursor_query(cursor));
            self.http.get("/v1/metrics", &query).await
        })
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        let mut normalized = Normalized::default();
        for metric in parse_entries::<MetricEntry>(payload, "metrics", &mut normalized) {
            let negative_count = [metric.active_addresses, metric.transaction_count]
                .into_iter()
                .flatten()
                .any(|count| count < 0.0);
            if negative_count {
                normalized.drop_one("metrics", "negative count");
                continue;
            }
            let record = build_record(
                SourceType::Onchain,
                &metric.asset,
                metric.observed_at,
                metric.date.as_deref(),
                [
                    ("active_addresses", metric.active_addresses),
                    ("transaction_count", metric.transaction_count),
                    ("hash_rate", metric.hash_rate),
                    ("exchange_netflow", metric.exchange_netflow),
                ],
            );
            normalized.push(record, "metrics");
        }
        normalized
    }
}
