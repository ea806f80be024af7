use serde::Deserialize;

use crate::collector::{Collector, FetchFuture, Normalized, RawPayload};
use crate::domain::{EntityKey, SourceType, UtcDateTime};

use super::{build_record, cursor_query, parse_entries, HttpSource};

const QUOTE_SUFFIXES: [&str; 3] = ["USDT", "PERP", "USD"];

#[derive(Debug, Deserialize)]
struct ContractEntry {
    symbol: String,
    #[serde(default)]
    date: Option<String>,
    observed_at: UtcDateTime,
    #[serde(default)]
    funding_rate: Option<f64>,
    #[serde(default)]
    open_interest: Option<f64>,
    #[serde(default)]
    long_short_ratio: Option<f64>,
}

/// Perpetual-futures positioning data.
#[derive(Debug, Clone)]
pub struct DerivativesCollector {
    http: HttpSource,
    entities: Vec<EntityKey>,
}

impl DerivativesCollector {
    pub fn new(http: HttpSource, entities: Vec<EntityKey>) -> Self {
        Self { http, entities }
    }
}

/// `BTCUSDT` and `BTC-PERP` both name `BTC`.
fn base_asset(symbol: &str) -> &str {
    let symbol = symbol.trim();
    for suffix in QUOTE_SUFFIXES {
        if let Some(base) = symbol.strip_suffix(suffix) {
            let base = base.trim_end_matches(['-', '_', '/']);
            if !base.is_empty() {
                return base;
            }
        }
    }
    symbol
}

impl Collector for DerivativesCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Derivatives
    }

    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a> {
        Box::pin(async move {
            let symbols = self
                .entities
                .iter()
                .map(|entity| format!("{entity}USDT"))
                .collect::<Vec<_>>()
                .join(",");
            let mut query = vec![("symbols", symbols)];
            query.extend(cursor_query(cursor));
            self.http.get("/v1/contracts", &query).await
        })
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        let mut normalized = Normalized::default();
        for contract in parse_entries::<ContractEntry>(payload, "contracts", &mut normalized) {
            if contract.open_interest.is_some_and(|oi| oi < 0.0) {
                normalized.drop_one("contracts", "negative open interest");
                continue;
            }
            let symbol = contract.symbol.to_ascii_uppercase();
            let record = build_record(
                SourceType::Derivatives,
                base_asset(&symbol),
                contract.observed_at,
                contract.date.as_deref(),
                [
                    ("funding_rate", contract.funding_rate),
                    ("open_interest", contract.open_interest),
                    ("long_short_ratio", contract.long_short_ratio),
                ],
            );
            normalized.push(record, "contracts");
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::ScriptedHttpClient;
    use std::sync::Arc;

    #[test]
    fn strips_quote_currency_suffixes() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("ETH-PERP"), "ETH");
        assert_eq!(base_asset("SOLUSD"), "SOL");
        assert_eq!(base_asset("USDT"), "USDT");
        assert_eq!(base_asset("BTC"), "BTC");
    }

    #[test]
    fn normalizes_contracts_to_base_entities() {
        let collector = DerivativesCollector::new(
            HttpSource::new(
                SourceType::Derivatives,
                Arc::new(ScriptedHttpClient::always_json("{}")),
                "https://perp.test",
            ),
            vec![EntityKey::parse("BTC").expect("entity")],
        );
        let payload = RawPayload::new(
            SourceType::Derivatives,
            r#"{"contracts":[
                {"symbol":"btcusdt","observed_at":"2025-10-20T08:00:00Z","funding_rate":0.0001,"open_interest":8.2e9}
            ]}"#,
        );

        let normalized = collector.normalize(&payload);

        assert_eq!(normalized.records.len(), 1);
        let record = &normalized.records[0];
        assert_eq!(record.entity().as_str(), "BTC");
        assert_eq!(record.columns().get("derivatives_funding_rate"), Some(&0.0001));
    }
}
