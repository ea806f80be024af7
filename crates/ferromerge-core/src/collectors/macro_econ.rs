use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::collector::{Collector, FetchFuture, Normalized, RawPayload};
use crate::domain::{normalize_date, EntityKey, SourceType, UtcDateTime};

use super::{build_record, cursor_query, parse_entries, HttpSource};

/// Upstream series id to short column name.
const SERIES: [(&str, &str); 4] = [
    ("DFF", "fed_funds_rate"),
    ("CPI_YOY", "cpi_yoy"),
    ("DXY", "dxy"),
    ("DGS10", "us10y"),
];

#[derive(Debug, Deserialize)]
struct ObservationEntry {
    series: String,
    date: String,
    value: Value,
}

/// Macro indicators. Values are market-wide, so each day's observations are
/// fanned out to every configured entity.
#[derive(Debug, Clone)]
pub struct MacroCollector {
    http: HttpSource,
    entities: Vec<EntityKey>,
}

impl MacroCollector {
    pub fn new(http: HttpSource, entities: Vec<EntityKey>) -> Self {
        Self { http, entities }
    }
}

fn series_column(series: &str) -> Option<&'static str> {
    SERIES
        .iter()
        .find(|(id, _)| id.eq_ignore_ascii_case(series))
        .map(|(_, column)| *column)
}

/// Numbers or numeric strings; `"."` marks a missing upstream value.
fn observation_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|value| value.is_finite())
}

impl Collector for MacroCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Macro
    }

    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a> {
        Box::pin(async move {
            let series = SERIES.iter().map(|(id, _)| *id).collect::<Vec<_>>().join(",");
            let mut query = vec![("series", series)];
            query.extend(cursor_query(cursor));
            self.http.get("/v1/observations", &query).await
        })
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        let mut normalized = Normalized::default();
        let mut daily: BTreeMap<String, Vec<(&'static str, Option<f64>)>> = BTreeMap::new();

        for entry in parse_entries::<ObservationEntry>(payload, "observations", &mut normalized) {
            let Some(column) = series_column(&entry.series) else {
                normalized.drop_one("observations", "unknown series");
                continue;
            };
            let Some(value) = observation_value(&entry.value) else {
                normalized.drop_one("observations", "missing or non-numeric value");
                continue;
            };
            let Ok(date) = normalize_date(&entry.date) else {
                normalized.drop_one("observations", "invalid date");
                continue;
            };
            daily.entry(date).or_default().push((column, Some(value)));
        }

        for (date, columns) in daily {
            let observed_at = match UtcDateTime::parse_date(&date) {
                Ok(observed_at) => observed_at,
                Err(_) => continue,
            };
            for entity in &self.entities {
                let record = build_record(
                    SourceType::Macro,
                    entity.as_str(),
                    observed_at,
                    Some(&date),
                    columns.iter().copied(),
                );
                normalized.push(record, "observations");
            }
        }
        normalized
    }
}
