//! Concrete collectors and the single-run collection driver.
//!
//! | Source | Endpoint | Envelope |
//! |--------|----------|----------|
//! | price | `/v1/bars` | `{"bars": [...]}` |
//! | sentiment | `/v1/articles` | `{"articles": [...]}` |
//! | technical | `/v1/indicators` | `{"indicators": [...]}` |
//! | macro | `/v1/observations` | `{"observations": [...]}` |
//! | onchain | `/v1/metrics` | `{"metrics": [...]}` |
//! | derivatives | `/v1/contracts` | `{"contracts": [...]}` |

mod derivatives;
mod macro_econ;
mod onchain;
mod price;
mod sentiment;
mod technical;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::StagingCache;
use crate::collector::{Collector, Normalized, RawPayload, SourceError};
use crate::domain::{EntityKey, SourceRecord, SourceType, UtcDateTime};
use crate::http_client::{HttpAuth, HttpClient, HttpErrorKind, HttpRequest};
use crate::resilience::ResilienceWrapper;
use crate::throttling::RequestBudget;
use crate::ValidationError;

pub use derivatives::DerivativesCollector;
pub use macro_econ::MacroCollector;
pub use onchain::OnchainCollector;
pub use price::PriceCollector;
pub use sentiment::SentimentCollector;
pub use technical::TechnicalCollector;

/// Outcome of one collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    pub records: usize,
    pub dropped: usize,
    pub published: usize,
    pub evicted: usize,
    pub schema_mismatch: bool,
}

/// Fetch through the resilience wrapper, normalize, and publish every record
/// to the staging cache in emission order.
pub async fn collect_once(
    collector: &dyn Collector,
    wrapper: &ResilienceWrapper,
    cache: &StagingCache,
    cursor: Option<UtcDateTime>,
) -> Result<CollectReport, SourceError> {
    let source = collector.source_type();
    let payload = wrapper.call(|| collector.fetch(cursor)).await?;
    let normalized = collector.normalize(&payload);

    let mut report = CollectReport {
        records: normalized.records.len(),
        dropped: normalized.dropped,
        schema_mismatch: normalized.is_schema_mismatch(),
        ..CollectReport::default()
    };
    if report.schema_mismatch {
        tracing::warn!(
            %source,
            dropped = normalized.dropped,
            reason = normalized.mismatch.as_deref().unwrap_or("every entry was malformed"),
            "payload parsed to zero records; possible schema mismatch"
        );
    } else if normalized.dropped > 0 {
        tracing::info!(%source, dropped = normalized.dropped, "dropped malformed entries");
    }

    for record in normalized.records {
        let outcome = cache.publish(record).await;
        report.published += 1;
        if outcome.evicted.is_some() {
            report.evicted += 1;
        }
    }

    Ok(report)
}

/// Build the collector for `source`.
pub fn build_collector(
    source: SourceType,
    http: HttpSource,
    entities: Vec<EntityKey>,
) -> Arc<dyn Collector> {
    match source {
        SourceType::Price => Arc::new(PriceCollector::new(http, entities)),
        SourceType::Sentiment => Arc::new(SentimentCollector::new(http, entities)),
        SourceType::Technical => Arc::new(TechnicalCollector::new(http, entities)),
        SourceType::Macro => Arc::new(MacroCollector::new(http, entities)),
        SourceType::Onchain => Arc::new(OnchainCollector::new(http, entities)),
        SourceType::Derivatives => Arc::new(DerivativesCollector::new(http, entities)),
    }
}

/// HTTP access shared by all collectors: base URL, auth, timeout and an
/// optional request budget.
#[derive(Clone)]
pub struct HttpSource {
    source: SourceType,
    client: Arc<dyn HttpClient>,
    base_url: String,
    auth: HttpAuth,
    timeout: Duration,
    budget: Option<RequestBudget>,
}

impl HttpSource {
    pub fn new(source: SourceType, client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            source,
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            auth: HttpAuth::None,
            timeout: Duration::from_secs(10),
            budget: None,
        }
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_budget(mut self, budget: RequestBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub const fn source(&self) -> SourceType {
        self.source
    }

    /// GET `path` with URL-encoded query parameters.
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<RawPayload, SourceError> {
        if let Some(budget) = &self.budget {
            budget.try_acquire(self.source.as_str())?;
        }

        let url = build_url(&self.base_url, path, query);
        let request = HttpRequest::get(url)
            .with_header("accept", "application/json")
            .with_auth(&self.auth)
            .with_timeout(self.timeout);

        let response = self.client.execute(request).await.map_err(|error| {
            let message = format!("{} transport error: {}", self.source, error.message());
            match error.kind() {
                HttpErrorKind::Timeout => SourceError::timeout(message),
                HttpErrorKind::Connect | HttpErrorKind::Other => SourceError::unavailable(message),
            }
        })?;

        if let Some(error) = classify_status(self.source, response.status) {
            return Err(error);
        }
        Ok(RawPayload::new(self.source, response.body))
    }
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("source", &self.source)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn build_url(base_url: &str, path: &str, query: &[(&str, String)]) -> String {
    let mut url = format!("{base_url}{path}");
    for (index, (name, value)) in query.iter().enumerate() {
        url.push(if index == 0 { '?' } else { '&' });
        url.push_str(name);
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }
    url
}

/// Map a non-2xx status to the failure taxonomy.
fn classify_status(source: SourceType, status: u16) -> Option<SourceError> {
    match status {
        200..=299 => None,
        429 => Some(SourceError::rate_limited(format!(
            "{source} upstream rate limited (429)"
        ))),
        401 | 403 => Some(SourceError::unauthorized(format!(
            "{source} upstream rejected credentials ({status})"
        ))),
        400..=499 => Some(SourceError::invalid_request(format!(
            "{source} upstream rejected request ({status})"
        ))),
        _ => Some(SourceError::unavailable(format!(
            "{source} upstream unavailable ({status})"
        ))),
    }
}

/// Comma-joined entity list for query strings.
fn entity_list(entities: &[EntityKey]) -> String {
    entities
        .iter()
        .map(EntityKey::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn cursor_query(cursor: Option<UtcDateTime>) -> Option<(&'static str, String)> {
    cursor.map(|cursor| ("since", cursor.format_rfc3339()))
}

/// Deserialize the array under `field`; entries that do not deserialize are
/// dropped and counted.
fn parse_entries<T: DeserializeOwned>(
    payload: &RawPayload,
    field: &str,
    normalized: &mut Normalized,
) -> Vec<T> {
    if payload.is_blank() {
        return Vec::new();
    }

    let envelope: Value = match serde_json::from_str(&payload.body) {
        Ok(value) => value,
        Err(error) => {
            normalized.mismatch = Some(format!("payload is not JSON: {error}"));
            return Vec::new();
        }
    };
    let Some(entries) = envelope.get(field).and_then(Value::as_array) else {
        normalized.mismatch = Some(format!("payload has no '{field}' array"));
        return Vec::new();
    };

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        match T::deserialize(entry) {
            Ok(value) => parsed.push(value),
            Err(error) => normalized.drop_one(field, &error.to_string()),
        }
    }
    parsed
}

/// Build a record from optional columns; absent values are skipped and a
/// record with no values at all is rejected.
fn build_record(
    source: SourceType,
    entity: &str,
    observed_at: UtcDateTime,
    date: Option<&str>,
    columns: impl IntoIterator<Item = (&'static str, Option<f64>)>,
) -> Result<SourceRecord, ValidationError> {
    let entity = EntityKey::parse(entity)?;
    let present = columns
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| (name, value)))
        .collect::<Vec<_>>();
    if present.is_empty() {
        return Err(ValidationError::EmptyRecord);
    }

    let record = SourceRecord::new(source, entity, observed_at, present)?;
    match date {
        Some(date) => record.with_date(date),
        None => Ok(record),
    }
}
