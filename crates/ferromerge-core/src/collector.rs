//! Collector contract and structured source errors.
//!
//! A collector fetches a raw payload from one upstream source and normalizes
//! it into [`SourceRecord`]s. Collectors never talk to the materializer; they
//! only publish into the staging cache (see [`crate::collectors::collect_once`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use ferromerge_core::{Collector, SourceError};
//!
//! async fn poll(collector: &dyn Collector) -> Result<usize, SourceError> {
//!     let payload = collector.fetch(None).await?;
//!     let normalized = collector.normalize(&payload);
//!     Ok(normalized.records.len())
//! }
//! ```

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::domain::{SourceRecord, SourceType, UtcDateTime};

/// Failure classification shared by collectors, the resilience wrapper and
/// the materializer's store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    SourceUnavailable,
    SchemaMismatch,
    RateLimited,
    StoreWriteFailure,
    CircuitOpen,
    Timeout,
    Unauthorized,
    InvalidRequest,
    Internal,
}

impl SourceErrorKind {
    /// Transient failures are retried by the resilience wrapper.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable | Self::RateLimited | Self::Timeout | Self::StoreWriteFailure
        )
    }

    /// Failures that count toward the circuit breaker threshold.
    pub const fn trips_breaker(self) -> bool {
        !matches!(self, Self::SchemaMismatch | Self::CircuitOpen)
    }
}

/// Structured source error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    retryable: bool,
}

impl SourceError {
    fn with_kind(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::SourceUnavailable, message)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::SchemaMismatch, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::RateLimited, message)
    }

    pub fn store_write_failure(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::StoreWriteFailure, message)
    }

    pub fn circuit_open(name: &str) -> Self {
        Self::with_kind(
            SourceErrorKind::CircuitOpen,
            format!("circuit for '{name}' is open"),
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::Timeout, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::Unauthorized, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_kind(SourceErrorKind::Internal, message)
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::SourceUnavailable => "source.unavailable",
            SourceErrorKind::SchemaMismatch => "source.schema_mismatch",
            SourceErrorKind::RateLimited => "source.rate_limited",
            SourceErrorKind::StoreWriteFailure => "store.write_failure",
            SourceErrorKind::CircuitOpen => "circuit.open",
            SourceErrorKind::Timeout => "source.timeout",
            SourceErrorKind::Unauthorized => "source.unauthorized",
            SourceErrorKind::InvalidRequest => "source.invalid_request",
            SourceErrorKind::Internal => "source.internal",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

/// Raw upstream payload as received, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub source: SourceType,
    pub body: String,
    pub received_at: UtcDateTime,
}

impl RawPayload {
    pub fn new(source: SourceType, body: impl Into<String>) -> Self {
        Self {
            source,
            body: body.into(),
            received_at: UtcDateTime::now(),
        }
    }

    /// Whether the payload carries any content worth normalizing.
    pub fn is_blank(&self) -> bool {
        let trimmed = self.body.trim();
        trimmed.is_empty() || trimmed == "{}" || trimmed == "[]"
    }
}

/// Output of [`Collector::normalize`]: parsed records plus the count of
/// malformed entries that were dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub records: Vec<SourceRecord>,
    pub dropped: usize,
    /// Set when the payload envelope itself did not match the expected shape.
    pub mismatch: Option<String>,
}

impl Normalized {
    pub fn mismatched(reason: impl Into<String>) -> Self {
        Self {
            mismatch: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Zero records parsed out of a payload that had content.
    pub fn is_schema_mismatch(&self) -> bool {
        self.records.is_empty() && (self.dropped > 0 || self.mismatch.is_some())
    }

    pub fn push(&mut self, record: Result<SourceRecord, impl Display>, context: &str) {
        match record {
            Ok(record) => self.records.push(record),
            Err(error) => {
                tracing::debug!(context, %error, "dropping malformed entry");
                self.dropped += 1;
            }
        }
    }

    pub fn drop_one(&mut self, context: &str, reason: &str) {
        tracing::debug!(context, reason, "dropping malformed entry");
        self.dropped += 1;
    }
}

/// Boxed future returned by [`Collector::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<RawPayload, SourceError>> + Send + 'a>>;

/// Source collector contract.
pub trait Collector: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Fetch everything newer than `cursor` (the last successful run).
    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a>;

    /// Parse a payload. Malformed entries are dropped and counted, never fatal.
    fn normalize(&self, payload: &RawPayload) -> Normalized;
}
