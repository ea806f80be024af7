use ferromerge_warehouse::WarehouseError;
use thiserror::Error;

/// Validation and contract errors exposed by `ferromerge-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entity key cannot be empty")]
    EmptyEntity,
    #[error("entity key length {len} exceeds max {max}")]
    EntityTooLong { len: usize, max: usize },
    #[error("entity key must start with an ASCII letter: '{ch}'")]
    EntityInvalidStart { ch: char },
    #[error("entity key contains invalid character '{ch}' at index {index}")]
    EntityInvalidChar { ch: char, index: usize },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("timestamp is out of range: {millis}ms")]
    TimestampOutOfRange { millis: i64 },
    #[error("date must be YYYY-MM-DD: '{value}'")]
    InvalidDate { value: String },

    #[error("column '{column}' does not belong to the {group} group")]
    ForeignColumn { column: String, group: &'static str },
    #[error("column '{column}' must be finite")]
    NonFiniteValue { column: String },
    #[error("record carries no values")]
    EmptyRecord,
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
