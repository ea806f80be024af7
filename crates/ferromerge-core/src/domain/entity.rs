use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_ENTITY_LEN: usize = 24;

/// Normalized entity identifier (asset ticker, pair base, index name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    /// Parse and normalize an entity key to uppercase.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEntity);
        }

        let normalized = trimmed.to_ascii_uppercase();
        let len = normalized.chars().count();
        if len > MAX_ENTITY_LEN {
            return Err(ValidationError::EntityTooLong {
                len,
                max: MAX_ENTITY_LEN,
            });
        }

        if let Some(first) = normalized.chars().next() {
            if !first.is_ascii_alphabetic() {
                return Err(ValidationError::EntityInvalidStart { ch: first });
            }
        }

        for (index, ch) in normalized.chars().enumerate() {
            let valid = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_');
            if !valid {
                return Err(ValidationError::EntityInvalidChar { ch, index });
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EntityKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for EntityKey {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EntityKey> for String {
    fn from(value: EntityKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_entity() {
        let parsed = EntityKey::parse(" btc ").expect("entity should parse");
        assert_eq!(parsed.as_str(), "BTC");
    }

    #[test]
    fn accepts_index_style_names() {
        assert!(EntityKey::parse("SPX_500").is_ok());
        assert!(EntityKey::parse("BRK.B").is_ok());
    }

    #[test]
    fn rejects_invalid_start() {
        let err = EntityKey::parse("1INCH").expect_err("must fail");
        assert!(matches!(err, ValidationError::EntityInvalidStart { .. }));
    }

    #[test]
    fn rejects_invalid_chars() {
        let err = EntityKey::parse("BTC/USD").expect_err("must fail");
        assert!(matches!(
            err,
            ValidationError::EntityInvalidChar { ch: '/', index: 3 }
        ));
    }
}
