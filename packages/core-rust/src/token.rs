//! Expiry-queue tokens.
//!
//! A token is the string `"<insertion-epoch-millis>-<fromId>"`. Tokens for
//! the same number of timestamp digits sort by insertion time, which is what
//! lets the expiry queue stop at the first unexpired entry.

use std::fmt;

use thiserror::Error;

/// Why a token could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token has no timestamp separator: {0:?}")]
    MissingSeparator(String),
    #[error("token timestamp is not a number: {0:?}")]
    BadTimestamp(String),
}

/// A parsed expiry-queue token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryToken {
    pub inserted_at: u64,
    pub from_id: String,
}

impl ExpiryToken {
    #[must_use]
    pub fn new(inserted_at: u64, from_id: impl Into<String>) -> Self {
        Self {
            inserted_at,
            from_id: from_id.into(),
        }
    }

    /// Parses `"<millis>-<fromId>"`, splitting at the first `-`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] when the separator is missing or leading, or
    /// when the timestamp part is not an unsigned integer.
    ///
    /// # Examples
    ///
    /// ```
    /// use idmap_core::ExpiryToken;
    ///
    /// let token = ExpiryToken::parse("1700000000000-a-b").unwrap();
    /// assert_eq!(token.inserted_at, 1_700_000_000_000);
    /// assert_eq!(token.from_id, "a-b");
    /// assert!(ExpiryToken::parse("-abc").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let Some(sep) = raw.find('-').filter(|&i| i > 0) else {
            return Err(TokenError::MissingSeparator(raw.to_string()));
        };
        let inserted_at = raw[..sep]
            .parse::<u64>()
            .map_err(|_| TokenError::BadTimestamp(raw.to_string()))?;
        Ok(Self {
            inserted_at,
            from_id: raw[sep + 1..].to_string(),
        })
    }
}

impl fmt::Display for ExpiryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.inserted_at, self.from_id)
    }
}
