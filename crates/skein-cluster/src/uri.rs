//! Canonical queue uris
//!
//! A queue is identified by `skein://<domain>/<queue>`. Only the canonical
//! form (lowercase scheme, no query, no trailing slash) is accepted by the
//! queue helper; everything downstream relies on uri equality.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

const SCHEME: &str = "skein://";

/// Maximum length of a uri segment (domain or queue name)
pub const MAX_SEGMENT_LENGTH: usize = 255;

/// Regex for uri segments: must start alphanumeric (lowercase), then
/// alphanumeric, dots, hyphens, underscores, tildes
static SEGMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._~-]{0,254}$").unwrap());

/// Canonical queue uri
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueUri {
    canonical: String,
    domain_len: usize,
}

impl QueueUri {
    /// Parse a uri, rejecting any non-canonical spelling
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidUri(format!("missing `{SCHEME}` scheme: {input}")))?;

        let (domain, queue) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidUri(format!("missing queue segment: {input}")))?;

        for segment in [domain, queue] {
            Self::validate_segment(segment, input)?;
        }

        Ok(Self {
            canonical: input.to_string(),
            domain_len: domain.len(),
        })
    }

    fn validate_segment(segment: &str, input: &str) -> Result<()> {
        if segment.len() > MAX_SEGMENT_LENGTH {
            return Err(Error::InvalidUri(format!(
                "segment too long: {} chars (max {MAX_SEGMENT_LENGTH}): {input}",
                segment.len()
            )));
        }
        if !SEGMENT_REGEX.is_match(segment) {
            return Err(Error::InvalidUri(format!(
                "segments must start alphanumeric and contain only [a-z0-9._~-]: {input}"
            )));
        }
        if segment.contains("..") {
            return Err(Error::InvalidUri(format!(
                "path traversal patterns not allowed: {input}"
            )));
        }
        Ok(())
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Domain the queue belongs to
    pub fn domain(&self) -> &str {
        &self.canonical[SCHEME.len()..SCHEME.len() + self.domain_len]
    }

    /// Queue name within the domain
    pub fn queue(&self) -> &str {
        &self.canonical[SCHEME.len() + self.domain_len + 1..]
    }
}

impl fmt::Display for QueueUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl TryFrom<String> for QueueUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<QueueUri> for String {
    fn from(uri: QueueUri) -> Self {
        uri.canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let uri = QueueUri::parse("skein://acme/orders.v2").unwrap();
        assert_eq!(uri.domain(), "acme");
        assert_eq!(uri.queue(), "orders.v2");
        assert_eq!(uri.as_str(), "skein://acme/orders.v2");
    }

    #[test]
    fn test_reject_non_canonical() {
        assert!(QueueUri::parse("skein://acme").is_err());
        assert!(QueueUri::parse("skein://acme/").is_err());
        assert!(QueueUri::parse("skein:///orders").is_err());
        assert!(QueueUri::parse("other://acme/orders").is_err());
        assert!(QueueUri::parse("skein://Acme/orders").is_err());
        assert!(QueueUri::parse("skein://acme/orders?id=foo").is_err());
        assert!(QueueUri::parse("skein://acme/.orders").is_err());
    }

    #[test]
    fn test_reject_traversal_and_oversized_segments() {
        assert!(QueueUri::parse("skein://acme/orders..backup").is_err());

        let long = format!("skein://acme/{}", "q".repeat(MAX_SEGMENT_LENGTH + 1));
        assert!(QueueUri::parse(&long).is_err());

        let max = format!("skein://acme/{}", "q".repeat(MAX_SEGMENT_LENGTH));
        assert!(QueueUri::parse(&max).is_ok());
    }

    #[test]
    fn test_equality_is_canonical() {
        let a = QueueUri::parse("skein://acme/orders").unwrap();
        let b = QueueUri::parse("skein://acme/orders").unwrap();
        assert_eq!(a, b);

        let c = QueueUri::parse("skein://acme/orders2").unwrap();
        assert_ne!(a, c);
    }
}
