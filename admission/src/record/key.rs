//! Entity identity derived from record attributes.

use super::attributes::{keys, Attributes};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Category assigned when a record does not name one.
pub const DEFAULT_CATEGORY: &str = "default";

/// Identity of a telemetry record used for every keyed-state lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Database identifier.
    pub database: String,
    /// Query fingerprint, when the record is about a single statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Telemetry category (e.g. `query_metrics`, `errors`).
    pub category: String,
}

impl EntityKey {
    /// Creates a key for a database and category.
    pub fn new(database: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            query: None,
            category: category.into(),
        }
    }

    /// Attaches a query fingerprint.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Derives a key from attributes. Returns `None` without a database identifier.
    #[must_use]
    pub fn derive(attributes: &Attributes) -> Option<Self> {
        let database = attributes.get_non_empty(keys::DB_NAME)?;
        let category = attributes
            .get_non_empty(keys::CATEGORY)
            .unwrap_or(DEFAULT_CATEGORY);
        let query = attributes
            .get_non_empty(keys::QUERY_FINGERPRINT)
            .map(str::to_owned);
        Some(Self {
            database: database.to_owned(),
            query,
            category: category.to_owned(),
        })
    }

    /// Maps the key into `[0, 1)`.
    ///
    /// The mapping is a SHA-256 digest of a length-delimited encoding, so it is
    /// identical across processes, restarts, and platforms.
    #[must_use]
    pub fn unit_hash(&self) -> f64 {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, self.database.as_bytes());
        write_field(&mut hasher, self.category.as_bytes());
        match &self.query {
            Some(query) => {
                hasher.update([1u8]);
                write_field(&mut hasher, query.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        digest_to_unit(&hasher.finalize())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.category)?;
        if let Some(query) = &self.query {
            write!(f, "/{query}")?;
        }
        Ok(())
    }
}

pub(crate) fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Reads the leading eight bytes of a digest as a big-endian integer.
pub(crate) fn digest_to_u64(digest: &[u8]) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Converts the leading 53 bits of a digest into a float in `[0, 1)`.
pub(crate) fn digest_to_unit(digest: &[u8]) -> f64 {
    let bits = digest_to_u64(digest) >> 11;
    bits as f64 / (1u64 << 53) as f64
}
