//! String attribute bag carried by every telemetry record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known attribute names read or written by the admission stages.
pub mod keys {
    /// Database identifier; required to derive an entity key.
    pub const DB_NAME: &str = "db.name";
    /// Normalised query fingerprint.
    pub const QUERY_FINGERPRINT: &str = "db.query.fingerprint";
    /// Telemetry category used for sampling targets.
    pub const CATEGORY: &str = "telemetry.category";
    /// Explicit error flag set by scrapers.
    pub const DB_ERROR: &str = "db.error";
    /// Error text reported by the database or the scraper.
    pub const ERROR_MESSAGE: &str = "error.message";
    /// Query latency in milliseconds.
    pub const QUERY_DURATION_MS: &str = "db.query.duration_ms";
    /// Tenant owning the record.
    pub const TENANT: &str = "tenant.id";
    /// Execution plan hash used for duplicate suppression.
    pub const PLAN_HASH: &str = "db.query.plan.hash";

    /// Sampling probability in effect when the record was admitted.
    pub const SAMPLING_PROBABILITY: &str = "dbintel.sampling.probability";
    /// Name of the sampling rule that admitted the record, if any.
    pub const SAMPLING_RULE: &str = "dbintel.sampling.rule";
    /// Circuit state of the record's entity when it passed the breaker.
    pub const CIRCUIT_STATE: &str = "dbintel.circuit.state";
    /// Set to `true` on records routed through the cost overflow path.
    pub const COST_OVERFLOW: &str = "dbintel.cost.overflow";
    /// Number of input records coalesced into an overflow record.
    pub const COST_OVERFLOW_COUNT: &str = "dbintel.cost.overflow_count";
}

/// Unordered string-to-string attribute map.
///
/// Values stay strings on the wire; the typed accessors parse on demand and
/// return `None` for missing or malformed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// Creates an empty attribute bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an attribute, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes an attribute, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Returns the raw string value of an attribute.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns a non-empty, trimmed string value.
    #[must_use]
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get_str(key).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Parses a boolean attribute (`true`/`false`/`1`/`0`, case-insensitive).
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let raw = self.get_str(key)?.trim();
        if raw.eq_ignore_ascii_case("true") || raw == "1" {
            Some(true)
        } else if raw.eq_ignore_ascii_case("false") || raw == "0" {
            Some(false)
        } else {
            None
        }
    }

    /// Parses a floating point attribute. Non-finite values are rejected.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_str(key)?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }

    /// Parses an unsigned integer attribute.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_str(key)?.trim().parse().ok()
    }

    /// Returns `true` if the attribute is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Attributes
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_parse_values() {
        let attrs: Attributes = [
            ("flag", "TRUE"),
            ("zero", "0"),
            ("latency", "12.5"),
            ("count", "42"),
            ("nan", "NaN"),
            ("junk", "abc"),
        ]
        .into_iter()
        .collect();

        assert_eq!(attrs.get_bool("flag"), Some(true));
        assert_eq!(attrs.get_bool("zero"), Some(false));
        assert_eq!(attrs.get_bool("junk"), None);
        assert_eq!(attrs.get_f64("latency"), Some(12.5));
        assert_eq!(attrs.get_f64("nan"), None);
        assert_eq!(attrs.get_u64("count"), Some(42));
        assert_eq!(attrs.get_u64("missing"), None);
    }

    #[test]
    fn non_empty_rejects_blank_values() {
        let attrs: Attributes = [("a", "  "), ("b", " x ")].into_iter().collect();
        assert_eq!(attrs.get_non_empty("a"), None);
        assert_eq!(attrs.get_non_empty("b"), Some("x"));
    }

    #[test]
    fn serializes_as_flat_object() {
        let attrs: Attributes = [("db.name", "orders")].into_iter().collect();
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"db.name":"orders"}"#);
    }
}
