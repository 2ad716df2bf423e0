//! Telemetry records flowing through the admission pipeline.
//!
//! Scrapers hand over batches of [`TelemetryRecord`]s; every stage returns a
//! schema-compatible batch with extra `dbintel.*` decision attributes.

pub mod attributes;
pub mod key;

pub use attributes::{keys, Attributes};
pub use key::{EntityKey, DEFAULT_CATEGORY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Log severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Trace-level detail.
    Trace,
    /// Debug output.
    Debug,
    /// Informational.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
    /// Fatal error.
    Fatal,
}

impl Severity {
    /// Returns `true` for `Error` and `Fatal`.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }
}

/// The measured value or log body of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Point-in-time measurement.
    Gauge {
        /// Measured value.
        value: f64,
    },
    /// Additive measurement.
    Sum {
        /// Measured value.
        value: f64,
    },
    /// Log line.
    Log {
        /// Severity of the log line.
        severity: Severity,
        /// Log body.
        body: String,
    },
}

impl Payload {
    /// Stable name of the payload variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Gauge { .. } => "gauge",
            Self::Sum { .. } => "sum",
            Self::Log { .. } => "log",
        }
    }
}

/// One metric point or log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Derived identity; `None` when the record lacks a database identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<EntityKey>,
    /// Observation time reported by the scraper.
    pub timestamp: DateTime<Utc>,
    /// Value or log body.
    pub payload: Payload,
    /// Attribute bag.
    #[serde(default)]
    pub attributes: Attributes,
}

impl TelemetryRecord {
    /// Creates a record and derives its key from the attributes.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, payload: Payload, attributes: Attributes) -> Self {
        let key = EntityKey::derive(&attributes);
        Self {
            key,
            timestamp,
            payload,
            attributes,
        }
    }

    /// Fills in the key from the attributes if it is missing.
    pub fn ensure_key(&mut self) {
        if self.key.is_none() {
            self.key = EntityKey::derive(&self.attributes);
        }
    }

    /// Category used for sampling, falling back to the default category.
    #[must_use]
    pub fn category(&self) -> &str {
        self.key
            .as_ref()
            .map_or(DEFAULT_CATEGORY, |k| k.category.as_str())
    }

    /// Returns `true` if the record reports an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        if self.attributes.get_bool(keys::DB_ERROR) == Some(true) {
            return true;
        }
        matches!(self.payload, Payload::Log { severity, .. } if severity.is_error())
    }

    /// Maps the record's content into `[0, 1)`, for records without a key.
    #[must_use]
    pub fn content_hash(&self) -> f64 {
        let mut hasher = Sha256::new();
        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or_default();
        hasher.update(nanos.to_le_bytes());
        key::write_field(&mut hasher, self.payload.kind().as_bytes());
        for (k, v) in self.attributes.iter() {
            key::write_field(&mut hasher, k.as_bytes());
            key::write_field(&mut hasher, v.as_bytes());
        }
        key::digest_to_unit(&hasher.finalize())
    }

    /// Approximate wire size in bytes: attribute text, payload value or log
    /// body, and a fixed allowance for the timestamp and kind.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        const FIXED_BYTES: usize = 16;
        let attributes: usize = self.attributes.iter().map(|(k, v)| k.len() + v.len()).sum();
        let payload = match &self.payload {
            Payload::Gauge { .. } | Payload::Sum { .. } => std::mem::size_of::<f64>(),
            Payload::Log { body, .. } => body.len(),
        };
        (FIXED_BYTES + attributes + payload) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(severity: Severity) -> TelemetryRecord {
        TelemetryRecord::new(
            Utc::now(),
            Payload::Log {
                severity,
                body: "boom".into(),
            },
            [(keys::DB_NAME, "db1")].into_iter().collect(),
        )
    }

    #[test]
    fn new_derives_key() {
        let record = log(Severity::Info);
        assert_eq!(record.key, Some(EntityKey::new("db1", DEFAULT_CATEGORY)));
        assert_eq!(record.category(), DEFAULT_CATEGORY);
    }

    #[test]
    fn error_detection_uses_flag_and_severity() {
        assert!(log(Severity::Fatal).is_error());
        assert!(!log(Severity::Warn).is_error());

        let mut record = log(Severity::Info);
        record.attributes.insert(keys::DB_ERROR, "true");
        assert!(record.is_error());
    }

    #[test]
    fn json_round_trip_preserves_attributes() {
        let json = r#"{
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {"kind": "sum", "value": 3.0},
            "attributes": {"db.name": "orders", "custom": "kept"}
        }"#;
        let mut record: TelemetryRecord = serde_json::from_str(json).unwrap();
        assert!(record.key.is_none());
        record.ensure_key();
        assert_eq!(record.key.as_ref().unwrap().database, "orders");
        assert_eq!(record.attributes.get_str("custom"), Some("kept"));
        assert_eq!(record.payload.kind(), "sum");
    }

    #[test]
    fn estimated_size_counts_attributes_and_payload() {
        let record = log(Severity::Info);
        assert_eq!(record.estimated_size(), 16 + ("db.name".len() + "db1".len()) as u64 + 4);

        let sum = TelemetryRecord::new(Utc::now(), Payload::Sum { value: 1.0 }, Attributes::new());
        assert_eq!(sum.estimated_size(), 24);
    }

    #[test]
    fn content_hash_is_deterministic() {
        let record = log(Severity::Info);
        assert_eq!(
            record.content_hash().to_bits(),
            record.clone().content_hash().to_bits()
        );
    }
}
