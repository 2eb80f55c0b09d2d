use super::provider::Provider;
use super::severity::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A provider-native log record as returned by a fetcher, before
/// normalization. The payload keeps the provider's own field names.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub provider: Provider,
    /// Log group (AWS), workspace id (Azure), or project (GCP).
    pub source: String,
    pub payload: serde_json::Value,
}

impl RawRecord {
    pub fn new(provider: Provider, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            provider,
            source: source.into(),
            payload,
        }
    }
}

/// The unified log schema independent of source provider.
///
/// Created by the normalizer from one raw record, immutable thereafter, and
/// persisted whole by the indexer. Corrections require a new record, never
/// an update in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalLogRecord {
    /// Always UTC, regardless of the provider-reported timezone.
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    /// Log group / workspace id / project the record came from.
    pub source: String,
    pub severity: Severity,
    pub message: String,
    /// Provider-specific fields preserved for traceability, plus any
    /// normalization anomaly flags.
    #[serde(default)]
    pub raw_attributes: HashMap<String, String>,
    /// Deterministic dedup key; stable across repeated fetches of the same
    /// underlying record.
    pub ingestion_id: String,
}

/// Deterministic hash of provider + source + the provider's native offset
/// for a record (event id, insert id, or a timestamp/message fallback).
///
/// Re-fetching the same underlying record must always produce the same id,
/// making re-ingestion idempotent at the store.
pub fn ingestion_id(provider: Provider, source: &str, native_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(source.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(native_ref.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        // Infallible for String
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingestion_id_is_stable_and_distinguishes_inputs() {
        let a = ingestion_id(Provider::Aws, "group-1", "event-42");
        let b = ingestion_id(Provider::Aws, "group-1", "event-42");
        assert_eq!(a, b);

        assert_ne!(a, ingestion_id(Provider::Gcp, "group-1", "event-42"));
        assert_ne!(a, ingestion_id(Provider::Aws, "group-2", "event-42"));
        assert_ne!(a, ingestion_id(Provider::Aws, "group-1", "event-43"));
    }

    #[test]
    fn ingestion_id_is_hex_sha256() {
        let id = ingestion_id(Provider::Azure, "ws", "row-1");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
