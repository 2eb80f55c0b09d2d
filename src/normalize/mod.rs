//! Pure mapping from provider-native records to the canonical schema.
//!
//! No I/O happens here: given the same raw record (and fallback clock) the
//! output is identical, which is what makes re-ingestion idempotent and the
//! unit tests deterministic.

use crate::domain::{CanonicalLogRecord, Provider, RawRecord, Severity, ingestion_id};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Key set in `raw_attributes` when the provider timestamp could not be
/// parsed and the record fell back to the ingestion wall clock.
pub const ANOMALY_ATTR: &str = "normalization_anomaly";
pub const ANOMALY_UNPARSEABLE_TIMESTAMP: &str = "unparseable_timestamp";
/// Original provider timestamp value, preserved alongside the anomaly flag.
pub const RAW_TIMESTAMP_ATTR: &str = "timestamp_raw";

/// Normalize one raw provider record into the canonical schema.
///
/// Never fails: unmapped severities become `UNKNOWN` and malformed
/// timestamps fall back to the current wall clock with an anomaly flag.
pub fn normalize(raw: &RawRecord) -> CanonicalLogRecord {
    normalize_at(raw, Utc::now())
}

/// Deterministic variant taking the fallback clock explicitly.
pub fn normalize_at(raw: &RawRecord, fallback_now: DateTime<Utc>) -> CanonicalLogRecord {
    let payload = &raw.payload;
    let mut attributes = flatten_attributes(payload);

    let (raw_timestamp, message, severity, native_ref) = match raw.provider {
        Provider::Aws => extract_aws(payload),
        Provider::Azure => extract_azure(payload),
        Provider::Gcp => extract_gcp(payload),
    };

    let timestamp = match raw_timestamp.as_deref().and_then(parse_timestamp) {
        Some(ts) => ts,
        None => {
            attributes.insert(
                ANOMALY_ATTR.to_string(),
                ANOMALY_UNPARSEABLE_TIMESTAMP.to_string(),
            );
            if let Some(original) = &raw_timestamp {
                attributes.insert(RAW_TIMESTAMP_ATTR.to_string(), original.clone());
            }
            fallback_now
        }
    };

    // Fall back to a content hash input when the provider gave no native
    // offset; the id stays stable across re-fetches either way.
    let native_ref = native_ref.unwrap_or_else(|| {
        format!("{}|{}", raw_timestamp.as_deref().unwrap_or(""), message)
    });

    CanonicalLogRecord {
        timestamp,
        provider: raw.provider,
        source: raw.source.clone(),
        severity,
        message,
        ingestion_id: ingestion_id(raw.provider, &raw.source, &native_ref),
        raw_attributes: attributes,
    }
}

/// CloudWatch `FilterLogEvents` event: epoch-millis timestamp, free-form
/// message (severity scanned from it), `eventId` as the native offset.
fn extract_aws(payload: &Value) -> (Option<String>, String, Severity, Option<String>) {
    let timestamp = payload
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .map(|ms| ms.to_string())
        .or_else(|| string_field(payload, "timestamp"));
    let message = string_field(payload, "message").unwrap_or_default();
    let severity = Severity::from_aws_message(&message);
    let native_ref = string_field(payload, "eventId");
    (timestamp, message, severity, native_ref)
}

/// Azure Monitor row (already zipped from columnar form by the fetcher).
fn extract_azure(payload: &Value) -> (Option<String>, String, Severity, Option<String>) {
    let timestamp = string_field(payload, "TimeGenerated");
    let message = string_field(payload, "Message")
        .or_else(|| string_field(payload, "RenderedDescription"))
        .unwrap_or_default();
    let severity = payload
        .get("severityLevel")
        .or_else(|| payload.get("SeverityLevel"))
        .or_else(|| payload.get("Level"))
        .map(Severity::from_azure)
        .unwrap_or(Severity::Unknown);
    let native_ref = string_field(payload, "itemId").or_else(|| string_field(payload, "_ItemId"));
    (timestamp, message, severity, native_ref)
}

/// Cloud Logging `LogEntry`: RFC 3339 timestamp, text or JSON payload,
/// structured severity, `insertId` as the native offset.
fn extract_gcp(payload: &Value) -> (Option<String>, String, Severity, Option<String>) {
    let timestamp = string_field(payload, "timestamp");
    let message = string_field(payload, "textPayload")
        .or_else(|| {
            payload
                .get("jsonPayload")
                .map(|v| serde_json::to_string(v).unwrap_or_default())
        })
        .unwrap_or_default();
    let severity = payload
        .get("severity")
        .and_then(|v| v.as_str())
        .map(Severity::from_gcp)
        .unwrap_or(Severity::Unknown);
    let native_ref = string_field(payload, "insertId")
        .map(|id| format!("{}|{}", id, timestamp.as_deref().unwrap_or("")));
    (timestamp, message, severity, native_ref)
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts epoch millis, RFC 3339, and the common naive formats providers
/// emit; naive timestamps are taken as UTC.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(millis) = trimmed.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }

    None
}

/// Preserve the provider's own top-level fields as string attributes for
/// traceability; nested structures are kept as compact JSON.
fn flatten_attributes(payload: &Value) -> HashMap<String, String> {
    let Value::Object(map) = payload else {
        return HashMap::new();
    };

    map.iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                nested => serde_json::to_string(nested).ok()?,
            };
            Some((key.clone(), rendered))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn aws_event_normalizes_epoch_millis_and_message_severity() {
        let raw = RawRecord::new(
            Provider::Aws,
            "app-logs",
            json!({
                "timestamp": 1717236000123_i64,
                "message": "ERROR: connection timeout to external service",
                "eventId": "368793",
                "logStreamName": "api-1"
            }),
        );

        let record = normalize_at(&raw, fallback());
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(record.timestamp.timestamp_millis(), 1717236000123);
        assert_eq!(record.source, "app-logs");
        assert_eq!(record.raw_attributes["logStreamName"], "api-1");
        assert!(!record.raw_attributes.contains_key(ANOMALY_ATTR));
    }

    #[test]
    fn azure_row_maps_numeric_severity() {
        let raw = RawRecord::new(
            Provider::Azure,
            "ws-1",
            json!({
                "TimeGenerated": "2024-06-01T10:00:05Z",
                "Message": "disk warning",
                "severityLevel": 2,
                "itemId": "abc-123"
            }),
        );

        let record = normalize_at(&raw, fallback());
        assert_eq!(record.severity, Severity::Warn);
        assert_eq!(record.timestamp.to_rfc3339(), "2024-06-01T10:00:05+00:00");
    }

    #[test]
    fn gcp_entry_uses_structured_severity_and_json_payload() {
        let raw = RawRecord::new(
            Provider::Gcp,
            "proj-1",
            json!({
                "timestamp": "2024-06-01T10:00:00.500Z",
                "severity": "CRITICAL",
                "jsonPayload": {"msg": "oom"},
                "insertId": "ins-9"
            }),
        );

        let record = normalize_at(&raw, fallback());
        assert_eq!(record.severity, Severity::Fatal);
        assert!(record.message.contains("oom"));
    }

    #[test]
    fn unparseable_timestamp_falls_back_with_anomaly_flag() {
        let raw = RawRecord::new(
            Provider::Gcp,
            "proj-1",
            json!({
                "timestamp": "yesterday-ish",
                "severity": "INFO",
                "textPayload": "hello"
            }),
        );

        let record = normalize_at(&raw, fallback());
        assert_eq!(record.timestamp, fallback());
        assert_eq!(
            record.raw_attributes[ANOMALY_ATTR],
            ANOMALY_UNPARSEABLE_TIMESTAMP
        );
        assert_eq!(record.raw_attributes[RAW_TIMESTAMP_ATTR], "yesterday-ish");
    }

    #[test]
    fn missing_timestamp_also_falls_back_without_raw_attr() {
        let raw = RawRecord::new(Provider::Aws, "g", json!({ "message": "no ts" }));
        let record = normalize_at(&raw, fallback());
        assert_eq!(record.timestamp, fallback());
        assert_eq!(
            record.raw_attributes[ANOMALY_ATTR],
            ANOMALY_UNPARSEABLE_TIMESTAMP
        );
        assert!(!record.raw_attributes.contains_key(RAW_TIMESTAMP_ATTR));
    }

    #[test]
    fn normalization_is_idempotent_for_ingestion_id() {
        let raw = RawRecord::new(
            Provider::Aws,
            "app-logs",
            json!({"timestamp": 1717236000123_i64, "message": "INFO ready", "eventId": "e-1"}),
        );

        let first = normalize_at(&raw, fallback());
        let second = normalize_at(&raw, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(first.ingestion_id, second.ingestion_id);
    }

    #[test]
    fn timezone_offsets_are_normalized_to_utc() {
        let raw = RawRecord::new(
            Provider::Azure,
            "ws-1",
            json!({
                "TimeGenerated": "2024-06-01T12:00:00+02:00",
                "Message": "offset test",
                "severityLevel": 1
            }),
        );

        let record = normalize_at(&raw, fallback());
        assert_eq!(record.timestamp.to_rfc3339(), "2024-06-01T10:00:00+00:00");
    }
}
