#![allow(dead_code)]

use serde_json::{Value, json};
use skylog::domain::{CanonicalLogRecord, Provider, Severity, ingestion_id};
use std::collections::HashSet;
use std::sync::Mutex;
use wiremock::{Request, Respond, ResponseTemplate};

/// Emulates the store's `_bulk` endpoint: `create` items succeed once per
/// document id and return 409 on replays, and any document whose message
/// contains `reject_marker` gets a per-item 400.
pub struct BulkResponder {
    seen_ids: Mutex<HashSet<String>>,
    reject_marker: Option<String>,
    delay: Option<std::time::Duration>,
}

impl BulkResponder {
    pub fn new() -> Self {
        Self {
            seen_ids: Mutex::new(HashSet::new()),
            reject_marker: None,
            delay: None,
        }
    }

    pub fn rejecting(marker: impl Into<String>) -> Self {
        Self {
            reject_marker: Some(marker.into()),
            ..Self::new()
        }
    }

    /// Simulates a slow store so queue backpressure actually engages.
    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }
}

impl Respond for BulkResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = String::from_utf8_lossy(&request.body);
        let mut lines = body.lines();
        let mut items = Vec::new();
        let mut seen = self.seen_ids.lock().unwrap();

        while let Some(action_line) = lines.next() {
            let action: Value = match serde_json::from_str(action_line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let Some(id) = action.pointer("/create/_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let document = lines.next().unwrap_or("{}");

            let rejected = self
                .reject_marker
                .as_ref()
                .is_some_and(|marker| document.contains(marker.as_str()));

            let status = if rejected {
                items.push(json!({"create": {
                    "_id": id,
                    "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "simulated mapping failure"}
                }}));
                continue;
            } else if seen.insert(id.to_string()) {
                201
            } else {
                409
            };
            items.push(json!({"create": {"_id": id, "status": status}}));
        }

        let mut template = ResponseTemplate::new(200).set_body_json(json!({
            "errors": items.iter().any(|i| i["create"]["status"] != 201),
            "items": items,
        }));
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

/// Emulates `_search` with `(timestamp, ingestion_id)` sort and
/// `search_after` pagination over a fixed record set.
pub struct SearchResponder {
    records: Vec<CanonicalLogRecord>,
}

impl SearchResponder {
    pub fn new(mut records: Vec<CanonicalLogRecord>) -> Self {
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.ingestion_id.cmp(&b.ingestion_id))
        });
        Self { records }
    }
}

impl Respond for SearchResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(json!({}));
        let size = body.get("size").and_then(|v| v.as_u64()).unwrap_or(10) as usize;

        let after = body.get("search_after").and_then(|v| v.as_array()).map(|a| {
            (
                a.first().and_then(|v| v.as_i64()).unwrap_or(i64::MIN),
                a.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            )
        });

        let hits: Vec<Value> = self
            .records
            .iter()
            .filter(|record| {
                let key = (record.timestamp.timestamp_millis(), record.ingestion_id.clone());
                match &after {
                    Some(cursor) => (key.0, key.1.as_str()) > (cursor.0, cursor.1.as_str()),
                    None => true,
                }
            })
            .take(size)
            .map(|record| {
                json!({
                    "_source": serde_json::to_value(record).unwrap(),
                    "sort": [record.timestamp.timestamp_millis(), record.ingestion_id],
                })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({
            "hits": {"total": {"value": hits.len()}, "hits": hits}
        }))
    }
}

/// Canonical record fixture with a deterministic ingestion id.
pub fn canonical_record(
    provider: Provider,
    source: &str,
    offset: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    severity: Severity,
    message: &str,
) -> CanonicalLogRecord {
    CanonicalLogRecord {
        timestamp,
        provider,
        source: source.to_string(),
        severity,
        message: message.to_string(),
        raw_attributes: std::collections::HashMap::new(),
        ingestion_id: ingestion_id(provider, source, offset),
    }
}
