pub mod store;

pub use store::{StoreClient, StoreConfig, StoreError};

use crate::domain::CanonicalLogRecord;
use crate::fetch::BackoffPolicy;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum IndexError {
    /// Transport retries exhausted or the store refused the whole request;
    /// fatal for the run.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("indexing cancelled")]
    Cancelled,
}

/// A record the store refused, reported individually and never retried.
#[derive(Debug)]
pub struct Rejection {
    pub record: CanonicalLogRecord,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IndexResult {
    /// Records newly written by this call.
    pub accepted: usize,
    /// Records already present under the same `ingestion_id`; re-indexing
    /// them is a no-op, not an error.
    pub duplicates: usize,
    pub rejected: Vec<Rejection>,
}

impl IndexResult {
    pub fn merge(&mut self, other: IndexResult) {
        self.accepted += other.accepted;
        self.duplicates += other.duplicates;
        self.rejected.extend(other.rejected);
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Upper bound per bulk request, bounding memory and payload size.
    pub batch_size: usize,
    pub retry: BackoffPolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry: BackoffPolicy::default(),
        }
    }
}

/// Writes canonical records to the store in deduplicated bulk batches.
///
/// Each record is submitted as a `create` with its `ingestion_id` as the
/// document id: the store's version conflict (409) on an existing id is what
/// makes re-ingestion idempotent. Records are written atomically as whole
/// documents; there is no partial-document state to clean up on cancel.
#[derive(Debug, Clone)]
pub struct Indexer {
    store: StoreClient,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(store: StoreClient, config: IndexerConfig) -> Self {
        Self { store, config }
    }

    /// Index a batch, splitting at the configured size cap. Partial batch
    /// failure commits the accepted records and reports the rejected ones;
    /// only whole-request transport failures are retried.
    pub async fn index(
        &self,
        batch: &[CanonicalLogRecord],
        cancel: &CancellationToken,
    ) -> Result<IndexResult, IndexError> {
        let mut result = IndexResult::default();
        for chunk in batch.chunks(self.config.batch_size.max(1)) {
            result.merge(self.index_chunk(chunk, cancel).await?);
        }
        Ok(result)
    }

    async fn index_chunk(
        &self,
        chunk: &[CanonicalLogRecord],
        cancel: &CancellationToken,
    ) -> Result<IndexResult, IndexError> {
        if chunk.is_empty() {
            return Ok(IndexResult::default());
        }

        let body = self.bulk_body(chunk);
        let mut attempt: u32 = 0;

        let response = loop {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            let outcome = tokio::select! {
                res = self.store.bulk(body.clone()) => res,
                () = cancel.cancelled() => return Err(IndexError::Cancelled),
            };

            match outcome {
                Ok(response) => break response,
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if self.config.retry.exhausted(attempt) {
                        return Err(IndexError::StoreUnavailable(format!(
                            "bulk write failed after {attempt} attempts: {err}"
                        )));
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient store failure, retrying batch: {err}"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(IndexError::Cancelled),
                    }
                }
                Err(err) => {
                    return Err(IndexError::StoreUnavailable(err.to_string()));
                }
            }
        };

        let result = collate_bulk_response(chunk, &response);
        debug!(
            accepted = result.accepted,
            duplicates = result.duplicates,
            rejected = result.rejected.len(),
            "bulk batch committed"
        );
        Ok(result)
    }

    fn bulk_body(&self, chunk: &[CanonicalLogRecord]) -> String {
        let mut body = String::new();
        for record in chunk {
            let action = json!({
                "create": {
                    "_index": self.store.index_for(record.timestamp),
                    "_id": record.ingestion_id,
                }
            });
            body.push_str(&action.to_string());
            body.push('\n');
            // CanonicalLogRecord serialization cannot fail: all fields are
            // strings, maps of strings, or chrono/serde types.
            body.push_str(&serde_json::to_string(record).unwrap_or_default());
            body.push('\n');
        }
        body
    }
}

/// Map bulk item responses back onto the submitted records, positionally.
fn collate_bulk_response(chunk: &[CanonicalLogRecord], response: &Value) -> IndexResult {
    let mut result = IndexResult::default();

    let Some(items) = response.get("items").and_then(|v| v.as_array()) else {
        // A success response with no items array is a store bug; treat
        // everything as rejected rather than silently claiming success.
        for record in chunk {
            result.rejected.push(Rejection {
                record: record.clone(),
                reason: "bulk response missing items".to_string(),
            });
        }
        return result;
    };

    for (position, record) in chunk.iter().enumerate() {
        let status = items
            .get(position)
            .and_then(|item| item.get("create"))
            .and_then(|op| op.get("status"))
            .and_then(|s| s.as_u64());

        match status {
            Some(200 | 201) => result.accepted += 1,
            Some(409) => result.duplicates += 1,
            Some(code) => {
                let error = items
                    .get(position)
                    .and_then(|item| item.pointer("/create/error"));
                let kind = error.and_then(|e| e.get("type")).and_then(|t| t.as_str());
                let detail = error
                    .and_then(|e| e.get("reason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("unspecified store rejection");
                let reason = match kind {
                    Some(kind) => format!("HTTP {code}: {kind}: {detail}"),
                    None => format!("HTTP {code}: {detail}"),
                };
                result.rejected.push(Rejection {
                    record: record.clone(),
                    reason,
                });
            }
            None => result.rejected.push(Rejection {
                record: record.clone(),
                reason: "missing item status in bulk response".to_string(),
            }),
        }
    }

    result
}
