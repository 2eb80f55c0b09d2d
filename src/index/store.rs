use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl StoreError {
    /// Whole-request failures worth retrying with backoff. Non-2xx item
    /// responses inside a bulk body are handled per record, not here.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Http { status, .. } => matches!(status, 429 | 500..=599),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub endpoint: String,
    pub index_prefix: String,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200".to_string(),
            index_prefix: "cloud-logs".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Thin client over the document store's bulk-write and search endpoints.
///
/// Holds one pooled connection; the exact wire protocol (Elasticsearch REST
/// here) is confined to this module.
#[derive(Debug, Clone)]
pub struct StoreClient {
    client: reqwest::Client,
    base: Url,
    index_prefix: String,
}

impl StoreClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let base: Url = config
            .endpoint
            .parse()
            .map_err(|e| StoreError::InvalidConfig(format!("endpoint: {e}")))?;
        if config.index_prefix.is_empty() {
            return Err(StoreError::InvalidConfig(
                "index prefix must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .user_agent(concat!("skylog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            base,
            index_prefix: config.index_prefix.clone(),
        })
    }

    /// Daily index for a record, derived from its normalized UTC timestamp
    /// so re-ingestion of the same record always targets the same index.
    pub fn index_for(&self, timestamp: DateTime<Utc>) -> String {
        format!("{}-{}", self.index_prefix, timestamp.format("%Y.%m.%d"))
    }

    /// Verify the store is reachable before committing to a run.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(self.base.clone())
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "HTTP {} from store root",
                response.status()
            )))
        }
    }

    /// Install the index template for `<prefix>-*` so canonical fields get
    /// the right mappings regardless of which daily index is created first.
    pub async fn ensure_template(&self) -> Result<(), StoreError> {
        let url = self
            .base
            .join(&format!("_index_template/{}-template", self.index_prefix))
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        let template = json!({
            "index_patterns": [format!("{}-*", self.index_prefix)],
            "template": {
                "mappings": {
                    "properties": {
                        "timestamp": {"type": "date"},
                        "message": {"type": "text"},
                        "severity": {"type": "keyword"},
                        "provider": {"type": "keyword"},
                        "source": {"type": "keyword"},
                        "ingestion_id": {"type": "keyword"},
                        "raw_attributes": {"type": "object", "enabled": false}
                    }
                }
            }
        });

        let response = self
            .client
            .put(url)
            .json(&template)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Submit an NDJSON `_bulk` body and return the parsed item results.
    pub async fn bulk(&self, body: String) -> Result<Value, StoreError> {
        let url = self
            .base
            .join("_bulk")
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Transport(format!("bulk response: {e}")))
    }

    /// Run a search against every daily index under the prefix.
    pub async fn search(&self, body: &Value) -> Result<Value, StoreError> {
        let url = self
            .base
            .join(&format!("{}-*/_search", self.index_prefix))
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Transport(format!("search response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn index_name_uses_record_date() {
        let client = StoreClient::new(&StoreConfig::default()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 0).unwrap();
        assert_eq!(client.index_for(ts), "cloud-logs-2024.06.01");
    }

    #[test]
    fn rejects_bad_endpoint_and_empty_prefix() {
        let bad_url = StoreConfig {
            endpoint: "not a url".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            StoreClient::new(&bad_url),
            Err(StoreError::InvalidConfig(_))
        ));

        let empty_prefix = StoreConfig {
            index_prefix: String::new(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            StoreClient::new(&empty_prefix),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(
            StoreError::Http {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !StoreError::Http {
                status: 400,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!StoreError::Unavailable("down".into()).is_transient());
    }
}
