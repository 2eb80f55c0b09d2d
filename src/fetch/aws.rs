use super::{Fetch, FetchError, FetchPage, TimeWindow, retry_after_header};
use crate::domain::{Provider, RawRecord};
use serde_json::json;
use url::Url;

/// Fetches CloudWatch Logs events via the `FilterLogEvents` API, paging
/// with the service's `nextToken`.
#[derive(Debug, Clone)]
pub struct AwsFetcher {
    client: reqwest::Client,
    endpoint: Url,
    log_group: String,
    auth_token: Option<String>,
    page_size: usize,
}

impl AwsFetcher {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        log_group: impl Into<String>,
        auth_token: Option<String>,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            endpoint,
            log_group: log_group.into(),
            auth_token,
            page_size,
        }
    }
}

impl Fetch for AwsFetcher {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn source(&self) -> &str {
        &self.log_group
    }

    async fn fetch(
        &self,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError> {
        let mut body = json!({
            "logGroupName": self.log_group,
            "startTime": window.start.timestamp_millis(),
            "endTime": window.end.timestamp_millis(),
            "limit": self.page_size,
        });
        if let Some(token) = cursor {
            body["nextToken"] = json!(token);
        }

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("x-amz-target", "Logs_20140328.FilterLogEvents")
            .header("content-type", "application/x-amz-json-1.1")
            .json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(match FetchError::from_status(status, text) {
                FetchError::RateLimited { .. } => FetchError::RateLimited { retry_after },
                other => other,
            });
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

        let events = parsed
            .get("events")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                FetchError::MalformedResponse("missing `events` array".to_string())
            })?;

        let records = events
            .iter()
            .cloned()
            .map(|event| RawRecord::new(Provider::Aws, &self.log_group, event))
            .collect();

        let next_cursor = parsed
            .get("nextToken")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(FetchPage {
            records,
            next_cursor,
        })
    }
}
