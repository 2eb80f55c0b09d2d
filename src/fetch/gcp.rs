use super::{Fetch, FetchError, FetchPage, TimeWindow, retry_after_header};
use crate::domain::{Provider, RawRecord};
use serde_json::json;
use url::Url;

/// Fetches Cloud Logging entries via `entries:list`, paging with the
/// service's `nextPageToken`.
#[derive(Debug, Clone)]
pub struct GcpFetcher {
    client: reqwest::Client,
    endpoint: Url,
    project: String,
    auth_token: Option<String>,
    page_size: usize,
}

impl GcpFetcher {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        project: impl Into<String>,
        auth_token: Option<String>,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            endpoint,
            project: project.into(),
            auth_token,
            page_size,
        }
    }

    fn entries_url(&self) -> Result<Url, FetchError> {
        self.endpoint
            .join("v2/entries:list")
            .map_err(|e| FetchError::Rejected(format!("invalid endpoint: {e}")))
    }
}

impl Fetch for GcpFetcher {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    fn source(&self) -> &str {
        &self.project
    }

    async fn fetch(
        &self,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError> {
        let filter = format!(
            "timestamp >= \"{}\" AND timestamp < \"{}\"",
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );
        let mut body = json!({
            "resourceNames": [format!("projects/{}", self.project)],
            "filter": filter,
            "orderBy": "timestamp asc",
            "pageSize": self.page_size,
        });
        if let Some(token) = cursor {
            body["pageToken"] = json!(token);
        }

        let mut request = self.client.post(self.entries_url()?).json(&body);
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

        // An empty window legitimately returns no `entries` key.
        let records = parsed
            .get("entries")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .cloned()
                    .map(|entry| RawRecord::new(Provider::Gcp, &self.project, entry))
                    .collect()
            })
            .unwrap_or_default();

        let next_cursor = parsed
            .get("nextPageToken")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Ok(FetchPage {
            records,
            next_cursor,
        })
    }
}
