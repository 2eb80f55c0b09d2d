use super::{Fetch, FetchError, FetchPage, TimeWindow, retry_after_header};
use crate::domain::{Provider, RawRecord};
use serde_json::{Map, Value, json};
use url::Url;

/// Fetches rows from an Azure Monitor Log Analytics workspace.
///
/// The Logs query API has no continuation token, so pagination is driven by
/// a resume-from timestamp: each page asks for rows at or after the last
/// `TimeGenerated` already seen, ordered ascending, capped at the page size.
/// The inclusive bound re-fetches rows sharing the boundary timestamp rather
/// than skipping ones that did not fit on the previous page; re-fetched rows
/// dedup at the store through their `ingestion_id`.
#[derive(Debug, Clone)]
pub struct AzureFetcher {
    client: reqwest::Client,
    endpoint: Url,
    workspace_id: String,
    table: String,
    auth_token: Option<String>,
    page_size: usize,
}

impl AzureFetcher {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        workspace_id: impl Into<String>,
        table: impl Into<String>,
        auth_token: Option<String>,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            endpoint,
            workspace_id: workspace_id.into(),
            table: table.into(),
            auth_token,
            page_size,
        }
    }

    fn query_url(&self) -> Result<Url, FetchError> {
        self.endpoint
            .join(&format!("v1/workspaces/{}/query", self.workspace_id))
            .map_err(|e| FetchError::Rejected(format!("invalid endpoint: {e}")))
    }

    fn kusto_query(&self, window: TimeWindow, cursor: Option<&str>) -> String {
        // The cursor timestamp supersedes the window start on resume. The
        // bound stays inclusive so rows sharing the boundary timestamp that
        // fell off the previous page are not lost.
        let lower_clause = match cursor {
            Some(lower) if !lower.is_empty() => {
                format!("TimeGenerated >= datetime({lower})")
            }
            _ => format!("TimeGenerated >= datetime({})", window.start.to_rfc3339()),
        };
        format!(
            "{} | where {} and TimeGenerated < datetime({}) | order by TimeGenerated asc | take {}",
            self.table,
            lower_clause,
            window.end.to_rfc3339(),
            self.page_size
        )
    }
}

impl Fetch for AzureFetcher {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn source(&self) -> &str {
        &self.workspace_id
    }

    async fn fetch(
        &self,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError> {
        let body = json!({ "query": self.kusto_query(window, cursor) });

        let mut request = self.client.post(self.query_url()?).json(&body);
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

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

        let rows = rows_as_objects(&parsed)?;
        let full_page = rows.len() >= self.page_size;

        // Resume from the last row's TimeGenerated when the page was full.
        // A full page that cannot advance the cursor (every row at the same
        // already-seen timestamp) ends the scan instead of looping.
        let next_cursor = if full_page {
            rows.last()
                .and_then(|row| row.get("TimeGenerated"))
                .and_then(|v| v.as_str())
                .filter(|last| Some(*last) != cursor)
                .map(str::to_string)
        } else {
            None
        };

        let records = rows
            .into_iter()
            .map(|row| RawRecord::new(Provider::Azure, &self.workspace_id, Value::Object(row)))
            .collect();

        Ok(FetchPage {
            records,
            next_cursor,
        })
    }
}

/// The Logs API returns columnar tables; zip column names onto each row so
/// downstream code sees one object per record.
fn rows_as_objects(response: &Value) -> Result<Vec<Map<String, Value>>, FetchError> {
    let table = response
        .get("tables")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .ok_or_else(|| FetchError::MalformedResponse("missing `tables`".to_string()))?;

    let columns: Vec<&str> = table
        .get("columns")
        .and_then(|c| c.as_array())
        .ok_or_else(|| FetchError::MalformedResponse("missing `columns`".to_string()))?
        .iter()
        .map(|c| c.get("name").and_then(|n| n.as_str()).unwrap_or(""))
        .collect();

    let rows = table
        .get("rows")
        .and_then(|r| r.as_array())
        .ok_or_else(|| FetchError::MalformedResponse("missing `rows`".to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row.as_array().ok_or_else(|| {
            FetchError::MalformedResponse("row is not an array".to_string())
        })?;
        let mut object = Map::with_capacity(columns.len());
        for (name, cell) in columns.iter().zip(cells) {
            if !name.is_empty() {
                object.insert((*name).to_string(), cell.clone());
            }
        }
        out.push(object);
    }
    Ok(out)
}
