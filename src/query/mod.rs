pub mod analyzer;

pub use analyzer::{Analyzer, Anomaly, Stats};

use crate::domain::{CanonicalLogRecord, Provider, Severity};
use crate::fetch::TimeWindow;
use crate::index::{StoreClient, StoreError};
use clap::ValueEnum;
use futures::{Stream, TryStreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed search response: {0}")]
    MalformedResponse(String),
}

/// Read-side filter over the canonical schema.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Full-text match on the message field.
    pub text: Option<String>,
    pub provider: Option<Provider>,
    pub severity: Option<Severity>,
    pub source: Option<String>,
}

/// Fields `aggregate` can group by; a closed set matching the keyword
/// mappings in the index template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GroupBy {
    #[value(name = "level")]
    Severity,
    Provider,
    Source,
}

impl GroupBy {
    fn key_of(self, record: &CanonicalLogRecord) -> String {
        match self {
            GroupBy::Severity => record.severity.as_str().to_string(),
            GroupBy::Provider => record.provider.as_str().to_string(),
            GroupBy::Source => record.source.clone(),
        }
    }
}

const DEFAULT_PAGE_SIZE: usize = 500;

/// Issues read queries against the canonical schema.
#[derive(Debug, Clone)]
pub struct QueryClient {
    store: StoreClient,
    page_size: usize,
}

impl QueryClient {
    pub fn new(store: StoreClient) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Lazy, paged stream of matching records in (timestamp, ingestion_id)
    /// order. Restartable: the same query against an unchanged store yields
    /// the same sequence. Pagination uses `search_after`, so no state is
    /// held server-side.
    pub fn query(
        &self,
        filter: QueryFilter,
        range: TimeWindow,
    ) -> impl Stream<Item = Result<CanonicalLogRecord, QueryError>> + use<> {
        let client = self.clone();

        futures::stream::try_unfold(PageState::default(), move |state| {
            let client = client.clone();
            let filter = filter.clone();
            async move {
                if state.done {
                    return Ok::<_, QueryError>(None);
                }
                let (records, next) = client.fetch_page(&filter, range, state).await?;
                if records.is_empty() {
                    return Ok(None);
                }
                Ok(Some((futures::stream::iter(records.into_iter().map(Ok)), next)))
            }
        })
        .try_flatten()
    }

    /// Count matching records per group key as a streaming reduction over
    /// the query sequence; memory is bounded by the number of distinct keys,
    /// not the number of records.
    pub async fn aggregate(
        &self,
        group_by: GroupBy,
        range: TimeWindow,
    ) -> Result<HashMap<String, u64>, QueryError> {
        let stream = self.query(QueryFilter::default(), range);
        futures::pin_mut!(stream);

        let mut counts: HashMap<String, u64> = HashMap::new();
        while let Some(record) = stream.try_next().await? {
            *counts.entry(group_by.key_of(&record)).or_default() += 1;
        }
        Ok(counts)
    }

    async fn fetch_page(
        &self,
        filter: &QueryFilter,
        range: TimeWindow,
        state: PageState,
    ) -> Result<(Vec<CanonicalLogRecord>, PageState), QueryError> {
        let mut body = json!({
            "size": self.page_size,
            "query": build_query(filter, range),
            "sort": [
                {"timestamp": "asc"},
                {"ingestion_id": "asc"}
            ],
        });
        if let Some(after) = &state.search_after {
            body["search_after"] = after.clone();
        }

        let response = self.store.search(&body).await?;
        let hits = response
            .pointer("/hits/hits")
            .and_then(|h| h.as_array())
            .ok_or_else(|| QueryError::MalformedResponse("missing hits".to_string()))?;

        let mut records = Vec::with_capacity(hits.len());
        for hit in hits {
            let source = hit
                .get("_source")
                .ok_or_else(|| QueryError::MalformedResponse("hit without _source".to_string()))?;
            let record: CanonicalLogRecord = serde_json::from_value(source.clone())
                .map_err(|e| QueryError::MalformedResponse(e.to_string()))?;
            records.push(record);
        }

        let next = match hits.last().and_then(|hit| hit.get("sort")) {
            Some(sort) if hits.len() >= self.page_size => PageState {
                search_after: Some(sort.clone()),
                done: false,
            },
            _ => PageState {
                search_after: None,
                done: true,
            },
        };

        Ok((records, next))
    }
}

#[derive(Debug, Default, Clone)]
struct PageState {
    search_after: Option<Value>,
    done: bool,
}

fn build_query(filter: &QueryFilter, range: TimeWindow) -> Value {
    let mut must = vec![json!({
        "range": {
            "timestamp": {
                "gte": range.start.to_rfc3339(),
                "lt": range.end.to_rfc3339(),
            }
        }
    })];

    if let Some(text) = &filter.text {
        must.push(json!({"match": {"message": text}}));
    }
    if let Some(provider) = filter.provider {
        must.push(json!({"term": {"provider": provider.as_str()}}));
    }
    if let Some(severity) = filter.severity {
        must.push(json!({"term": {"severity": severity.as_str()}}));
    }
    if let Some(source) = &filter.source {
        must.push(json!({"term": {"source": source}}));
    }

    json!({"bool": {"must": must}})
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn range() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn query_always_carries_the_time_range() {
        let query = build_query(&QueryFilter::default(), range());
        let must = query["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 1);
        assert!(must[0]["range"]["timestamp"]["gte"].is_string());
    }

    #[test]
    fn filters_become_match_and_term_clauses() {
        let filter = QueryFilter {
            text: Some("timeout".to_string()),
            provider: Some(Provider::Gcp),
            severity: Some(Severity::Error),
            source: Some("proj-1".to_string()),
        };
        let query = build_query(&filter, range());
        let must = query["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 5);
        assert_eq!(must[1]["match"]["message"], "timeout");
        assert_eq!(must[2]["term"]["provider"], "gcp");
        assert_eq!(must[3]["term"]["severity"], "ERROR");
        assert_eq!(must[4]["term"]["source"], "proj-1");
    }
}
