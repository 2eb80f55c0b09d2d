pub mod aws;
pub mod azure;
pub mod gcp;
pub mod retry;

pub use aws::AwsFetcher;
pub use azure::AzureFetcher;
pub use gcp::GcpFetcher;
pub use retry::BackoffPolicy;

use crate::domain::{Provider, RawRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("unauthorized (check credentials): {0}")]
    Unauthorized(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures are retried with the same cursor and window;
    /// everything else aborts the provider's run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::Timeout(_) | FetchError::Transient(_)
        )
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> FetchError {
        match status.as_u16() {
            429 => FetchError::RateLimited { retry_after: None },
            401 | 403 => FetchError::Unauthorized(body),
            408 => FetchError::Timeout(body),
            500..=599 => FetchError::Transient(format!("HTTP {status}: {body}")),
            _ => FetchError::Rejected(format!("HTTP {status}: {body}")),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else {
            FetchError::Transient(err.to_string())
        }
    }
}

/// The ingestion window being fetched, always half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - ChronoDuration::hours(hours.max(1)),
            end,
        }
    }

    /// Split into hourly slices for fan-out; the final slice absorbs any
    /// sub-hour remainder.
    pub fn split_hourly(&self) -> Vec<TimeWindow> {
        let mut slices = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = std::cmp::min(cursor + ChronoDuration::hours(1), self.end);
            slices.push(TimeWindow {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        slices
    }
}

/// One page of raw records plus the provider's continuation token.
/// `next_cursor = None` means end-of-window.
#[derive(Debug, Default)]
pub struct FetchPage {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

/// Capability surface of a provider adapter: page through a time window,
/// yielding provider-native records.
///
/// Implementations hold no emit-side state; re-fetching after a transient
/// failure may repeat records, which the deterministic `ingestion_id`
/// neutralizes at the store.
pub trait Fetch: Send + Sync {
    fn provider(&self) -> Provider;

    /// Log group / workspace id / project this fetcher is scoped to.
    fn source(&self) -> &str;

    fn fetch(
        &self,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<FetchPage, FetchError>> + Send;
}

/// Closed set of provider adapters behind the one `Fetch` capability.
#[derive(Debug, Clone)]
pub enum ProviderFetcher {
    Aws(AwsFetcher),
    Azure(AzureFetcher),
    Gcp(GcpFetcher),
}

impl Fetch for ProviderFetcher {
    fn provider(&self) -> Provider {
        match self {
            ProviderFetcher::Aws(f) => f.provider(),
            ProviderFetcher::Azure(f) => f.provider(),
            ProviderFetcher::Gcp(f) => f.provider(),
        }
    }

    fn source(&self) -> &str {
        match self {
            ProviderFetcher::Aws(f) => f.source(),
            ProviderFetcher::Azure(f) => f.source(),
            ProviderFetcher::Gcp(f) => f.source(),
        }
    }

    async fn fetch(
        &self,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError> {
        match self {
            ProviderFetcher::Aws(f) => f.fetch(window, cursor).await,
            ProviderFetcher::Azure(f) => f.fetch(window, cursor).await,
            ProviderFetcher::Gcp(f) => f.fetch(window, cursor).await,
        }
    }
}

/// Fetch one page, retrying transient failures with the same cursor and
/// window under the backoff policy. Suspends between attempts; honors
/// cancellation promptly.
pub async fn fetch_with_retry<F: Fetch>(
    fetcher: &F,
    window: TimeWindow,
    cursor: Option<&str>,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<FetchPage, FetchError> {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let result = tokio::select! {
            res = fetcher.fetch(window, cursor) => res,
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        match result {
            Ok(page) => {
                debug!(
                    provider = %fetcher.provider(),
                    source = fetcher.source(),
                    records = page.records.len(),
                    has_more = page.next_cursor.is_some(),
                    "fetched page"
                );
                return Ok(page);
            }
            Err(err) if err.is_transient() => {
                attempt += 1;
                if policy.exhausted(attempt) {
                    warn!(
                        provider = %fetcher.provider(),
                        source = fetcher.source(),
                        attempts = attempt,
                        "giving up after repeated transient failures: {err}"
                    );
                    return Err(err);
                }

                let mut delay = policy.delay_for(attempt);
                if let FetchError::RateLimited {
                    retry_after: Some(hinted),
                } = &err
                {
                    delay = std::cmp::max(delay, *hinted);
                }
                debug!(
                    provider = %fetcher.provider(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient fetch failure, backing off: {err}"
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(FetchError::Cancelled),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
