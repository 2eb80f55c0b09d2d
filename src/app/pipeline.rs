use super::config::PipelineSettings;
use crate::domain::{CanonicalLogRecord, Provider};
use crate::fetch::{BackoffPolicy, Fetch, FetchError, TimeWindow, fetch_with_retry};
use crate::index::{IndexError, IndexResult, Indexer};
use crate::normalize;
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The store went away; nothing more can be committed, so the whole
    /// run aborts.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Per-provider outcome of a collect run. A fatal fetch error here never
/// aborts the other providers.
#[derive(Debug)]
pub struct ProviderOutcome {
    pub provider: Provider,
    pub source: String,
    pub fetched: usize,
    pub anomalies: usize,
    /// The run was interrupted before this provider finished its window.
    pub cancelled: bool,
    pub error: Option<String>,
}

impl ProviderOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

#[derive(Debug)]
pub struct CollectReport {
    pub providers: Vec<ProviderOutcome>,
    pub totals: IndexResult,
}

impl CollectReport {
    /// Partial success is success; only a run where every provider failed
    /// and nothing was committed counts as total failure.
    pub fn total_failure(&self) -> bool {
        self.providers.iter().all(|p| !p.succeeded())
            && self.totals.accepted == 0
            && self.totals.duplicates == 0
    }
}

/// Run the collect pipeline: fetch → normalize → index.
///
/// One task per provider fetcher, fanned out over hourly window slices, all
/// feeding a bounded queue consumed by the indexing stage. The bound is the
/// backpressure mechanism: when indexing falls behind, `send` suspends the
/// fetch tasks instead of buffering without limit. Cancellation propagates
/// through the token to every in-flight fetch and index operation.
pub async fn run_collect<F>(
    fetchers: Vec<F>,
    window: TimeWindow,
    indexer: Indexer,
    settings: &PipelineSettings,
    retry: BackoffPolicy,
    cancel: CancellationToken,
) -> Result<CollectReport, PipelineError>
where
    F: Fetch + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<CanonicalLogRecord>(settings.queue_capacity);

    let index_task = tokio::spawn(run_index_stage(
        rx,
        indexer,
        settings.batch_size,
        settings.flush_interval(),
        cancel.clone(),
    ));

    let mut fetch_tasks = JoinSet::new();
    let concurrency = settings.fetch_concurrency;
    for fetcher in fetchers {
        let tx = tx.clone();
        let retry = retry.clone();
        let cancel = cancel.clone();
        fetch_tasks
            .spawn(async move { collect_provider(fetcher, window, retry, tx, cancel, concurrency).await });
    }
    // The index stage finishes when every producer clone is gone.
    drop(tx);

    let mut providers = Vec::new();
    while let Some(joined) = fetch_tasks.join_next().await {
        match joined {
            Ok(outcome) => providers.push(outcome),
            Err(err) => error!("fetch task panicked: {err}"),
        }
    }

    let totals = match index_task.await {
        Ok(Ok(totals)) => totals,
        Ok(Err(err)) => {
            cancel.cancel();
            return Err(err.into());
        }
        Err(err) => {
            cancel.cancel();
            return Err(IndexError::StoreUnavailable(format!("index task panicked: {err}")).into());
        }
    };

    for outcome in &providers {
        if let Some(err) = &outcome.error {
            warn!(
                provider = %outcome.provider,
                source = outcome.source,
                "provider run failed: {err}"
            );
        }
    }

    Ok(CollectReport { providers, totals })
}

/// Fetch and normalize everything one provider has for the window, feeding
/// the shared queue. Window slices run concurrently up to the limit; the
/// first fatal error stops scheduling further slices for this provider.
async fn collect_provider<F: Fetch>(
    fetcher: F,
    window: TimeWindow,
    retry: BackoffPolicy,
    tx: mpsc::Sender<CanonicalLogRecord>,
    cancel: CancellationToken,
    concurrency: usize,
) -> ProviderOutcome {
    let fetched = AtomicUsize::new(0);
    let anomalies = AtomicUsize::new(0);
    let fetcher = Arc::new(fetcher);

    let result = futures::stream::iter(window.split_hourly().into_iter().map(Ok))
        .try_for_each_concurrent(concurrency, |slice| {
            let fetcher = Arc::clone(&fetcher);
            let retry = retry.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let fetched = &fetched;
            let anomalies = &anomalies;
            async move {
                collect_slice(&*fetcher, slice, &retry, &tx, &cancel, fetched, anomalies).await
            }
        })
        .await;

    let (cancelled, error) = match result {
        Ok(()) => (false, None),
        Err(FetchError::Cancelled) => (true, None),
        Err(err) => (false, Some(err.to_string())),
    };

    ProviderOutcome {
        provider: fetcher.provider(),
        source: fetcher.source().to_string(),
        fetched: fetched.load(Ordering::Relaxed),
        anomalies: anomalies.load(Ordering::Relaxed),
        cancelled,
        error,
    }
}

async fn collect_slice<F: Fetch>(
    fetcher: &F,
    slice: TimeWindow,
    retry: &BackoffPolicy,
    tx: &mpsc::Sender<CanonicalLogRecord>,
    cancel: &CancellationToken,
    fetched: &AtomicUsize,
    anomalies: &AtomicUsize,
) -> Result<(), FetchError> {
    let mut cursor: Option<String> = None;

    loop {
        let page = fetch_with_retry(fetcher, slice, cursor.as_deref(), retry, cancel).await?;

        for raw in &page.records {
            let record = normalize::normalize(raw);
            if record.raw_attributes.contains_key(normalize::ANOMALY_ATTR) {
                anomalies.fetch_add(1, Ordering::Relaxed);
            }
            fetched.fetch_add(1, Ordering::Relaxed);

            // Suspends here when the queue is full (indexer behind).
            if tx.send(record).await.is_err() {
                return Err(FetchError::Cancelled);
            }
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(()),
        }
    }
}

/// Consume the queue, cutting batches at the size cap or flush interval.
async fn run_index_stage(
    mut rx: mpsc::Receiver<CanonicalLogRecord>,
    indexer: Indexer,
    batch_size: usize,
    flush_interval: std::time::Duration,
    cancel: CancellationToken,
) -> Result<IndexResult, IndexError> {
    let mut totals = IndexResult::default();
    let mut batch: Vec<CanonicalLogRecord> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            flush(&indexer, &mut batch, &mut totals, &cancel).await?;
                        }
                    }
                    None => {
                        flush(&indexer, &mut batch, &mut totals, &cancel).await?;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&indexer, &mut batch, &mut totals, &cancel).await?;
            }
            () = cancel.cancelled() => {
                // Records still queued are dropped; re-running the window
                // re-ingests them idempotently.
                info!("index stage cancelled, {} records left unflushed", batch.len());
                break;
            }
        }
    }

    Ok(totals)
}

async fn flush(
    indexer: &Indexer,
    batch: &mut Vec<CanonicalLogRecord>,
    totals: &mut IndexResult,
    cancel: &CancellationToken,
) -> Result<(), IndexError> {
    if batch.is_empty() {
        return Ok(());
    }

    let records = std::mem::take(batch);
    let result = indexer.index(&records, cancel).await?;
    for rejection in &result.rejected {
        warn!(
            ingestion_id = rejection.record.ingestion_id,
            provider = %rejection.record.provider,
            "store rejected record: {}",
            rejection.reason
        );
    }
    totals.merge(result);
    Ok(())
}
