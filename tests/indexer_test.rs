mod support;

use chrono::{TimeZone, Utc};
use skylog::domain::{Provider, Severity};
use skylog::fetch::BackoffPolicy;
use skylog::index::{IndexError, Indexer, IndexerConfig, StoreClient, StoreConfig};
use std::time::Duration;
use support::{BulkResponder, canonical_record};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_client(server: &MockServer) -> StoreClient {
    StoreClient::new(&StoreConfig {
        endpoint: server.uri(),
        index_prefix: "test-logs".to_string(),
        timeout_secs: 5,
    })
    .unwrap()
}

fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
    }
}

fn records(n: usize) -> Vec<skylog::CanonicalLogRecord> {
    (0..n)
        .map(|i| {
            canonical_record(
                Provider::Aws,
                "group-a",
                &format!("event-{i}"),
                Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, i as u32).unwrap(),
                Severity::Info,
                &format!("record {i}"),
            )
        })
        .collect()
}

#[tokio::test]
async fn reindexing_the_same_batch_is_a_noop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkResponder::new())
        .mount(&server)
        .await;

    let indexer = Indexer::new(
        store_client(&server),
        IndexerConfig {
            batch_size: 500,
            retry: fast_retry(),
        },
    );
    let cancel = CancellationToken::new();
    let batch = records(5);

    let first = indexer.index(&batch, &cancel).await.unwrap();
    assert_eq!(first.accepted, 5);
    assert_eq!(first.duplicates, 0);
    assert!(first.rejected.is_empty());

    // Same ingestion ids: the store reports conflicts, not new writes.
    let second = indexer.index(&batch, &cancel).await.unwrap();
    assert_eq!(second.accepted, 0);
    assert_eq!(second.duplicates, 5);
    assert!(second.rejected.is_empty());
}

#[tokio::test]
async fn partial_batch_failure_commits_the_rest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkResponder::rejecting("poison"))
        .mount(&server)
        .await;

    let indexer = Indexer::new(
        store_client(&server),
        IndexerConfig {
            batch_size: 500,
            retry: fast_retry(),
        },
    );

    let mut batch = records(10);
    batch[4].message = "poison pill".to_string();

    let result = indexer
        .index(&batch, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.accepted, 9);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].record.ingestion_id, batch[4].ingestion_id);
    assert!(result.rejected[0].reason.contains("mapper_parsing_exception"));

    // The nine accepted records are committed: replaying the batch finds
    // them already present, and the bad record is rejected again.
    let replay = indexer
        .index(&batch, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(replay.duplicates, 9);
    assert_eq!(replay.rejected.len(), 1);
}

#[tokio::test]
async fn transport_failures_retry_the_whole_batch() {
    let server = MockServer::start().await;
    // First attempt hits a 503, the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkResponder::new())
        .mount(&server)
        .await;

    let indexer = Indexer::new(
        store_client(&server),
        IndexerConfig {
            batch_size: 500,
            retry: fast_retry(),
        },
    );

    let result = indexer
        .index(&records(3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.accepted, 3);
    assert!(result.rejected.is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_store_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let indexer = Indexer::new(
        store_client(&server),
        IndexerConfig {
            batch_size: 500,
            retry: fast_retry(),
        },
    );

    let err = indexer
        .index(&records(2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::StoreUnavailable(_)));
}

#[tokio::test]
async fn batches_split_at_the_size_cap() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkResponder::new())
        .expect(3) // 7 records at cap 3 → 3 bulk requests
        .mount(&server)
        .await;

    let indexer = Indexer::new(
        store_client(&server),
        IndexerConfig {
            batch_size: 3,
            retry: fast_retry(),
        },
    );

    let result = indexer
        .index(&records(7), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.accepted, 7);
}

#[tokio::test]
async fn cancellation_stops_indexing_promptly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkResponder::new())
        .mount(&server)
        .await;

    let indexer = Indexer::new(
        store_client(&server),
        IndexerConfig {
            batch_size: 500,
            retry: fast_retry(),
        },
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = indexer.index(&records(2), &cancel).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled));
}
