pub mod config;
pub mod pipeline;
pub mod shutdown;

pub use config::{Cli, Command, PipelineSettings, Settings};
pub use pipeline::{CollectReport, ProviderOutcome, run_collect};

use crate::fetch::{AwsFetcher, AzureFetcher, GcpFetcher, ProviderFetcher, TimeWindow};
use crate::index::{Indexer, IndexerConfig, StoreClient};
use crate::query::{Analyzer, Anomaly, GroupBy, QueryClient, QueryFilter};
use anyhow::{Context, bail};
use config::{AnalysisKind, CollectTarget, ConfigError, parse_duration};
use futures::TryStreamExt;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.log_level)?;
    let settings = Settings::load(&cli).context("loading configuration")?;

    let store = StoreClient::new(&settings.store).context("building store client")?;

    match cli.command {
        Command::Collect {
            target,
            ref log_group,
            ref workspace_id,
            ref project,
            hours,
        } => {
            let window = TimeWindow::last_hours(hours);
            let scopes = ScopeOverrides {
                log_group: log_group.clone(),
                workspace_id: workspace_id.clone(),
                project: project.clone(),
            };
            collect(&settings, store, target, scopes, window).await
        }
        Command::Query { text, last, limit } => {
            let range = range_from(last.as_deref(), 24)?;
            query(store, text, range, limit).await
        }
        Command::Stats { group_by, last } => {
            let range = range_from(last.as_deref(), 24)?;
            stats(store, group_by, range).await
        }
        Command::Analyze { kind, last } => {
            let range = range_from(last.as_deref(), 24 * 7)?;
            analyze(store, kind, range).await
        }
    }
}

fn init_tracing(level: config::LogLevel) -> anyhow::Result<()> {
    let level: tracing::Level = level.into();
    let filter = EnvFilter::try_new(format!("{level},hyper=warn,reqwest=warn,h2=warn"))
        .context("building log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

fn range_from(last: Option<&str>, default_hours: i64) -> Result<TimeWindow, ConfigError> {
    let duration = match last {
        Some(value) => parse_duration(value)?,
        None => chrono::Duration::hours(default_hours),
    };
    let end = chrono::Utc::now();
    TimeWindow::new(end - duration, end)
        .ok_or_else(|| ConfigError::InvalidConfig("empty time range".to_string()))
}

struct ScopeOverrides {
    log_group: Option<String>,
    workspace_id: Option<String>,
    project: Option<String>,
}

async fn collect(
    settings: &Settings,
    store: StoreClient,
    target: CollectTarget,
    scopes: ScopeOverrides,
    window: TimeWindow,
) -> anyhow::Result<()> {
    // An unreachable store is fatal before any provider work starts.
    store
        .ping()
        .await
        .context("store unreachable, aborting collect")?;
    if let Err(err) = store.ensure_template().await {
        warn!("could not install index template: {err}");
    }

    let fetchers = build_fetchers(settings, target, &scopes)?;
    if fetchers.is_empty() {
        bail!("no provider scopes selected; pass --log-group/--workspace-id/--project or configure scope lists");
    }

    let indexer = Indexer::new(
        store,
        IndexerConfig {
            batch_size: settings.pipeline.batch_size,
            retry: settings.retry.policy(),
        },
    );

    info!(
        providers = fetchers.len(),
        start = %window.start,
        end = %window.end,
        "starting collect run"
    );

    let cancel = shutdown::install_signal_handler();
    let report = run_collect(
        fetchers,
        window,
        indexer,
        &settings.pipeline,
        settings.retry.policy(),
        cancel,
    )
    .await?;

    print_collect_report(&report);
    if report.total_failure() {
        if report.providers.iter().any(|p| p.cancelled) {
            bail!("collect cancelled before any records were committed");
        }
        bail!("collect failed for every provider");
    }
    Ok(())
}

fn print_collect_report(report: &CollectReport) {
    for outcome in &report.providers {
        match &outcome.error {
            _ if outcome.cancelled => println!(
                "{}/{}: cancelled after {} records",
                outcome.provider, outcome.source, outcome.fetched
            ),
            None => println!(
                "{}/{}: fetched {} records ({} with anomalies)",
                outcome.provider, outcome.source, outcome.fetched, outcome.anomalies
            ),
            Some(err) => println!("{}/{}: FAILED: {err}", outcome.provider, outcome.source),
        }
    }
    println!(
        "indexed {} new, {} already present, {} rejected",
        report.totals.accepted,
        report.totals.duplicates,
        report.totals.rejected.len()
    );
}

fn build_fetchers(
    settings: &Settings,
    target: CollectTarget,
    scopes: &ScopeOverrides,
) -> anyhow::Result<Vec<ProviderFetcher>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .gzip(true)
        .user_agent(concat!("skylog/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building provider HTTP client")?;
    let page_size = settings.pipeline.page_size;
    let providers = &settings.providers;
    let mut fetchers = Vec::new();

    if matches!(target, CollectTarget::Aws | CollectTarget::All) {
        let endpoint: Url = providers.aws.endpoint.parse()?;
        let token = Settings::auth_token(providers.aws.auth_token_env.as_deref());
        for group in scoped(&scopes.log_group, &providers.aws.log_groups) {
            fetchers.push(ProviderFetcher::Aws(AwsFetcher::new(
                client.clone(),
                endpoint.clone(),
                group,
                token.clone(),
                page_size,
            )));
        }
    }

    if matches!(target, CollectTarget::Azure | CollectTarget::All) {
        let endpoint: Url = providers.azure.endpoint.parse()?;
        let token = Settings::auth_token(providers.azure.auth_token_env.as_deref());
        for workspace in scoped(&scopes.workspace_id, &providers.azure.workspace_ids) {
            fetchers.push(ProviderFetcher::Azure(AzureFetcher::new(
                client.clone(),
                endpoint.clone(),
                workspace,
                providers.azure.table.clone(),
                token.clone(),
                page_size,
            )));
        }
    }

    if matches!(target, CollectTarget::Gcp | CollectTarget::All) {
        let endpoint: Url = providers.gcp.endpoint.parse()?;
        let token = Settings::auth_token(providers.gcp.auth_token_env.as_deref());
        for project in scoped(&scopes.project, &providers.gcp.projects) {
            fetchers.push(ProviderFetcher::Gcp(GcpFetcher::new(
                client.clone(),
                endpoint.clone(),
                project,
                token.clone(),
                page_size,
            )));
        }
    }

    Ok(fetchers)
}

/// A CLI scope override replaces the configured scope list.
fn scoped(override_scope: &Option<String>, configured: &[String]) -> Vec<String> {
    match override_scope {
        Some(scope) => vec![scope.clone()],
        None => configured.to_vec(),
    }
}

async fn query(
    store: StoreClient,
    text: Option<String>,
    range: TimeWindow,
    limit: usize,
) -> anyhow::Result<()> {
    let client = QueryClient::new(store);
    let filter = QueryFilter {
        text,
        ..QueryFilter::default()
    };

    let stream = client.query(filter, range);
    futures::pin_mut!(stream);

    let mut shown = 0usize;
    while shown < limit {
        let Some(record) = stream.try_next().await? else {
            break;
        };
        println!(
            "[{}] {} ({}/{}): {}",
            record.timestamp.to_rfc3339(),
            record.severity,
            record.provider,
            record.source,
            record.message
        );
        shown += 1;
    }
    println!("\n{shown} matching logs shown");
    Ok(())
}

async fn stats(store: StoreClient, group_by: GroupBy, range: TimeWindow) -> anyhow::Result<()> {
    let analyzer = Analyzer::new(QueryClient::new(store));
    let stats = analyzer.stats(group_by, range).await?;

    println!("Total logs: {}", stats.total);
    let mut breakdown: Vec<(&String, &u64)> = stats.breakdown.iter().collect();
    breakdown.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (key, count) in breakdown {
        let share = if stats.total > 0 {
            *count as f64 / stats.total as f64 * 100.0
        } else {
            0.0
        };
        println!("  {key}: {count} ({share:.2}%)");
    }
    Ok(())
}

async fn analyze(store: StoreClient, kind: AnalysisKind, range: TimeWindow) -> anyhow::Result<()> {
    let analyzer = Analyzer::new(QueryClient::new(store));

    match kind {
        AnalysisKind::Errors => {
            let top = analyzer.top_errors(range, 10).await?;
            if top.is_empty() {
                println!("No errors in range");
                return Ok(());
            }
            println!("Top error messages:");
            for (rank, (message, count)) in top.iter().enumerate() {
                println!("{}. {message} ({count} occurrences)", rank + 1);
            }
        }
        AnalysisKind::Trend => {
            for (bucket, count) in analyzer.time_series(range).await? {
                println!("{bucket}  {count}");
            }
        }
        AnalysisKind::Anomalies => {
            let anomalies = analyzer.detect_anomalies(range).await?;
            if anomalies.is_empty() {
                println!("No anomalies detected");
                return Ok(());
            }
            for anomaly in anomalies {
                match anomaly {
                    Anomaly::HighErrorRate { rate, errors } => println!(
                        "high error rate: {:.1}% of records are errors ({errors} total)",
                        rate * 100.0
                    ),
                    Anomaly::RepeatedError { message, count } => {
                        println!("repeated error ({count}x): {message}");
                    }
                }
            }
        }
    }
    Ok(())
}
