use crate::fetch::BackoffPolicy;
use crate::index::StoreConfig;
use crate::query::GroupBy;
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("file error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("invalid duration '{0}': expected forms like 15m, 24h, 7d")]
    InvalidDuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Which providers a `collect` run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum CollectTarget {
    Aws,
    Azure,
    Gcp,
    /// Every provider with scopes configured.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum AnalysisKind {
    /// Top recurring error messages.
    Errors,
    /// Hourly volume time series.
    Trend,
    /// Error-rate and repetition anomalies.
    Anomalies,
}

#[derive(Parser, Debug)]
#[command(name = "skylog", version, about = "Multi-cloud log collection and analysis")]
pub struct Cli {
    /// Search store endpoint URL
    #[arg(long, env = "SKYLOG_STORE_ENDPOINT")]
    pub store_endpoint: Option<String>,

    /// Index naming prefix
    #[arg(long, env = "SKYLOG_INDEX_PREFIX")]
    pub index_prefix: Option<String>,

    /// Configuration file path (TOML)
    #[arg(long, env = "SKYLOG_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Diagnostic log level
    #[arg(long, env = "SKYLOG_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect logs from cloud providers into the store
    Collect {
        #[arg(value_enum)]
        target: CollectTarget,

        /// AWS CloudWatch log group (overrides configured scopes)
        #[arg(long)]
        log_group: Option<String>,

        /// Azure Log Analytics workspace id (overrides configured scopes)
        #[arg(long)]
        workspace_id: Option<String>,

        /// GCP project id (overrides configured scopes)
        #[arg(long)]
        project: Option<String>,

        /// Hours back from now to fetch
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Query stored logs
    Query {
        /// Full-text search over the message field
        #[arg(long)]
        text: Option<String>,

        /// Time range, e.g. 1h, 24h, 7d
        #[arg(long)]
        last: Option<String>,

        /// Maximum results to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Aggregate counts over stored logs
    Stats {
        #[arg(long, value_enum, default_value_t = GroupBy::Severity)]
        group_by: GroupBy,

        /// Time range, e.g. 1h, 24h, 7d
        #[arg(long)]
        last: Option<String>,
    },

    /// Analyze stored logs for patterns and trends
    Analyze {
        #[arg(long = "type", value_enum, default_value_t = AnalysisKind::Errors)]
        kind: AnalysisKind,

        /// Time range, e.g. 1h, 24h, 7d
        #[arg(long)]
        last: Option<String>,
    },
}

/// Parse duration strings like `15m`, `24h`, `7d`.
pub fn parse_duration(value: &str) -> Result<ChronoDuration, ConfigError> {
    let trimmed = value.trim();
    // Split on the last char, not the last byte: the unit may be any
    // (multi-byte) character and must come back as an error, not a panic.
    let Some((unit_index, unit)) = trimmed.char_indices().last() else {
        return Err(ConfigError::InvalidDuration(value.to_string()));
    };
    let amount: i64 = trimmed[..unit_index]
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(value.to_string()))?;
    if amount <= 0 {
        return Err(ConfigError::InvalidDuration(value.to_string()));
    }

    match unit {
        'm' => Ok(ChronoDuration::minutes(amount)),
        'h' => Ok(ChronoDuration::hours(amount)),
        'd' => Ok(ChronoDuration::days(amount)),
        _ => Err(ConfigError::InvalidDuration(value.to_string())),
    }
}

/// Pipeline sizing knobs. Defaults are starting points, not contracts; all
/// are overridable through the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Records per bulk write.
    pub batch_size: usize,
    /// Bound of the fetcher → indexer queue (records).
    pub queue_capacity: usize,
    /// Concurrent window slices per provider.
    pub fetch_concurrency: usize,
    /// Records requested per provider API page.
    pub page_size: usize,
    /// How long a partial batch may sit before being flushed.
    pub flush_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            queue_capacity: 2048,
            fetch_concurrency: 4,
            page_size: 1000,
            flush_interval_ms: 2000,
        }
    }
}

impl PipelineSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    pub endpoint: String,
    /// Log groups collected when no `--log-group` override is given.
    pub log_groups: Vec<String>,
    /// Name of the environment variable holding a pre-resolved API token.
    pub auth_token_env: Option<String>,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://logs.us-east-1.amazonaws.com/".to_string(),
            log_groups: Vec::new(),
            auth_token_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureSettings {
    pub endpoint: String,
    pub workspace_ids: Vec<String>,
    /// Log Analytics table queried per workspace.
    pub table: String,
    pub auth_token_env: Option<String>,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.loganalytics.io/".to_string(),
            workspace_ids: Vec::new(),
            table: "AppTraces".to_string(),
            auth_token_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcpSettings {
    pub endpoint: String,
    pub projects: Vec<String>,
    pub auth_token_env: Option<String>,
}

impl Default for GcpSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://logging.googleapis.com/".to_string(),
            projects: Vec::new(),
            auth_token_env: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub aws: AwsSettings,
    pub azure: AzureSettings,
    pub gcp: GcpSettings,
}

/// Fully resolved configuration: file values overlaid with CLI/env
/// overrides. Passed explicitly into each component; nothing reads ambient
/// global state.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub store: StoreConfig,
    pub pipeline: PipelineSettings,
    pub retry: RetrySettings,
    pub providers: ProviderSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    store: Option<StoreConfig>,
    pipeline: Option<PipelineSettings>,
    retry: Option<RetrySettings>,
    providers: Option<ProviderSettings>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file: FileSettings = match &cli.config_file {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => FileSettings::default(),
        };

        let mut settings = Settings {
            store: file.store.unwrap_or_default(),
            pipeline: file.pipeline.unwrap_or_default(),
            retry: file.retry.unwrap_or_default(),
            providers: file.providers.unwrap_or_default(),
        };

        if let Some(endpoint) = &cli.store_endpoint {
            settings.store.endpoint = endpoint.clone();
        }
        if let Some(prefix) = &cli.index_prefix {
            settings.store.index_prefix = prefix.clone();
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, endpoint) in [
            ("store", &self.store.endpoint),
            ("aws", &self.providers.aws.endpoint),
            ("azure", &self.providers.azure.endpoint),
            ("gcp", &self.providers.gcp.endpoint),
        ] {
            Url::parse(endpoint).map_err(|e| {
                ConfigError::InvalidUrl(format!("{name} endpoint '{endpoint}': {e}"))
            })?;
        }

        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.fetch_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "fetch concurrency must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.page_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "page size must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry max attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve an auth token named by `auth_token_env`. Credential flows are
    /// out of scope; the token must already exist in the environment.
    pub fn auth_token(env_name: Option<&str>) -> Option<String> {
        env_name.and_then(|name| std::env::var(name).ok())
    }
}
