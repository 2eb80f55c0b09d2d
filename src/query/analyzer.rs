use super::{GroupBy, QueryClient, QueryError, QueryFilter};
use crate::fetch::TimeWindow;
use futures::TryStreamExt;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// Error rate (errors / total) above which the window is flagged.
const ERROR_RATE_THRESHOLD: f64 = 0.10;
/// A single simplified error message repeating more than this is flagged.
const REPEATED_ERROR_THRESHOLD: u64 = 10;
const MESSAGE_TRUNCATE_LEN: usize = 100;

#[derive(Debug)]
pub struct Stats {
    pub total: u64,
    pub breakdown: HashMap<String, u64>,
}

#[derive(Debug, PartialEq)]
pub enum Anomaly {
    HighErrorRate { rate: f64, errors: u64 },
    RepeatedError { message: String, count: u64 },
}

/// Read-side statistics and trend analysis over the canonical schema.
///
/// Every computation is a streaming reduction over the query sequence;
/// nothing materializes the full record set.
#[derive(Debug, Clone)]
pub struct Analyzer {
    client: QueryClient,
}

impl Analyzer {
    pub fn new(client: QueryClient) -> Self {
        Self { client }
    }

    /// Total count and per-group breakdown for the window.
    pub async fn stats(&self, group_by: GroupBy, range: TimeWindow) -> Result<Stats, QueryError> {
        let breakdown = self.client.aggregate(group_by, range).await?;
        let total = breakdown.values().sum();
        Ok(Stats { total, breakdown })
    }

    /// Top recurring error messages, with dynamic content (timestamps, ids,
    /// addresses) stripped so recurrences collapse to one key.
    pub async fn top_errors(
        &self,
        range: TimeWindow,
        limit: usize,
    ) -> Result<Vec<(String, u64)>, QueryError> {
        let counts = self.error_fingerprints(range).await?;

        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Hourly record counts, keyed by `YYYY-MM-DDTHH`.
    pub async fn time_series(&self, range: TimeWindow) -> Result<BTreeMap<String, u64>, QueryError> {
        let stream = self.client.query(QueryFilter::default(), range);
        futures::pin_mut!(stream);

        let mut buckets: BTreeMap<String, u64> = BTreeMap::new();
        while let Some(record) = stream.try_next().await? {
            let bucket = record.timestamp.format("%Y-%m-%dT%H").to_string();
            *buckets.entry(bucket).or_default() += 1;
        }
        Ok(buckets)
    }

    /// Flag windows with an outsized error share or individual errors that
    /// keep recurring.
    pub async fn detect_anomalies(&self, range: TimeWindow) -> Result<Vec<Anomaly>, QueryError> {
        let stream = self.client.query(QueryFilter::default(), range);
        futures::pin_mut!(stream);

        let mut total: u64 = 0;
        let mut errors: u64 = 0;
        let mut fingerprints: HashMap<String, u64> = HashMap::new();

        while let Some(record) = stream.try_next().await? {
            total += 1;
            if record.severity.is_error() {
                errors += 1;
                *fingerprints
                    .entry(simplify_message(&record.message))
                    .or_default() += 1;
            }
        }

        let mut anomalies = Vec::new();
        if total > 0 {
            let rate = errors as f64 / total as f64;
            if rate > ERROR_RATE_THRESHOLD {
                anomalies.push(Anomaly::HighErrorRate { rate, errors });
            }
        }

        let mut repeated: Vec<(String, u64)> = fingerprints
            .into_iter()
            .filter(|(_, count)| *count > REPEATED_ERROR_THRESHOLD)
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (message, count) in repeated {
            anomalies.push(Anomaly::RepeatedError { message, count });
        }

        Ok(anomalies)
    }

    async fn error_fingerprints(
        &self,
        range: TimeWindow,
    ) -> Result<HashMap<String, u64>, QueryError> {
        let stream = self.client.query(QueryFilter::default(), range);
        futures::pin_mut!(stream);

        let mut counts: HashMap<String, u64> = HashMap::new();
        while let Some(record) = stream.try_next().await? {
            if record.severity.is_error() {
                *counts
                    .entry(simplify_message(&record.message))
                    .or_default() += 1;
            }
        }
        Ok(counts)
    }
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
            .expect("valid timestamp regex")
    })
}

fn hex_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b[0-9a-f]{8,}\b").expect("valid hex id regex"))
}

fn ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("valid ip regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d+\b").expect("valid number regex"))
}

/// Collapse the dynamic parts of an error message so repeated occurrences of
/// the same underlying failure share a fingerprint.
pub fn simplify_message(message: &str) -> String {
    let simplified = timestamp_re().replace_all(message, "[TIMESTAMP]");
    let simplified = hex_id_re().replace_all(&simplified, "[ID]");
    let simplified = ip_re().replace_all(&simplified, "[IP]");
    let simplified = number_re().replace_all(&simplified, "[NUM]");

    let trimmed = simplified.trim();
    if trimmed.len() > MESSAGE_TRUNCATE_LEN {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i <= MESSAGE_TRUNCATE_LEN)
            .last()
            .map_or(0, |(i, _)| i);
        format!("{}...", &trimmed[..cut])
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_timestamps_ids_ips_and_numbers() {
        let raw = "2024-06-01T10:00:05Z request deadbeef1234 from 10.0.0.17 failed after 30 retries";
        assert_eq!(
            simplify_message(raw),
            "[TIMESTAMP] request [ID] from [IP] failed after [NUM] retries"
        );
    }

    #[test]
    fn identical_failures_with_different_dynamics_share_a_fingerprint() {
        let a = simplify_message("ERROR: query 8c1d2e3f4a5b timed out after 30 ms at 10.0.0.1");
        let b = simplify_message("ERROR: query 1a2b3c4d5e6f timed out after 45 ms at 10.0.0.9");
        assert_eq!(a, b);
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundaries() {
        let long = "x".repeat(400);
        let simplified = simplify_message(&long);
        assert!(simplified.len() <= MESSAGE_TRUNCATE_LEN + 4);
        assert!(simplified.ends_with("..."));
    }

    #[test]
    fn short_messages_pass_through_trimmed() {
        assert_eq!(simplify_message("  plain failure  "), "plain failure");
    }
}
