//! Engine configuration.
//!
//! Everything is read from `TASKSYNC_*` environment variables. Remote
//! credentials are optional as a pair so local-only use works without them.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::models::EntityKind;
use crate::remote::RetryPolicy;
use crate::util::is_http_url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Endpoint and bearer token for the remote task service.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub base_url: String,
    pub token: String,
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteCredentials")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub remote: Option<RemoteCredentials>,
    pub min_request_interval: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub poll_interval: Duration,
    pub outbox_batch_size: usize,
    /// Failed attempts after which an outbox entry is abandoned
    pub stuck_threshold: u32,
    pub import_page_size: usize,
    pub import_pages_per_slice: usize,
    /// Stop the bulk import of a kind once this many records were imported
    pub import_target_records: Option<u64>,
    pub pull_page_size: usize,
    /// Subtracted from the last pull timestamp to cover coarse remote clocks
    pub pull_overlap: Duration,
    /// Remote collection name per entity kind
    pub collections: BTreeMap<EntityKind, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote: None,
            min_request_interval: Duration::from_millis(334),
            request_timeout: Duration::from_secs(120),
            max_attempts: 5,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(60_000),
            poll_interval: Duration::from_secs(60),
            outbox_batch_size: 50,
            stuck_threshold: 8,
            import_page_size: 25,
            import_pages_per_slice: 10,
            import_target_records: None,
            pull_page_size: 100,
            pull_overlap: Duration::from_secs(120),
            collections: default_collections(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let remote = parse_remote_credentials(&lookup)?;

        let min_request_interval_ms =
            bounded_u64(&lookup, "TASKSYNC_MIN_REQUEST_INTERVAL_MS", 334, 0..=60_000)?;
        let request_timeout_secs =
            bounded_u64(&lookup, "TASKSYNC_REQUEST_TIMEOUT_SECS", 120, 1..=600)?;
        let max_attempts = bounded_u64(&lookup, "TASKSYNC_MAX_ATTEMPTS", 5, 1..=20)?;
        let backoff_base_ms =
            bounded_u64(&lookup, "TASKSYNC_BACKOFF_BASE_MS", 1_000, 1..=60_000)?;
        let backoff_max_ms =
            bounded_u64(&lookup, "TASKSYNC_BACKOFF_MAX_MS", 60_000, 1..=3_600_000)?;
        if backoff_max_ms < backoff_base_ms {
            return Err(ConfigError::Invalid(
                "TASKSYNC_BACKOFF_MAX_MS must be >= TASKSYNC_BACKOFF_BASE_MS".to_string(),
            ));
        }
        let poll_interval_secs =
            bounded_u64(&lookup, "TASKSYNC_POLL_INTERVAL_SECS", 60, 5..=86_400)?;
        let outbox_batch_size = bounded_u64(&lookup, "TASKSYNC_OUTBOX_BATCH_SIZE", 50, 1..=1_000)?;
        let stuck_threshold = bounded_u64(&lookup, "TASKSYNC_STUCK_THRESHOLD", 8, 1..=100)?;
        let import_page_size = bounded_u64(&lookup, "TASKSYNC_IMPORT_PAGE_SIZE", 25, 1..=100)?;
        let import_pages_per_slice =
            bounded_u64(&lookup, "TASKSYNC_IMPORT_PAGES_PER_SLICE", 10, 1..=1_000)?;
        let import_target_records = optional_trimmed(&lookup, "TASKSYNC_IMPORT_TARGET_RECORDS")
            .map(|value| {
                value.parse::<u64>().ok().filter(|target| *target > 0).ok_or_else(|| {
                    ConfigError::Invalid(
                        "TASKSYNC_IMPORT_TARGET_RECORDS must be a positive integer".to_string(),
                    )
                })
            })
            .transpose()?;
        let pull_page_size = bounded_u64(&lookup, "TASKSYNC_PULL_PAGE_SIZE", 100, 1..=100)?;
        let pull_overlap_secs =
            bounded_u64(&lookup, "TASKSYNC_PULL_OVERLAP_SECS", 120, 0..=86_400)?;

        let mut collections = default_collections();
        for (kind, name) in [
            (EntityKind::Task, "TASKSYNC_TASKS_COLLECTION"),
            (EntityKind::Project, "TASKSYNC_PROJECTS_COLLECTION"),
            (EntityKind::TimeEntry, "TASKSYNC_TIME_ENTRIES_COLLECTION"),
            (EntityKind::Note, "TASKSYNC_NOTES_COLLECTION"),
        ] {
            if let Some(collection) = optional_trimmed(&lookup, name) {
                collections.insert(kind, collection);
            }
        }

        Ok(Self {
            remote,
            min_request_interval: Duration::from_millis(min_request_interval_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_attempts: to_u32(max_attempts),
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            poll_interval: Duration::from_secs(poll_interval_secs),
            outbox_batch_size: to_usize(outbox_batch_size),
            stuck_threshold: to_u32(stuck_threshold),
            import_page_size: to_usize(import_page_size),
            import_pages_per_slice: to_usize(import_pages_per_slice),
            import_target_records,
            pull_page_size: to_usize(pull_page_size),
            pull_overlap: Duration::from_secs(pull_overlap_secs),
            collections,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
            ..RetryPolicy::default()
        }
    }

    pub fn collection(&self, kind: EntityKind) -> Option<&str> {
        self.collections.get(&kind).map(String::as_str)
    }

    pub fn pull_overlap_ms(&self) -> i64 {
        i64::try_from(self.pull_overlap.as_millis()).unwrap_or(i64::MAX)
    }
}

fn default_collections() -> BTreeMap<EntityKind, String> {
    EntityKind::ALL
        .into_iter()
        .map(|kind| (kind, kind.schema().table.to_string()))
        .collect()
}

fn parse_remote_credentials(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<RemoteCredentials>, ConfigError> {
    let base_url = optional_trimmed(&lookup, "TASKSYNC_API_BASE_URL");
    let token = optional_trimmed(&lookup, "TASKSYNC_API_TOKEN");
    if base_url.is_none() && token.is_none() {
        return Ok(None);
    }

    let base_url = base_url.ok_or(ConfigError::MissingVar("TASKSYNC_API_BASE_URL"))?;
    let token = token.ok_or(ConfigError::MissingVar("TASKSYNC_API_TOKEN"))?;
    if !is_http_url(&base_url) {
        return Err(ConfigError::Invalid(
            "TASKSYNC_API_BASE_URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(Some(RemoteCredentials {
        base_url: base_url.trim_end_matches('/').to_string(),
        token,
    }))
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| invalid())?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        EngineConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply_without_any_variables() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.collection(EntityKind::TimeEntry), Some("time_entries"));
        assert_eq!(config.pull_overlap_ms(), 120_000);
    }

    #[test]
    fn credentials_are_required_as_a_pair() {
        let err = config_from(&[("TASKSYNC_API_TOKEN", "secret")]).unwrap_err();
        assert!(err.to_string().contains("TASKSYNC_API_BASE_URL"));

        let err = config_from(&[("TASKSYNC_API_BASE_URL", "https://api.example.com")])
            .unwrap_err();
        assert!(err.to_string().contains("TASKSYNC_API_TOKEN"));
    }

    #[test]
    fn base_url_must_be_http_and_loses_trailing_slash() {
        let err = config_from(&[
            ("TASKSYNC_API_BASE_URL", "api.example.com"),
            ("TASKSYNC_API_TOKEN", "secret"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = config_from(&[
            ("TASKSYNC_API_BASE_URL", "https://api.example.com/v1/"),
            ("TASKSYNC_API_TOKEN", "secret"),
        ])
        .unwrap();
        assert_eq!(
            config.remote.map(|remote| remote.base_url),
            Some("https://api.example.com/v1".to_string())
        );
    }

    #[test]
    fn integers_are_range_checked() {
        let err = config_from(&[("TASKSYNC_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("TASKSYNC_MAX_ATTEMPTS"));

        let err = config_from(&[("TASKSYNC_PULL_PAGE_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("TASKSYNC_PULL_PAGE_SIZE"));

        let err = config_from(&[
            ("TASKSYNC_BACKOFF_BASE_MS", "5000"),
            ("TASKSYNC_BACKOFF_MAX_MS", "1000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("TASKSYNC_BACKOFF_MAX_MS"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("TASKSYNC_MAX_ATTEMPTS", "3"),
            ("TASKSYNC_BACKOFF_BASE_MS", "250"),
            ("TASKSYNC_IMPORT_TARGET_RECORDS", "500"),
            ("TASKSYNC_NOTES_COLLECTION", " journal "),
        ])
        .unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(config.import_target_records, Some(500));
        assert_eq!(config.collection(EntityKind::Note), Some("journal"));
    }

    #[test]
    fn debug_output_redacts_token() {
        let config = config_from(&[
            ("TASKSYNC_API_BASE_URL", "https://api.example.com"),
            ("TASKSYNC_API_TOKEN", "sensitive-api-token"),
        ])
        .unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-api-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
