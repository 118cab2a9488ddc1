use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use harvest_collectors::CollectorSettings;
use harvest_storage::{BackoffPolicy, TokenBucketConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Per-source overrides picked up from `HARVEST_<SOURCE>_BASE_URL`,
/// `HARVEST_<SOURCE>_API_KEY` and `HARVEST_<SOURCE>_REQUESTS_PER_MINUTE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceOverride {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Request budget shared by every run of the source in this process.
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    /// Pause between domains during a full sync.
    pub domain_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub rate_limit_delay: Duration,
    pub http_backoff: BackoffPolicy,
    pub retry_sweep_interval: Duration,
    pub cleanup_sweep_interval: Duration,
    pub stuck_timeout: Duration,
    pub max_job_attempts: u32,
    pub workspace_root: PathBuf,
    pub source_overrides: BTreeMap<String, SourceOverride>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            scheduler_enabled: false,
            domain_delay: Duration::from_secs(5 * 60),
            http_timeout: Duration::from_secs(30),
            user_agent: format!("harvest/{}", env!("CARGO_PKG_VERSION")),
            rate_limit_delay: Duration::from_millis(500),
            http_backoff: BackoffPolicy::default(),
            retry_sweep_interval: Duration::from_secs(5 * 60),
            cleanup_sweep_interval: Duration::from_secs(15 * 60),
            stuck_timeout: Duration::from_secs(2 * 60 * 60),
            max_job_attempts: 3,
            workspace_root: PathBuf::from("."),
            source_overrides: BTreeMap::new(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit variable set; unparsable numbers fall back to
    /// the defaults.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            vars.get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let mut source_overrides: BTreeMap<String, SourceOverride> = BTreeMap::new();
        for (key, value) in &vars {
            let Some(rest) = key.strip_prefix("HARVEST_") else {
                continue;
            };
            if let Some(source) = rest.strip_suffix("_BASE_URL") {
                source_overrides
                    .entry(source.to_ascii_lowercase())
                    .or_default()
                    .base_url = Some(value.clone());
            } else if let Some(source) = rest.strip_suffix("_API_KEY") {
                source_overrides
                    .entry(source.to_ascii_lowercase())
                    .or_default()
                    .api_key = Some(value.clone());
            } else if let Some(source) = rest.strip_suffix("_REQUESTS_PER_MINUTE") {
                source_overrides
                    .entry(source.to_ascii_lowercase())
                    .or_default()
                    .requests_per_minute = value.trim().parse::<u32>().ok().filter(|n| *n > 0);
            }
        }

        Self {
            database_url: vars.get("DATABASE_URL").cloned(),
            scheduler_enabled: vars
                .get("HARVEST_SCHEDULER_ENABLED")
                .map(|v| parse_bool(v))
                .unwrap_or(defaults.scheduler_enabled),
            domain_delay: secs("HARVEST_DOMAIN_DELAY_SECS", defaults.domain_delay),
            http_timeout: secs("HARVEST_HTTP_TIMEOUT_SECS", defaults.http_timeout),
            user_agent: vars
                .get("HARVEST_USER_AGENT")
                .cloned()
                .unwrap_or(defaults.user_agent),
            rate_limit_delay: vars
                .get("HARVEST_RATE_LIMIT_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.rate_limit_delay),
            http_backoff: defaults.http_backoff,
            retry_sweep_interval: secs("HARVEST_RETRY_SWEEP_SECS", defaults.retry_sweep_interval),
            cleanup_sweep_interval: secs("HARVEST_CLEANUP_SWEEP_SECS", defaults.cleanup_sweep_interval),
            stuck_timeout: secs("HARVEST_STUCK_TIMEOUT_SECS", defaults.stuck_timeout),
            max_job_attempts: vars
                .get("HARVEST_MAX_JOB_ATTEMPTS")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(defaults.max_job_attempts),
            workspace_root: vars
                .get("HARVEST_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            source_overrides,
        }
    }

    pub fn domains_path(&self) -> PathBuf {
        self.workspace_root.join("domains.yaml")
    }

    /// Token bucket sizing for `source`, when it has a request budget.
    pub fn request_budget(&self, source: &str) -> Option<TokenBucketConfig> {
        let per_minute = self
            .source_overrides
            .get(&source.to_ascii_lowercase())?
            .requests_per_minute?;
        Some(TokenBucketConfig {
            capacity: per_minute,
            refill_every: Duration::from_secs(60) / per_minute,
        })
    }

    /// Settings a collector for `source` is constructed with. The shared
    /// limiter is attached by the orchestrator.
    pub fn collector_settings(&self, source: &str) -> CollectorSettings {
        let overrides = self
            .source_overrides
            .get(&source.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        CollectorSettings {
            base_url: overrides.base_url,
            api_key: overrides.api_key,
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: self.http_backoff,
            rate_limit_delay: self.rate_limit_delay,
            limiter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = HarvestConfig::from_vars(Vec::new());
        assert_eq!(config.domain_delay, Duration::from_secs(300));
        assert_eq!(config.stuck_timeout, Duration::from_secs(7200));
        assert_eq!(config.max_job_attempts, 3);
        assert!(!config.scheduler_enabled);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn env_values_override_defaults() {
        let config = HarvestConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://h:h@localhost/h"),
            ("HARVEST_SCHEDULER_ENABLED", "true"),
            ("HARVEST_DOMAIN_DELAY_SECS", "2"),
            ("HARVEST_MAX_JOB_ATTEMPTS", "5"),
            ("HARVEST_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("HARVEST_WORKSPACE_ROOT", "/srv/harvest"),
        ]));
        assert_eq!(config.database_url.as_deref(), Some("postgres://h:h@localhost/h"));
        assert!(config.scheduler_enabled);
        assert_eq!(config.domain_delay, Duration::from_secs(2));
        assert_eq!(config.max_job_attempts, 5);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.domains_path(), PathBuf::from("/srv/harvest/domains.yaml"));
    }

    #[test]
    fn source_overrides_reach_collector_settings() {
        let config = HarvestConfig::from_vars(vars(&[
            ("HARVEST_SAM_GOV_API_KEY", "abc"),
            ("HARVEST_SAM_GOV_BASE_URL", "http://localhost:9000"),
            ("HARVEST_USER_AGENT", "harvest-test"),
        ]));
        let settings = config.collector_settings("sam_gov");
        assert_eq!(settings.api_key.as_deref(), Some("abc"));
        assert_eq!(settings.base_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(settings.user_agent.as_deref(), Some("harvest-test"));

        let other = config.collector_settings("fred");
        assert!(other.api_key.is_none());
        assert!(other.base_url.is_none());
    }

    #[test]
    fn request_budget_spreads_a_minute_across_tokens() {
        let config = HarvestConfig::from_vars(vars(&[
            ("HARVEST_FRED_REQUESTS_PER_MINUTE", "120"),
            ("HARVEST_WORLDBANK_REQUESTS_PER_MINUTE", "0"),
        ]));
        let budget = config.request_budget("fred").unwrap();
        assert_eq!(budget.capacity, 120);
        assert_eq!(budget.refill_every, Duration::from_millis(500));
        assert!(config.request_budget("worldbank").is_none());
        assert!(config.request_budget("openalex").is_none());
    }
}
