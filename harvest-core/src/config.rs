//! Harvest configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a conservative setup. Safety-relevant values are
//! clamped by [`HarvestConfig::validate`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::CoreError;

/// Service name of the primary bibliographic source
pub const SCHOLAR_SERVICE: &str = "scholar_profile";
/// Service name of the DOI lookup
pub const CROSSREF_SERVICE: &str = "crossref";
/// Service name of the arXiv lookup
pub const ARXIV_SERVICE: &str = "arxiv";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub gateways: GatewaysConfig,
    pub safety: SafetyConfig,
    pub queue: QueueConfig,
    pub ingestion: IngestionConfig,
    pub scheduler: SchedulerConfig,
    pub enrichment: EnrichmentConfig,
    pub http: HttpConfig,
}

impl HarvestConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        let config: HarvestConfig =
            toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CoreError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values that would disable the safety floors
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, gateway) in self.gateways.iter() {
            if gateway.min_interval_secs < 0.0 {
                return Err(CoreError::Config(format!(
                    "gateways.{}.min_interval_secs must not be negative",
                    name
                )));
            }
            if gateway.request_timeout_secs == 0 {
                return Err(CoreError::Config(format!(
                    "gateways.{}.request_timeout_secs must be positive",
                    name
                )));
            }
        }
        if self.safety.blocked_failure_threshold == 0 || self.safety.network_failure_threshold == 0 {
            return Err(CoreError::Config(
                "safety thresholds must be at least 1".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(CoreError::Config("queue.max_attempts must be at least 1".to_string()));
        }
        if self.ingestion.page_size == 0 {
            return Err(CoreError::Config("ingestion.page_size must be positive".to_string()));
        }
        if self.queue.base_delay_secs > self.queue.max_delay_secs {
            return Err(CoreError::Config(
                "queue.base_delay_secs must not exceed queue.max_delay_secs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-service gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Minimum spacing between two requests to the service
    pub min_interval_secs: f64,
    /// Timeout applied to every dispatched request
    pub request_timeout_secs: u64,
    /// How long a successful response stays cached
    pub cache_ttl_secs: u64,
    /// Upper bound on cached responses
    pub cache_max_entries: usize,
    /// Service-wide pause after a rate-limit response
    pub rate_limit_cooldown_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 1.0,
            request_timeout_secs: 20,
            cache_ttl_secs: 3600,
            cache_max_entries: 1024,
            rate_limit_cooldown_secs: 300,
        }
    }
}

impl GatewayConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_interval_secs.max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    fn scholar_default() -> Self {
        Self {
            min_interval_secs: 8.0,
            request_timeout_secs: 30,
            cache_ttl_secs: 900,
            cache_max_entries: 256,
            rate_limit_cooldown_secs: 1800,
        }
    }

    fn crossref_default() -> Self {
        Self {
            min_interval_secs: 1.0,
            request_timeout_secs: 20,
            cache_ttl_secs: 86_400,
            cache_max_entries: 4096,
            rate_limit_cooldown_secs: 120,
        }
    }

    fn arxiv_default() -> Self {
        Self {
            min_interval_secs: 3.0,
            request_timeout_secs: 20,
            cache_ttl_secs: 86_400,
            cache_max_entries: 4096,
            rate_limit_cooldown_secs: 300,
        }
    }
}

/// Gateway settings for the three external services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaysConfig {
    #[serde(default = "GatewayConfig::scholar_default")]
    pub scholar_profile: GatewayConfig,
    #[serde(default = "GatewayConfig::crossref_default")]
    pub crossref: GatewayConfig,
    #[serde(default = "GatewayConfig::arxiv_default")]
    pub arxiv: GatewayConfig,
}

impl Default for GatewaysConfig {
    fn default() -> Self {
        Self {
            scholar_profile: GatewayConfig::scholar_default(),
            crossref: GatewayConfig::crossref_default(),
            arxiv: GatewayConfig::arxiv_default(),
        }
    }
}

impl GatewaysConfig {
    /// Iterate `(service name, settings)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &GatewayConfig)> {
        [
            (SCHOLAR_SERVICE, &self.scholar_profile),
            (CROSSREF_SERVICE, &self.crossref),
            (ARXIV_SERVICE, &self.arxiv),
        ]
        .into_iter()
    }
}

/// Safety thresholds and cooldowns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub blocked_failure_threshold: u32,
    pub blocked_cooldown_secs: u64,
    pub network_failure_threshold: u32,
    pub network_cooldown_secs: u64,
    /// Minimum spacing between two run starts in the same scope
    pub min_run_interval_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_failure_threshold: 1,
            blocked_cooldown_secs: 6 * 3600,
            network_failure_threshold: 3,
            network_cooldown_secs: 30 * 60,
            min_run_interval_secs: 4 * 60,
        }
    }
}

/// Continuation queue backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    pub drain_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 600,
            max_delay_secs: 6 * 3600,
            max_attempts: 5,
            drain_batch_size: 10,
        }
    }
}

/// Pagination and per-page retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub page_size: u32,
    /// Pages shared by all scholars in pass 2 of one run
    pub pass2_page_budget: u32,
    pub pass1_concurrency: usize,
    pub network_max_retries: u32,
    pub network_backoff_secs: u64,
    pub rate_limit_max_retries: u32,
    pub rate_limit_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            pass2_page_budget: 10,
            pass1_concurrency: 2,
            network_max_retries: 2,
            network_backoff_secs: 5,
            rate_limit_max_retries: 3,
            rate_limit_backoff_secs: 60,
            max_backoff_secs: 900,
        }
    }
}

/// Tick loop and trigger policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub automation_enabled: bool,
    pub manual_enabled: bool,
    pub tick_interval_secs: u64,
    /// Spacing of full automated runs per scope
    pub auto_run_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            automation_enabled: false,
            manual_enabled: true,
            tick_interval_secs: 300,
            auto_run_interval_secs: 24 * 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Identifier resolution and near-duplicate detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    /// Identifiers at or above this confidence make further lookups pointless
    pub high_confidence: f64,
    pub min_title_tokens: usize,
    pub min_title_chars: usize,
    pub min_match_similarity: f64,
    pub near_duplicate_threshold: f64,
    pub near_duplicate_year_window: i32,
    /// Contact address sent to Crossref's polite pool
    pub mailto: Option<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_confidence: 0.9,
            min_title_tokens: 3,
            min_title_chars: 12,
            min_match_similarity: 0.85,
            near_duplicate_threshold: 0.9,
            near_duplicate_year_window: 1,
            mailto: None,
        }
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Optional proxy (e.g. `socks5h://127.0.0.1:9050`)
    pub proxy: Option<String>,
    pub user_agent_rotation: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent_rotation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HarvestConfig::from_toml_str("").unwrap();
        assert_eq!(config.gateways.scholar_profile.min_interval_secs, 8.0);
        assert_eq!(config.gateways.crossref.min_interval_secs, 1.0);
        assert_eq!(config.safety.blocked_failure_threshold, 1);
        assert!(!config.scheduler.automation_enabled);
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"
            [gateways.arxiv]
            min_interval_secs = 5.0
            cache_max_entries = 10

            [queue]
            max_attempts = 2

            [ingestion]
            pass2_page_budget = 4
        "#;
        let config = HarvestConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.gateways.arxiv.min_interval_secs, 5.0);
        assert_eq!(config.gateways.arxiv.cache_max_entries, 10);
        assert_eq!(config.queue.max_attempts, 2);
        assert_eq!(config.queue.base_delay_secs, 600);
        assert_eq!(config.ingestion.pass2_page_budget, 4);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let raw = "[safety]\nblocked_failure_threshold = 0\n";
        assert!(HarvestConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_inverted_queue_delays() {
        let raw = "[queue]\nbase_delay_secs = 100\nmax_delay_secs = 10\n";
        assert!(HarvestConfig::from_toml_str(raw).is_err());
    }
}
