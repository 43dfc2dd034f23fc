//! Relay configuration: per-limiter shapes, queue tunables, cache and
//! session sweep cadence, and the global confidence threshold.
//!
//! Defaults mirror the rates the production relay is tuned for; a TOML file
//! can override any subset of them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::limiter::RateLimiterConfig;
use crate::queue::QueueConfig;

/// Model-limiter shape, expressed as a requests-per-minute budget.
///
/// Spacing and reservoir are derived from the rate rather than configured
/// separately: spacing spreads the budget evenly across the minute and the
/// reservoir equals the rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimiterConfig {
    pub requests_per_minute: u32,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub default_quota_delay: Duration,
    pub transient_retry_delay: Duration,
}

impl Default for ModelLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            max_concurrency: 3,
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            default_quota_delay: Duration::from_secs(20),
            transient_retry_delay: Duration::from_secs(1),
        }
    }
}

impl ModelLimiterConfig {
    pub fn to_limiter_config(&self) -> RateLimiterConfig {
        let mut config = RateLimiterConfig::model(self.requests_per_minute);
        config.max_concurrency = self.max_concurrency;
        config.max_retries = self.max_retries;
        config.base_retry_delay = self.base_retry_delay;
        config.max_retry_delay = self.max_retry_delay;
        config.default_quota_delay = self.default_quota_delay;
        config.transient_retry_delay = self.transient_retry_delay;
        config
    }
}

/// Top-level configuration for the dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub chat_limiter: RateLimiterConfig,
    pub code_host_limiter: RateLimiterConfig,
    pub model_limiter: ModelLimiterConfig,
    pub queue: QueueConfig,
    /// Cadence of the expired-context sweep.
    pub context_sweep_interval: Duration,
    /// TTL for in-flight setup conversations.
    pub setup_session_ttl_minutes: i64,
    /// Cadence of the expired-setup-session sweep.
    pub setup_session_sweep_interval: Duration,
    /// Global confidence threshold below which execution is skipped;
    /// groups may override it.
    pub min_confidence: f32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chat_limiter: RateLimiterConfig::chat(),
            code_host_limiter: RateLimiterConfig::code_host(),
            model_limiter: ModelLimiterConfig::default(),
            queue: QueueConfig::default(),
            context_sweep_interval: Duration::from_secs(300),
            setup_session_ttl_minutes: 15,
            setup_session_sweep_interval: Duration::from_secs(300),
            min_confidence: 0.7,
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: RelayConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "relay configuration loaded");
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}
