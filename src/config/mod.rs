//! Engine configuration.
//!
//! Every section is optional in JSON; missing fields take their defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::browser::BrowserConfig;
use crate::external_deps::captcha::CaptchaConfig;
use crate::modules::cache::CacheConfig;
use crate::modules::pool::PoolConfig;
use crate::modules::rate_limit::RateLimitConfig;
use crate::normalizer::NormalizerRules;
use crate::sources::ProviderId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result lifetimes per provider, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub vk: u64,
    pub whatsapp: u64,
    pub instagram: u64,
    pub getcontact: u64,
    pub whocalls: u64,
}

impl TtlConfig {
    pub fn for_provider(&self, provider: ProviderId) -> Duration {
        let secs = match provider {
            ProviderId::Vk => self.vk,
            ProviderId::WhatsApp => self.whatsapp,
            ProviderId::Instagram => self.instagram,
            ProviderId::GetContact => self.getcontact,
            ProviderId::WhoCalls => self.whocalls,
        };
        Duration::from_secs(secs)
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            vk: 600,
            whatsapp: 300,
            instagram: 300,
            getcontact: 3600,
            whocalls: 3600,
        }
    }
}

/// Transient failure handling in the orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts after a transient adapter failure.
    pub transient_retries: u32,
    pub backoff_ms: u64,
}

impl RetryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt.max(1))))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub ttl: TtlConfig,
    /// Overrides of the built-in per-provider windows.
    pub rate_limits: HashMap<ProviderId, RateLimitConfig>,
    pub retry: RetryConfig,
    pub browser: BrowserConfig,
    pub captcha: CaptchaConfig,
    pub rules: NormalizerRules,
    /// Concurrency of `lookup_all`.
    pub fan_out_limit: usize,
    /// Deadline of one provider inside `lookup_all`; 0 means 300 s.
    pub lookup_timeout_secs: u64,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn fan_out_limit(&self) -> usize {
        if self.fan_out_limit == 0 { 5 } else { self.fan_out_limit }
    }

    pub fn lookup_timeout(&self) -> Duration {
        match self.lookup_timeout_secs {
            0 => Duration::from_secs(300),
            secs => Duration::from_secs(secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config.ttl.for_provider(ProviderId::Vk), Duration::from_secs(600));
        assert_eq!(config.ttl.for_provider(ProviderId::WhatsApp), Duration::from_secs(300));
        assert_eq!(config.retry.transient_retries, 2);
        assert_eq!(config.browser.max_retries, 3);
        assert_eq!(config.fan_out_limit(), 5);
        assert_eq!(config.lookup_timeout(), Duration::from_secs(300));
        assert!(config.rate_limits.is_empty());
    }

    #[test]
    fn partial_sections_override_fields() {
        let config = EngineConfig::from_json(
            r#"{
                "ttl": {"instagram": 60},
                "rate_limits": {"vk": {"max_requests": 10, "period": 2.0}},
                "retry": {"transient_retries": 0},
                "browser": {"headless": false},
                "fan_out_limit": 3
            }"#,
        )
        .unwrap();
        assert_eq!(config.ttl.instagram, 60);
        assert_eq!(config.ttl.vk, 600);
        assert_eq!(
            config.rate_limits.get(&ProviderId::Vk),
            Some(&RateLimitConfig::new(10, Duration::from_secs(2)))
        );
        assert_eq!(config.retry.transient_retries, 0);
        assert_eq!(config.retry.backoff_ms, 500);
        assert!(!config.browser.headless);
        assert_eq!(config.fan_out_limit(), 3);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(500));
        assert_eq!(retry.backoff(3), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
