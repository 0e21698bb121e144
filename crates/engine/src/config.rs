//! Engine configuration with `FORGETASK_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::notify::WebhookConfig;
use crate::progress::StreamConfig;
use crate::recovery::RecoveryConfig;
use crate::retry::RetryPolicy;
use crate::store::StoreSettings;
use crate::task::types::{DEFAULT_MAX_ATTEMPTS, MAX_ATTEMPTS_LIMIT};
use crate::task::WorkerId;
use crate::worker_pool::WorkerPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool: WorkerPoolConfig,
    pub retry: RetryPolicy,
    pub recovery: RecoveryConfig,
    pub stream: StreamConfig,
    pub store: StoreSettings,
    pub webhook: WebhookConfig,
    /// Applied when a submission leaves `max_attempts` unset.
    pub default_max_attempts: u32,
    /// Move permanently failed tasks to the dead-letter queue.
    pub dead_letter_on_exhaustion: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            retry: RetryPolicy::default(),
            recovery: RecoveryConfig::default(),
            stream: StreamConfig::default(),
            store: StoreSettings::default(),
            webhook: WebhookConfig::default(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            dead_letter_on_exhaustion: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `FORGETASK_*` key. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut cfg = Self::default();

        if let Some(size) = env.parse::<usize>("FORGETASK_POOL_SIZE")? {
            if size == 0 {
                return Err(ConfigError::invalid("FORGETASK_POOL_SIZE", "0", "must be at least 1"));
            }
            cfg.pool.size = size;
        }
        if let Some(d) = env.secs("FORGETASK_HEARTBEAT_INTERVAL_SECS")? {
            cfg.pool.heartbeat_interval = d;
        }
        if let Some(id) = env.get("FORGETASK_WORKER_ID") {
            cfg.pool.worker_id = WorkerId::new(id);
        }

        let base = env
            .secs("FORGETASK_RETRY_BASE_DELAY_SECS")?
            .unwrap_or(cfg.retry.base_delay);
        let max = env
            .secs("FORGETASK_RETRY_MAX_DELAY_SECS")?
            .unwrap_or(cfg.retry.max_delay);
        let jitter = env
            .parse::<f64>("FORGETASK_RETRY_JITTER")?
            .unwrap_or(cfg.retry.jitter);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::invalid(
                "FORGETASK_RETRY_JITTER",
                &jitter.to_string(),
                "must be between 0 and 1",
            ));
        }
        cfg.retry = RetryPolicy::new(base, max, jitter);

        if let Some(d) = env.secs("FORGETASK_RECOVERY_INTERVAL_SECS")? {
            cfg.recovery.interval = d;
        }
        if let Some(d) = env.secs("FORGETASK_HEARTBEAT_TIMEOUT_SECS")? {
            cfg.recovery.heartbeat_timeout = d;
        }
        if let Some(n) = env.parse("FORGETASK_SCAN_BATCH_SIZE")? {
            cfg.recovery.scan_batch_size = n;
        }
        if let Some(n) = env.parse("FORGETASK_CLEANUP_BATCH_SIZE")? {
            cfg.recovery.cleanup_batch_size = n;
        }
        if let Some(enabled) = env.flag("FORGETASK_CLEANUP_ENABLED")? {
            cfg.recovery.cleanup_enabled = enabled;
        }

        if let Some(ms) = env.parse::<u64>("FORGETASK_STREAM_POLL_MS")? {
            cfg.stream.poll_interval = Duration::from_millis(ms);
        }
        if let Some(d) = env.secs("FORGETASK_STREAM_HEARTBEAT_SECS")? {
            cfg.stream.heartbeat_interval = d;
        }
        if let Some(d) = env.secs("FORGETASK_STREAM_MAX_DURATION_SECS")? {
            cfg.stream.max_duration = d;
        }

        if let Some(d) = env.secs("FORGETASK_IDEMPOTENCY_WINDOW_SECS")? {
            cfg.store.idempotency_window = d;
        }
        if let Some(d) = env.secs("FORGETASK_RETENTION_SECS")? {
            cfg.store.retention = d;
        }
        if let Some(d) = env.secs("FORGETASK_WEBHOOK_TIMEOUT_SECS")? {
            cfg.webhook.timeout = d;
        }

        if let Some(n) = env.parse::<u32>("FORGETASK_DEFAULT_MAX_ATTEMPTS")? {
            if !(1..=MAX_ATTEMPTS_LIMIT).contains(&n) {
                return Err(ConfigError::invalid(
                    "FORGETASK_DEFAULT_MAX_ATTEMPTS",
                    &n.to_string(),
                    format!("must be between 1 and {MAX_ATTEMPTS_LIMIT}"),
                ));
            }
            cfg.default_max_attempts = n;
        }
        if let Some(enabled) = env.flag("FORGETASK_DEAD_LETTER_ON_EXHAUSTION")? {
            cfg.dead_letter_on_exhaustion = enabled;
        }

        Ok(cfg)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, &raw, e.to_string()))
            })
            .transpose()
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &raw, "expected a boolean")),
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.pool.size, 4);
        assert_eq!(cfg.pool.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.recovery.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(cfg.stream.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.store.retention, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(cfg.default_max_attempts, 3);
        assert!(cfg.dead_letter_on_exhaustion);
    }

    #[test]
    fn overrides_apply() {
        let cfg = from_pairs(&[
            ("FORGETASK_POOL_SIZE", "16"),
            ("FORGETASK_HEARTBEAT_TIMEOUT_SECS", "45"),
            ("FORGETASK_RETRY_BASE_DELAY_SECS", "1"),
            ("FORGETASK_RETRY_JITTER", "0"),
            ("FORGETASK_CLEANUP_ENABLED", "off"),
            ("FORGETASK_WORKER_ID", " api-1 "),
            ("FORGETASK_STREAM_POLL_MS", "250"),
        ])
        .unwrap();

        assert_eq!(cfg.pool.size, 16);
        assert_eq!(cfg.pool.worker_id.as_str(), "api-1");
        assert_eq!(cfg.recovery.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(1));
        assert_eq!(cfg.retry.jitter, 0.0);
        assert!(!cfg.recovery.cleanup_enabled);
        assert_eq!(cfg.stream.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = from_pairs(&[("FORGETASK_POOL_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "FORGETASK_POOL_SIZE"));

        assert!(from_pairs(&[("FORGETASK_POOL_SIZE", "0")]).is_err());
        assert!(from_pairs(&[("FORGETASK_RETRY_JITTER", "1.5")]).is_err());
        assert!(from_pairs(&[("FORGETASK_DEFAULT_MAX_ATTEMPTS", "99")]).is_err());
        assert!(from_pairs(&[("FORGETASK_DEAD_LETTER_ON_EXHAUSTION", "maybe")]).is_err());
    }

    #[test]
    fn blank_values_keep_defaults() {
        let cfg = from_pairs(&[("FORGETASK_POOL_SIZE", "  ")]).unwrap();
        assert_eq!(cfg.pool.size, 4);
    }
}
