//! Worker configuration from environment variables.

use std::time::Duration;

use crate::jobs::JobExecutorConfig;

pub const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub generation_poll_interval: Duration,
    pub sme_poll_interval: Duration,
    pub stale_after: Duration,
    /// Threads polling for generation jobs.
    pub generation_concurrency: usize,
    /// Base64 AES-256 key used to decrypt tenant API keys.
    pub encryption_key: Option<String>,
    pub ai_base_url: String,
    pub ai_model: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            generation_poll_interval: Duration::from_millis(2000),
            sme_poll_interval: Duration::from_millis(5000),
            stale_after: Duration::from_secs(30 * 60),
            generation_concurrency: 1,
            encryption_key: None,
            ai_base_url: DEFAULT_AI_BASE_URL.to_string(),
            ai_model: DEFAULT_AI_MODEL.to_string(),
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            database_url: get("DATABASE_URL"),
            database_max_connections: parse(&get, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            generation_poll_interval: millis(&get, "GENERATION_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.generation_poll_interval),
            sme_poll_interval: millis(&get, "SME_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.sme_poll_interval),
            stale_after: parse::<u64, _>(&get, "JOB_STALE_AFTER_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            generation_concurrency: parse(&get, "GENERATION_WORKERS")?
                .unwrap_or(defaults.generation_concurrency),
            encryption_key: get("AI_KEY_ENCRYPTION_KEY"),
            ai_base_url: get("AI_BASE_URL").unwrap_or(defaults.ai_base_url),
            ai_model: get("AI_MODEL").unwrap_or(defaults.ai_model),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn require_encryption_key(&self) -> Result<&str, ConfigError> {
        self.encryption_key
            .as_deref()
            .ok_or(ConfigError::Missing("AI_KEY_ENCRYPTION_KEY"))
    }

    /// The generation family also claims unrecognized job types and owns
    /// the stalled-parent sweep, since it runs the lesson children.
    pub fn generation_executor(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("generation-worker")
            .with_poll_interval(self.generation_poll_interval)
            .with_stale_after(self.stale_after)
            .with_concurrency(self.generation_concurrency)
            .with_unrecognized()
            .with_parent_recovery()
    }

    pub fn sme_executor(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("sme-worker")
            .with_poll_interval(self.sme_poll_interval)
            .with_stale_after(self.stale_after)
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn millis<G>(get: &G, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse::<u64, _>(get, var)? {
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other.map(Duration::from_millis)),
    }
}
