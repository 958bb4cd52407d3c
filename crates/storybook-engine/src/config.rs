use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use storybook_contracts::models::BackendId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction in `[0, 1]`; each delay is scaled by a factor drawn from
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Zero disables the gate.
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            burst: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub default_rate_limit: RateLimitConfig,
    pub rate_limits: BTreeMap<BackendId, RateLimitConfig>,
    pub retry: RetryConfig,
    pub task_timeout_ms: u64,
    pub job_timeout_ms: u64,
    pub abandon_in_flight_on_deadline: bool,
    pub min_stanza_successes: usize,
    pub max_stanzas: usize,
    pub default_backend: BackendId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_rate_limit: RateLimitConfig::default(),
            rate_limits: BTreeMap::new(),
            retry: RetryConfig::default(),
            task_timeout_ms: 180_000,
            job_timeout_ms: 900_000,
            abandon_in_flight_on_deadline: false,
            min_stanza_successes: 0,
            max_stanzas: 16,
            default_backend: BackendId::GptImage,
        }
    }
}

impl EngineConfig {
    /// Reads the optional JSON file, applies `STORYBOOK_*` environment
    /// overrides, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed reading config {}", path.display()))?;
                serde_json::from_str::<Self>(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`; blank values are ignored, unparsable
    /// ones are an error.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = parse_override(&read, "STORYBOOK_MAX_CONCURRENCY")? {
            self.max_concurrency = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_REQUESTS_PER_MINUTE")? {
            self.default_rate_limit.requests_per_minute = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_RATE_BURST")? {
            self.default_rate_limit.burst = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_RETRY_ATTEMPTS")? {
            self.retry.max_attempts = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_RETRY_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_TASK_TIMEOUT_MS")? {
            self.task_timeout_ms = value;
        }
        if let Some(value) = parse_override(&read, "STORYBOOK_JOB_TIMEOUT_MS")? {
            self.job_timeout_ms = value;
        }
        if let Some(raw) = read("STORYBOOK_DEFAULT_BACKEND") {
            let Some(backend) = BackendId::parse(&raw) else {
                bail!("STORYBOOK_DEFAULT_BACKEND: unknown backend '{raw}'");
            };
            self.default_backend = backend;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be within [0, 1]");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.task_timeout_ms == 0 || self.job_timeout_ms == 0 {
            bail!("task_timeout_ms and job_timeout_ms must be non-zero");
        }
        if self.max_stanzas == 0 {
            bail!("max_stanzas must be at least 1");
        }
        Ok(())
    }

    pub fn rate_limit_for(&self, backend: BackendId) -> RateLimitConfig {
        self.rate_limits
            .get(&backend)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

fn parse_override<T, R>(read: &R, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    R: Fn(&str) -> Option<String>,
{
    let Some(raw) = read(key) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("{key}: invalid value '{raw}': {err}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use storybook_contracts::models::BackendId;

    use super::{EngineConfig, RateLimitConfig};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() -> anyhow::Result<()> {
        let config = EngineConfig::default();
        config.validate()?;
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.default_backend, BackendId::GptImage);
        Ok(())
    }

    #[test]
    fn env_overrides_replace_defaults() -> anyhow::Result<()> {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup(&[
            ("STORYBOOK_MAX_CONCURRENCY", "8"),
            ("STORYBOOK_REQUESTS_PER_MINUTE", " 60 "),
            ("STORYBOOK_RETRY_ATTEMPTS", "5"),
            ("STORYBOOK_DEFAULT_BACKEND", "nano-banana"),
            ("STORYBOOK_TASK_TIMEOUT_MS", ""),
        ]))?;
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.default_rate_limit.requests_per_minute, 60);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.default_backend, BackendId::NanoBanana);
        assert_eq!(config.task_timeout_ms, 180_000);
        Ok(())
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(lookup(&[("STORYBOOK_MAX_CONCURRENCY", "many")]))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("STORYBOOK_MAX_CONCURRENCY"));

        let mut config = EngineConfig::default();
        assert!(config
            .apply_overrides(lookup(&[("STORYBOOK_DEFAULT_BACKEND", "dall-e")]))
            .is_err());
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_partial_json_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"max_concurrency": 2, "rate_limits": {"nano-banana": {"requests_per_minute": 5}}}"#,
        )?;
        let mut config: EngineConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        config.validate()?;
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(
            config.rate_limit_for(BackendId::NanoBanana),
            RateLimitConfig {
                requests_per_minute: 5,
                burst: 4
            }
        );
        assert_eq!(
            config.rate_limit_for(BackendId::GptImage),
            RateLimitConfig::default()
        );
        config.apply_overrides(lookup(&[]))?;
        Ok(())
    }
}
