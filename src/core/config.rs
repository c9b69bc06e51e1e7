use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{GridError, Result};

/// What to do when the output artifact already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPolicy {
    /// Refuse to touch an existing artifact
    #[default]
    Fail,
    /// Delete the existing artifact and start from an empty grid
    Overwrite,
    /// Reopen the existing artifact and only compute unwritten cells
    Resume,
}

/// Lock acquisition policy for the result store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Retries before giving up; `None` waits forever
    pub max_retries: Option<u32>,
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Sentinels older than this are treated as abandoned
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(2_000),
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            stale_after: Duration::from_secs(600),
        }
    }
}

impl LockPolicy {
    /// Backoff before retry number `attempt` (0-indexed), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(GridError::configuration_field(
                "backoff_multiplier must be >= 1.0",
                "lock.backoff_multiplier",
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(GridError::configuration_field(
                "initial_backoff cannot exceed max_backoff",
                "lock.initial_backoff",
            ));
        }
        if self.stale_after.is_zero() {
            return Err(GridError::configuration_field(
                "stale_after must be greater than 0",
                "lock.stale_after",
            ));
        }
        Ok(())
    }
}

/// Run-level configuration handed to the orchestrator at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of worker slots; defaults to the physical core count
    pub workers: usize,
    /// Abort the run on the first task error instead of logging it
    pub re_raise_exceptions: bool,
    /// Pool restarts allowed over the whole run
    pub max_pool_restarts: u32,
    pub artifact_policy: ArtifactPolicy,
    pub lock: LockPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get_physical().max(1),
            re_raise_exceptions: true,
            max_pool_restarts: 10,
            artifact_policy: ArtifactPolicy::Fail,
            lock: LockPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Create a new builder for RunConfig
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(GridError::configuration_field(
                "workers must be greater than 0",
                "workers",
            ));
        }
        self.lock.validate()
    }

    /// Small pool and short lock waits, for tests and local runs
    pub fn development() -> Self {
        Self {
            workers: 2,
            lock: LockPolicy {
                max_retries: Some(500),
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
                ..LockPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Load a YAML file; missing keys take their default values
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GridError::io(format!("read config {}", path.display()), e))?;
        let config: RunConfig = serde_yaml::from_str(&raw)
            .map_err(|e| GridError::serialization("yaml", e))?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for RunConfig
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: RunConfig::default(),
        }
    }

    /// Start from an already loaded configuration, such as a YAML file
    pub fn from_config(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn re_raise_exceptions(mut self, re_raise: bool) -> Self {
        self.config.re_raise_exceptions = re_raise;
        self
    }

    pub fn max_pool_restarts(mut self, max: u32) -> Self {
        self.config.max_pool_restarts = max;
        self
    }

    pub fn artifact_policy(mut self, policy: ArtifactPolicy) -> Self {
        self.config.artifact_policy = policy;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RunConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.workers >= 1);
        assert!(config.re_raise_exceptions);
        assert_eq!(config.max_pool_restarts, 10);
        assert_eq!(config.artifact_policy, ArtifactPolicy::Fail);
    }

    #[test]
    fn test_development_config() {
        let config = RunConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RunConfig::default();
        config.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(GridError::Configuration { field: Some(ref f), .. }) if f == "workers"
        ));

        let mut config = RunConfig::default();
        config.lock.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.lock.initial_backoff = Duration::from_secs(1);
        config.lock.max_backoff = Duration::from_millis(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = RunConfig::builder()
            .workers(3)
            .re_raise_exceptions(false)
            .max_pool_restarts(2)
            .artifact_policy(ArtifactPolicy::Overwrite)
            .build()
            .unwrap();

        assert_eq!(config.workers, 3);
        assert!(!config.re_raise_exceptions);
        assert_eq!(config.max_pool_restarts, 2);
        assert_eq!(config.artifact_policy, ArtifactPolicy::Overwrite);

        let loaded = RunConfig {
            max_pool_restarts: 7,
            ..RunConfig::development()
        };
        let layered = RunConfigBuilder::from_config(loaded)
            .workers(5)
            .build()
            .unwrap();
        assert_eq!(layered.workers, 5);
        assert_eq!(layered.max_pool_restarts, 7);
        assert!(RunConfigBuilder::from_config(RunConfig::development())
            .workers(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let lock = LockPolicy::default();
        assert_eq!(lock.backoff_delay(0), Duration::from_millis(2));
        assert_eq!(lock.backoff_delay(1), Duration::from_millis(4));
        assert_eq!(lock.backoff_delay(20), Duration::from_millis(50));
        assert!(!lock.is_exhausted(1_999));
        assert!(lock.is_exhausted(2_000));

        let unbounded = LockPolicy {
            max_retries: None,
            ..LockPolicy::default()
        };
        assert!(!unbounded.is_exhausted(u32::MAX));
    }

    #[test]
    fn test_yaml_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(
            &path,
            "workers: 3\nre_raise_exceptions: false\nartifact_policy: resume\nlock:\n  max_retries: 7\n  max_backoff: 30\n",
        )
        .unwrap();

        let config = RunConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.workers, 3);
        assert!(!config.re_raise_exceptions);
        assert_eq!(config.max_pool_restarts, 10);
        assert_eq!(config.artifact_policy, ArtifactPolicy::Resume);
        assert_eq!(config.lock.max_retries, Some(7));
        assert_eq!(config.lock.max_backoff, Duration::from_millis(30));
        assert_eq!(config.lock.initial_backoff, Duration::from_millis(2));
    }
}
