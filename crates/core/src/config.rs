// Engine settings

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

fn default_task_id() -> String {
    "default".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_branch_concurrency() -> usize {
    32
}

fn default_checkpoint_interval() -> u64 {
    100
}

fn default_max_hops() -> u32 {
    256
}

/// Run-level settings for [`crate::ExecutionEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identifies the task across runs; checkpoints are keyed by it
    #[serde(default = "default_task_id")]
    pub task_id: String,
    /// Source offset of the first record
    #[serde(default)]
    pub start_index: u64,
    /// Records to process from `start_index`; everything when unset
    #[serde(default)]
    pub record_count: Option<u64>,
    /// Records in flight at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Branch node executions in flight at once, across all records
    #[serde(default = "default_branch_concurrency")]
    pub branch_concurrency: usize,
    /// Committed records between checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Node executions allowed per record
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Continue from the task's last checkpoint
    #[serde(default)]
    pub resume: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_id: default_task_id(),
            start_index: 0,
            record_count: None,
            batch_size: default_batch_size(),
            branch_concurrency: default_branch_concurrency(),
            checkpoint_interval: default_checkpoint_interval(),
            max_hops: default_max_hops(),
            retry: RetryPolicy::default(),
            resume: false,
        }
    }
}

impl EngineConfig {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_id.trim().is_empty() {
            return Err(ConfigError::InvalidSetting("task_id must not be empty".to_string()));
        }
        let positive = [
            ("batch_size", self.batch_size as u64),
            ("branch_concurrency", self.branch_concurrency as u64),
            ("checkpoint_interval", self.checkpoint_interval),
            ("max_hops", u64::from(self.max_hops)),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidSetting(format!("{} must be at least 1", name)));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidSetting(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("task_id = \"nightly\"").unwrap();
        assert_eq!(config.task_id, "nightly");
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.branch_concurrency, 32);
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.max_hops, 256);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(!config.resume);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_settings() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err, ConfigError::InvalidSetting("batch_size must be at least 1".to_string()));

        let mut config = EngineConfig::new("t");
        config.retry.initial_backoff_ms = 10_000;
        config.retry.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }
}
