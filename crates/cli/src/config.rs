use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use synthflow_core::storage::{CheckpointStore, FileCheckpointStore, RedbCheckpointStore};
use synthflow_core::EngineConfig;

/// Contents of `synthflow.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Model references used by invoke nodes
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    File,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_checkpoint_backend")]
    pub checkpoint_backend: CheckpointBackend,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,

    /// Relative to the data directory; no event log when unset
    #[serde(default)]
    pub event_log_dir: Option<String>,
}

fn default_checkpoint_backend() -> CheckpointBackend {
    CheckpointBackend::File
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}

fn default_checkpoint_file() -> String {
    "checkpoints.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_backend: default_checkpoint_backend(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_file: default_checkpoint_file(),
            event_log_dir: None,
        }
    }
}

/// An OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Upstream model name; the table key when unset
    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl CliConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse configuration file")?;
        for (name, model) in &config.models {
            if model.max_concurrent == 0 {
                bail!("models.{}: max_concurrent must be at least 1", name);
            }
        }
        Ok(config)
    }

    pub fn checkpoint_store(&self, data_dir: &Path) -> Result<Arc<dyn CheckpointStore>> {
        Ok(match self.storage.checkpoint_backend {
            CheckpointBackend::File => Arc::new(
                FileCheckpointStore::new(data_dir.join(&self.storage.checkpoint_dir))
                    .context("Failed to create checkpoint store")?,
            ),
            CheckpointBackend::Redb => Arc::new(
                RedbCheckpointStore::new(data_dir.join(&self.storage.checkpoint_file))
                    .context("Failed to create checkpoint store")?,
            ),
        })
    }

    pub fn event_log_path(&self, data_dir: &Path) -> Option<PathBuf> {
        self.storage.event_log_dir.as_ref().map(|dir| data_dir.join(dir))
    }
}
