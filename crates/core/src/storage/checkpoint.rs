use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult, FailureClass};
use crate::types::{RecordId, RunId};

const CHECKPOINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Durable progress of a task.
///
/// `source_cursor` is the offset of the first record that has not been
/// committed; every record before it reached a terminal status and its
/// output was written before the checkpoint was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_id: RunId,
    pub task_id: String,
    pub graph_fingerprint: String,
    pub source_cursor: u64,
    /// Number of output records durably written to the sink
    pub sink_cursor: u64,
    /// Records that were running when the snapshot was taken (re-run on resume)
    #[serde(default)]
    pub in_flight: Vec<RecordId>,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    #[serde(default)]
    pub failures: BTreeMap<FailureClass, u64>,
    pub updated_at: DateTime<Utc>,
}

/// Counters handed to [`CheckpointManager::snapshot`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub source_cursor: u64,
    pub sink_cursor: u64,
    pub in_flight: Vec<RecordId>,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub failures: BTreeMap<FailureClass, u64>,
}

impl Progress {
    /// Progress carried over from an earlier run of the same task
    pub fn from_checkpoint(state: &CheckpointState) -> Self {
        Self {
            source_cursor: state.source_cursor,
            sink_cursor: state.sink_cursor,
            in_flight: Vec::new(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            failures: state.failures.clone(),
        }
    }
}

/// Where checkpoints live
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored checkpoint for `state.task_id`
    async fn save(&self, state: &CheckpointState) -> Result<()>;

    async fn load(&self, task_id: &str) -> Result<Option<CheckpointState>>;
}

/// One JSON file per task, replaced atomically on every save
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context("Failed to create checkpoint directory")?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", sanitize(task_id)))
    }
}

fn sanitize(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let path = self.path_for(&state.task_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state).context("Failed to serialize checkpoint")?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .context("Failed to create checkpoint temp file")?;
        file.write_all(&bytes)
            .await
            .context("Failed to write checkpoint")?;
        file.sync_all().await.context("Failed to sync checkpoint")?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .context("Failed to move checkpoint into place")?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<CheckpointState>> {
        let path = self.path_for(task_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt checkpoint {}", path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read checkpoint"),
        }
    }
}

/// Checkpoints in a redb table keyed by task id
#[derive(Clone)]
pub struct RedbCheckpointStore {
    db: Arc<Database>,
}

impl RedbCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
        }

        let db = Database::create(path).context("Failed to create redb database")?;

        // Initialize table
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _table = write_txn
                .open_table(CHECKPOINTS_TABLE)
                .context("Failed to open checkpoints table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn save_blocking(db: &Database, state: &CheckpointState) -> Result<()> {
        let value = serde_json::to_vec(state).context("Failed to serialize checkpoint")?;
        let write_txn = db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(CHECKPOINTS_TABLE)
                .context("Failed to open table")?;
            table
                .insert(state.task_id.as_str(), value.as_slice())
                .context("Failed to insert checkpoint")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn load_blocking(db: &Database, task_id: &str) -> Result<Option<CheckpointState>> {
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(CHECKPOINTS_TABLE)
            .context("Failed to open table")?;

        match table.get(task_id).context("Failed to get checkpoint")? {
            Some(guard) => {
                let state = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize checkpoint")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl CheckpointStore for RedbCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<()> {
        let db = self.db.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || Self::save_blocking(&db, &state))
            .await
            .context("Checkpoint writer panicked")?
    }

    async fn load(&self, task_id: &str) -> Result<Option<CheckpointState>> {
        let db = self.db.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || Self::load_blocking(&db, &task_id))
            .await
            .context("Checkpoint reader panicked")?
    }
}

/// Snapshots and restores the progress of one task
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    task_id: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Load the last checkpoint of the task, refusing one written for a different graph.
    pub async fn restore(&self, graph_fingerprint: &str) -> EngineResult<Option<CheckpointState>> {
        let Some(state) = self.store.load(&self.task_id).await? else {
            tracing::info!("No checkpoint for task {}, starting fresh", self.task_id);
            return Ok(None);
        };

        if state.graph_fingerprint != graph_fingerprint {
            return Err(EngineError::CheckpointMismatch {
                task_id: self.task_id.clone(),
                expected: graph_fingerprint.to_string(),
                found: state.graph_fingerprint,
            });
        }

        tracing::info!(
            "Restored checkpoint for task {}: source_cursor={}, sink_cursor={}, completed={}",
            self.task_id,
            state.source_cursor,
            state.sink_cursor,
            state.completed
        );
        Ok(Some(state))
    }

    /// Persist `progress`. Call only after the outputs it covers are durably written.
    pub async fn snapshot(
        &self,
        run_id: RunId,
        graph_fingerprint: &str,
        progress: &Progress,
    ) -> EngineResult<CheckpointState> {
        let state = CheckpointState {
            run_id,
            task_id: self.task_id.clone(),
            graph_fingerprint: graph_fingerprint.to_string(),
            source_cursor: progress.source_cursor,
            sink_cursor: progress.sink_cursor,
            in_flight: progress.in_flight.clone(),
            completed: progress.completed,
            failed: progress.failed,
            cancelled: progress.cancelled,
            failures: progress.failures.clone(),
            updated_at: Utc::now(),
        };
        self.store.save(&state).await?;
        tracing::debug!(
            "Checkpoint saved for task {}: source_cursor={}",
            self.task_id,
            state.source_cursor
        );
        Ok(state)
    }
}
