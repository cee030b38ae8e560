use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::FailureClass;
use crate::types::{NodeId, RecordId, RunId};

/// An event in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        task_id: String,
        graph: String,
        fingerprint: String,
        start_index: u64,
        resumed: bool,
    },
    RunCompleted {
        completed: u64,
        failed: u64,
        cancelled: u64,
        skipped: u64,
        duration_secs: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Record lifecycle events
    RecordStarted {
        record_id: RecordId,
        index: u64,
    },
    RecordCompleted {
        record_id: RecordId,
        index: u64,
        hops: u32,
    },
    RecordFailed {
        record_id: RecordId,
        index: u64,
        class: FailureClass,
        error: String,
    },
    RecordCancelled {
        record_id: RecordId,
        index: u64,
    },

    // Node lifecycle events
    NodeStarted {
        record_id: RecordId,
        node_id: NodeId,
    },
    NodeCompleted {
        record_id: RecordId,
        node_id: NodeId,
        duration_ms: u64,
    },
    NodeFailed {
        record_id: RecordId,
        node_id: NodeId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    // Parallel branches
    FanOut {
        record_id: RecordId,
        node_id: NodeId,
        branches: Vec<NodeId>,
        join: Option<NodeId>,
    },
    Joined {
        record_id: RecordId,
        node_id: NodeId,
        branches: usize,
    },

    CheckpointWritten {
        source_cursor: u64,
        sink_cursor: u64,
        completed: u64,
    },
}

/// Append-only event log
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> Result<()>;

    /// Persist anything buffered
    async fn flush(&self) -> Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>>;
}

/// Run-scoped handle used by the engine. Log failures are reported and otherwise ignored.
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    log: Option<Arc<dyn EventLog>>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, log: Option<Arc<dyn EventLog>>) -> Self {
        Self { run_id, log }
    }

    pub fn disabled() -> Self {
        Self::new(RunId::new(), None)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub async fn emit(&self, event_type: EventType) {
        let Some(log) = &self.log else {
            return;
        };
        if let Err(e) = log.append(Event::new(self.run_id, event_type)).await {
            tracing::warn!("Failed to append event for run {}: {:#}", self.run_id, e);
        }
    }

    pub async fn flush(&self) {
        if let Some(log) = &self.log {
            if let Err(e) = log.flush().await {
                tracing::warn!("Failed to flush event log for run {}: {:#}", self.run_id, e);
            }
        }
    }
}
