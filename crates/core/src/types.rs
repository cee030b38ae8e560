use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::FailureClass;

/// Unique identifier for an engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node inside a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of an input record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the record id from an `id` field in the payload, falling back to the offset.
    pub fn from_payload(payload: &Map<String, Value>, index: u64) -> Self {
        match payload.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Self(id.clone()),
            Some(Value::Number(n)) => Self(n.to_string()),
            _ => Self(index.to_string()),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a record moving through the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Running,
    AwaitingJoin,
    Completed,
    Failed,
    Cancelled,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status recorded for a node in a record's execution trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// One step of a record's execution trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A record pulled from a data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Offset of the record within the source
    pub index: u64,
    pub id: RecordId,
    pub payload: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(index: u64, payload: Map<String, Value>) -> Self {
        let id = RecordId::from_payload(&payload, index);
        Self { index, id, payload }
    }
}

/// Why a record ended in the failed (or cancelled) state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub class: FailureClass,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// Final shape of a record written to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub record_id: RecordId,
    pub index: u64,
    pub status: RecordStatus,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_from_payload() {
        let payload = json!({"id": "abc", "text": "hi"});
        let id = RecordId::from_payload(payload.as_object().unwrap(), 7);
        assert_eq!(id.0, "abc");

        let payload = json!({"id": 42});
        let id = RecordId::from_payload(payload.as_object().unwrap(), 7);
        assert_eq!(id.0, "42");

        let payload = json!({"text": "no id"});
        let id = RecordId::from_payload(payload.as_object().unwrap(), 7);
        assert_eq!(id.0, "7");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RecordStatus::Completed.is_terminal());
        assert!(RecordStatus::Failed.is_terminal());
        assert!(RecordStatus::Cancelled.is_terminal());
        assert!(!RecordStatus::Running.is_terminal());
        assert!(!RecordStatus::AwaitingJoin.is_terminal());
    }
}
