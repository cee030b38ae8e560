//! Error taxonomy for graph construction, node execution and engine runs.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Result type for engine-level operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Problems with the graph, registry or engine configuration.
///
/// These are detected before any record is processed and abort the whole run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    #[error("{context} references unknown node '{node}'")]
    UnknownNode { context: String, node: NodeId },

    #[error("graph has no start node")]
    MissingStart,

    #[error("graph declares more than one start node ('{first}' and '{second}')")]
    MultipleStarts { first: NodeId, second: NodeId },

    #[error("graph has no end node")]
    NoEndNode,

    #[error("node '{0}' is not reachable from the start node")]
    Unreachable(NodeId),

    #[error("node '{0}' is not terminal and has no outgoing edge")]
    NoOutgoingEdge(NodeId),

    #[error("parallel edge from '{0}' cannot target END")]
    ParallelToEnd(NodeId),

    #[error("invalid condition '{expr}': {reason}")]
    InvalidCondition { expr: String, reason: String },

    #[error("node '{node}': invalid sampler configuration: {reason}")]
    InvalidSampler { node: NodeId, reason: String },

    #[error("node '{node}': {reason}")]
    InvalidNode { node: NodeId, reason: String },

    #[error("node '{node}' references unknown {what} '{name}'")]
    UnknownReference {
        node: NodeId,
        what: &'static str,
        name: String,
    },

    #[error("output field '{field}': {reason}")]
    InvalidOutput { field: String, reason: String },

    #[error("invalid engine setting: {0}")]
    InvalidSetting(String),

    #[error("graph document: {0}")]
    Document(String),
}

/// Failure of a single node execution, before it is attributed to a record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// Timeout, rate limiting or a 5xx from the backend. Retryable.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Invalid request, auth failure or unparseable response. Never retried.
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// Transient failures persisted through every allowed attempt.
    #[error("backend still failing after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("function error: {0}")]
    Function(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("subgraph failed: {0}")]
    Subgraph(Box<RecordError>),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Coarse reason class reported for a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientBackendError,
    PermanentBackendError,
    RoutingError,
    SubgraphError,
    FunctionError,
    TemplateError,
    HopLimitExceeded,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TransientBackendError => "TransientBackendError",
            Self::PermanentBackendError => "PermanentBackendError",
            Self::RoutingError => "RoutingError",
            Self::SubgraphError => "SubgraphError",
            Self::FunctionError => "FunctionError",
            Self::TemplateError => "TemplateError",
            Self::HopLimitExceeded => "HopLimitExceeded",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Record-level failure. Isolated to the record that raised it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordError {
    #[error("node '{node}' failed after {attempts} attempt(s): {message}")]
    TransientBackend {
        node: NodeId,
        attempts: u32,
        message: String,
    },

    #[error("node '{node}' failed: {message}")]
    PermanentBackend { node: NodeId, message: String },

    #[error("no route out of node '{node}': {reason}")]
    Routing { node: NodeId, reason: String },

    #[error("subgraph node '{node}' failed: {source}")]
    Subgraph {
        node: NodeId,
        #[source]
        source: Box<RecordError>,
    },

    #[error("function node '{node}' failed: {message}")]
    Function { node: NodeId, message: String },

    #[error("node '{node}' could not render its prompt: {message}")]
    Template { node: NodeId, message: String },

    #[error("record exceeded the hop limit of {limit}")]
    HopLimitExceeded { limit: u32 },

    #[error("record cancelled")]
    Cancelled,

    #[error("branch starting at '{node}' aborted: {message}")]
    Internal { node: NodeId, message: String },
}

impl RecordError {
    /// Attribute a node failure to the node that produced it.
    pub fn from_node(node: &NodeId, err: NodeError) -> Self {
        let node = node.clone();
        match err {
            NodeError::Transient(message) => Self::TransientBackend {
                node,
                attempts: 1,
                message,
            },
            NodeError::Exhausted { attempts, message } => Self::TransientBackend {
                node,
                attempts,
                message,
            },
            NodeError::Permanent(message) => Self::PermanentBackend { node, message },
            NodeError::Function(message) => Self::Function { node, message },
            NodeError::Template(message) => Self::Template { node, message },
            NodeError::Subgraph(source) => Self::Subgraph { node, source },
            NodeError::Cancelled => Self::Cancelled,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::TransientBackend { .. } => FailureClass::TransientBackendError,
            Self::PermanentBackend { .. } => FailureClass::PermanentBackendError,
            Self::Routing { .. } => FailureClass::RoutingError,
            Self::Subgraph { .. } => FailureClass::SubgraphError,
            Self::Function { .. } => FailureClass::FunctionError,
            Self::Template { .. } => FailureClass::TemplateError,
            Self::HopLimitExceeded { .. } => FailureClass::HopLimitExceeded,
            Self::Cancelled => FailureClass::Cancelled,
            Self::Internal { .. } => FailureClass::Internal,
        }
    }

    /// The node the failure is attributed to, when there is one.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::TransientBackend { node, .. }
            | Self::PermanentBackend { node, .. }
            | Self::Routing { node, .. }
            | Self::Subgraph { node, .. }
            | Self::Function { node, .. }
            | Self::Template { node, .. }
            | Self::Internal { node, .. } => Some(node),
            Self::HopLimitExceeded { .. } | Self::Cancelled => None,
        }
    }
}

/// Process-fatal errors: bad configuration or storage/checkpoint I/O.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("checkpoint for task '{task_id}' was written for graph {found}, current graph is {expected}")]
    CheckpointMismatch {
        task_id: String,
        expected: String,
        found: String,
    },
}
