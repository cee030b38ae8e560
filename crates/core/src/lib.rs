// Core engine for Synthflow: graph-driven synthetic data generation

pub mod types;
pub mod error;
pub mod graph;
pub mod engine;
pub mod registry;
pub mod backend;
pub mod retry;
pub mod template;
pub mod events;
pub mod storage;
pub mod connectors;
pub mod config;
pub mod report;

pub use types::*;
pub use error::{ConfigError, EngineError, EngineResult, FailureClass, NodeError, RecordError};
pub use graph::{GraphBuilder, GraphDocument, GraphSpec, END, START};
pub use engine::{ExecutionEngine, OutputSpec, RecordContext, Scope};
pub use registry::Registry;
pub use backend::{BackendError, InferenceBackend, InferenceResponse, RenderedPrompt};
pub use retry::RetryPolicy;
pub use config::EngineConfig;
pub use report::RunReport;
