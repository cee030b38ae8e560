pub mod context;
pub mod executor;
pub mod node_executor;
pub mod projector;
pub mod router;
pub mod traversal;

pub use context::{RecordContext, Scope, SOURCE_ROOT};
pub use executor::ExecutionEngine;
pub use node_executor::NodeExecutor;
pub use projector::{OutputField, OutputProjector, OutputSpec};
pub use router::{EdgeRouter, RouteDecision};
pub use traversal::{Traversal, TraversalOutcome};
