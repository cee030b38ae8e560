// Graph definition: node kinds, edges, validation and the document format

pub mod builder;
pub mod condition;
pub mod document;
pub mod node;
pub mod spec;

pub use builder::{EdgeDef, GraphBuilder, SubgraphDef};
pub use condition::Condition;
pub use document::{DataDocument, GraphDocument, SinkDocument, SourceDocument};
pub use node::{
    FunctionConfig, InvokeConfig, InvokeStep, MultiInvokeConfig, NodeKind, NodeSpec,
    OutputFormat, PromptMessage, RepeatSpec, SamplerConfig, SubgraphConfig, WeightedChoice,
};
pub use spec::{EdgeCondition, EdgeSpec, EdgeTarget, GraphSpec, END, START};
