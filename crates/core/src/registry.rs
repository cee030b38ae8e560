// Caller-supplied collaborators: backends, functions, predicates and hooks

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::block_in_place;

use crate::backend::{BackendRegistry, InferenceBackend};
use crate::engine::context::Scope;
use crate::error::{ConfigError, NodeError};
use crate::graph::{EdgeCondition, GraphSpec, NodeKind};
use crate::template::TemplateRenderer;

pub type PredicateFn = Arc<dyn Fn(&Scope<'_>) -> bool + Send + Sync>;
pub type PreProcessFn = Arc<dyn Fn(&Scope<'_>) -> Result<Map<String, Value>, NodeError> + Send + Sync>;
pub type PostProcessFn = Arc<dyn Fn(Value, &Scope<'_>) -> Result<Value, NodeError> + Send + Sync>;

/// Transform invoked by function nodes
#[async_trait]
pub trait NodeFunction: Send + Sync {
    async fn call(&self, scope: &Scope<'_>, params: &Value) -> Result<Value, NodeError>;
}

struct SyncFunction<F>(F);

#[async_trait]
impl<F> NodeFunction for SyncFunction<F>
where
    F: Fn(&Scope<'_>, &Value) -> Result<Value, NodeError> + Send + Sync,
{
    async fn call(&self, scope: &Scope<'_>, params: &Value) -> Result<Value, NodeError> {
        (self.0)(scope, params)
    }
}

/// Synchronous function that may block. On a multi-threaded runtime the worker
/// hands its other tasks off while the closure runs.
struct BlockingFunction<F>(F);

#[async_trait]
impl<F> NodeFunction for BlockingFunction<F>
where
    F: Fn(&Scope<'_>, &Value) -> Result<Value, NodeError> + Send + Sync,
{
    async fn call(&self, scope: &Scope<'_>, params: &Value) -> Result<Value, NodeError> {
        let flavor = Handle::try_current().map(|handle| handle.runtime_flavor());
        match flavor {
            Ok(RuntimeFlavor::MultiThread) => block_in_place(|| (self.0)(scope, params)),
            _ => (self.0)(scope, params),
        }
    }
}

/// Everything a graph refers to by name. Built once and shared by `Arc`.
#[derive(Clone, Default)]
pub struct Registry {
    backends: BackendRegistry,
    functions: HashMap<String, Arc<dyn NodeFunction>>,
    predicates: HashMap<String, PredicateFn>,
    pre_process: HashMap<String, PreProcessFn>,
    post_process: HashMap<String, PostProcessFn>,
}

impl Registry {
    /// Registry with the built-in `template` and `parse_json` functions.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_fn("template", |scope, params| {
            TemplateRenderer::render_value(params, scope)
        });
        registry.register_fn("parse_json", parse_json);
        registry
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn register_backend(
        &mut self,
        model: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
        max_concurrent: usize,
    ) {
        self.backends.register(model, backend, max_concurrent);
    }

    pub fn register_function(&mut self, name: impl Into<String>, function: Arc<dyn NodeFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// Register a synchronous function. It runs inline on the runtime worker, so
    /// it must be cheap; use [`Registry::register_blocking_fn`] for heavy work.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Scope<'_>, &Value) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.register_function(name, Arc::new(SyncFunction(function)));
    }

    /// Register a synchronous function that may block or burn CPU
    pub fn register_blocking_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Scope<'_>, &Value) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.register_function(name, Arc::new(BlockingFunction(function)));
    }

    pub fn register_predicate<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Scope<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn register_pre_process<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(&Scope<'_>) -> Result<Map<String, Value>, NodeError> + Send + Sync + 'static,
    {
        self.pre_process.insert(name.into(), Arc::new(hook));
    }

    pub fn register_post_process<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(Value, &Scope<'_>) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.post_process.insert(name.into(), Arc::new(hook));
    }

    pub fn function(&self, name: &str) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(name)
    }

    pub fn predicate(&self, name: &str) -> Option<&PredicateFn> {
        self.predicates.get(name)
    }

    pub fn pre_process(&self, name: &str) -> Option<&PreProcessFn> {
        self.pre_process.get(name)
    }

    pub fn post_process(&self, name: &str) -> Option<&PostProcessFn> {
        self.post_process.get(name)
    }

    /// Check every name the graph (and its subgraphs) refers to.
    pub fn validate(&self, graph: &GraphSpec) -> Result<(), ConfigError> {
        for node in graph.nodes() {
            let missing = |what: &'static str, name: &str| ConfigError::UnknownReference {
                node: node.id.clone(),
                what,
                name: name.to_string(),
            };

            if let Some(hook) = &node.pre_process {
                if !self.pre_process.contains_key(hook) {
                    return Err(missing("pre_process hook", hook));
                }
            }
            if let Some(hook) = &node.post_process {
                if !self.post_process.contains_key(hook) {
                    return Err(missing("post_process hook", hook));
                }
            }

            match &node.kind {
                NodeKind::Invoke(config) => {
                    if !self.backends.contains(&config.model) {
                        return Err(missing("model", &config.model));
                    }
                }
                NodeKind::MultiInvoke(config) => {
                    for step in &config.steps {
                        if !self.backends.contains(&step.call.model) {
                            return Err(missing("model", &step.call.model));
                        }
                    }
                }
                NodeKind::Function(config) => {
                    if !self.functions.contains_key(&config.function) {
                        return Err(missing("function", &config.function));
                    }
                }
                NodeKind::Subgraph(config) => self.validate(&config.graph)?,
                NodeKind::Sampler(_) => {}
            }

            for edge in graph.out_edges(&node.id) {
                if let Some(EdgeCondition::Predicate(name)) = &edge.condition {
                    if !self.predicates.contains_key(name) {
                        return Err(missing("predicate", name));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse a JSON string found at `params.from` (or at the path given as a bare string).
fn parse_json(scope: &Scope<'_>, params: &Value) -> Result<Value, NodeError> {
    let path = match params {
        Value::String(path) => path.as_str(),
        Value::Object(map) => map
            .get("from")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Function("parse_json needs a 'from' path".to_string()))?,
        _ => return Err(NodeError::Function("parse_json needs a 'from' path".to_string())),
    };

    match scope.lookup(path) {
        Some(Value::String(text)) => serde_json::from_str(strip_code_fence(text))
            .map_err(|e| NodeError::Function(format!("'{}' is not valid JSON: {}", path, e))),
        Some(other) => Ok(other.clone()),
        None => Err(NodeError::Function(format!("'{}' is not set", path))),
    }
}

pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
