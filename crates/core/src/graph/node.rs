use rand::distributions::WeightedIndex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::condition::Condition;
use super::spec::GraphSpec;
use crate::types::NodeId;

/// A node of the graph: id, kind-specific configuration and optional hooks.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Registered hook whose object result is added to the node's template scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_process: Option<String>,
    /// Registered hook applied to the node's output before it is committed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_process: Option<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            kind,
            pre_process: None,
            post_process: None,
        }
    }

    pub fn with_pre_process(mut self, hook: impl Into<String>) -> Self {
        self.pre_process = Some(hook.into());
        self
    }

    pub fn with_post_process(mut self, hook: impl Into<String>) -> Self {
        self.post_process = Some(hook.into());
        self
    }
}

/// Closed set of node kinds
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Single call to an inference backend
    Invoke(InvokeConfig),
    /// Sequence (optionally repeated) of backend calls feeding each other
    MultiInvoke(MultiInvokeConfig),
    /// Caller-supplied function from the registry
    Function(FunctionConfig),
    /// Weighted draw from a static list
    Sampler(SamplerConfig),
    /// Nested graph with declared inputs and outputs
    Subgraph(SubgraphConfig),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoke(_) => "invoke",
            Self::MultiInvoke(_) => "multi_invoke",
            Self::Function(_) => "function",
            Self::Sampler(_) => "sampler",
            Self::Subgraph(_) => "subgraph",
        }
    }

    /// Merge `patch` into this node's configuration (subgraph override maps).
    pub fn apply_override(&mut self, patch: &Value) -> Result<(), String> {
        let Value::Object(patch) = patch else {
            return Err("override must be an object".to_string());
        };
        match self {
            Self::Invoke(config) => merge_config(config, patch),
            Self::MultiInvoke(config) => merge_config(config, patch),
            Self::Function(config) => merge_config(config, patch),
            Self::Sampler(config) => merge_config(config, patch),
            Self::Subgraph(_) => Err("subgraph nodes cannot be overridden".to_string()),
        }
    }
}

fn merge_config<T>(config: &mut T, patch: &Map<String, Value>) -> Result<(), String>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    let mut value = serde_json::to_value(&*config).map_err(|e| e.to_string())?;
    if let Value::Object(map) = &mut value {
        for (key, patch_value) in patch {
            match (map.get_mut(key), patch_value) {
                // Nested objects (e.g. params) merge key by key
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    map.insert(key.clone(), patch_value.clone());
                }
            }
        }
    }
    *config = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// How a backend response is turned into the node output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn default_role() -> String {
    "user".to_string()
}

/// One templated chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeConfig {
    /// Model reference resolved through the backend registry
    pub model: String,
    pub prompt: Vec<PromptMessage>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub output: OutputFormat,
    /// Overrides the engine-wide attempt budget for this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Per-attempt timeout; an elapsed timeout counts as a transient failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl InvokeConfig {
    pub fn new(model: impl Into<String>, prompt: Vec<PromptMessage>) -> Self {
        Self {
            model: model.into(),
            prompt,
            params: Map::new(),
            output: OutputFormat::Text,
            max_attempts: None,
            timeout_secs: None,
        }
    }
}

/// A named call inside a multi-invoke node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeStep {
    pub name: String,
    #[serde(flatten)]
    pub call: InvokeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    /// Stop once this holds after a full pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Condition>,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInvokeConfig {
    pub steps: Vec<InvokeStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub function: String,
    #[serde(default)]
    pub params: Value,
}

impl FunctionConfig {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            params: Value::Null,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedChoice {
    pub value: Value,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub choices: Vec<WeightedChoice>,
    /// Makes draws reproducible per record, node and visit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Draw this many values (with replacement) into an array instead of one value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl SamplerConfig {
    pub fn weights(&self) -> Vec<f64> {
        self.choices.iter().map(|c| c.weight).collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.choices.is_empty() {
            return Err("no choices".to_string());
        }
        if self.count == Some(0) {
            return Err("count must be at least 1".to_string());
        }
        if self.choices.iter().any(|c| !c.weight.is_finite()) {
            return Err("weights must be finite".to_string());
        }
        WeightedIndex::new(self.weights()).map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Nested graph invocation.
///
/// `inputs` maps child source field -> parent path, `outputs` maps parent key -> child path.
#[derive(Debug, Clone)]
pub struct SubgraphConfig {
    pub graph: Arc<GraphSpec>,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
}

impl Serialize for SubgraphConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a> {
            graph: &'a str,
            inputs: &'a BTreeMap<String, String>,
            outputs: &'a BTreeMap<String, String>,
        }
        Repr {
            graph: self.graph.fingerprint(),
            inputs: &self.inputs,
            outputs: &self.outputs,
        }
        .serialize(serializer)
    }
}
