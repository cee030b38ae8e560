use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::condition::Condition;
use super::node::{
    FunctionConfig, InvokeConfig, MultiInvokeConfig, NodeKind, NodeSpec, SamplerConfig,
    SubgraphConfig,
};
use super::spec::{EdgeCondition, EdgeSpec, EdgeTarget, GraphSpec, END, START};
use crate::engine::projector::OutputSpec;
use crate::error::ConfigError;
use crate::types::NodeId;

/// Declared edge before validation. `from` may be `START`, `to` may be `END`.
#[derive(Debug, Clone, Default)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    pub condition: Option<String>,
    pub predicate: Option<String>,
    pub parallel: bool,
    pub weight: i32,
}

impl EdgeDef {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    pub fn when(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn predicate(mut self, name: impl Into<String>) -> Self {
        self.predicate = Some(name.into());
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }
}

/// Nested graph declaration; the child is built when the parent is.
#[derive(Debug, Clone)]
pub struct SubgraphDef {
    pub graph: GraphBuilder,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, Value>,
    pub pre_process: Option<String>,
    pub post_process: Option<String>,
}

impl SubgraphDef {
    pub fn new(graph: GraphBuilder) -> Self {
        Self {
            graph,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            overrides: BTreeMap::new(),
            pre_process: None,
            post_process: None,
        }
    }

    /// Seed child source field `field` from the parent path `from`.
    pub fn input(mut self, field: impl Into<String>, from: impl Into<String>) -> Self {
        self.inputs.insert(field.into(), from.into());
        self
    }

    /// Expose the child path `from` to the parent as `key`.
    pub fn output(mut self, key: impl Into<String>, from: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), from.into());
        self
    }

    /// Merge `patch` into the configuration of child node `node`.
    pub fn override_node(mut self, node: impl Into<String>, patch: Value) -> Self {
        self.overrides.insert(node.into(), patch);
        self
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Node(NodeSpec),
    Subgraph { id: String, def: SubgraphDef },
}

impl Entry {
    fn id(&self) -> &str {
        match self {
            Self::Node(node) => node.id.as_str(),
            Self::Subgraph { id, .. } => id,
        }
    }
}

/// Programmatic graph construction. All checks run in [`GraphBuilder::build`].
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    name: String,
    entries: Vec<Entry>,
    edges: Vec<EdgeDef>,
    start: Option<String>,
    ends: Vec<String>,
    output: Option<OutputSpec>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            edges: Vec::new(),
            start: None,
            ends: Vec::new(),
            output: None,
        }
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.entries.push(Entry::Node(node));
        self
    }

    pub fn invoke(self, id: impl Into<String>, config: InvokeConfig) -> Self {
        self.node(NodeSpec::new(id, NodeKind::Invoke(config)))
    }

    pub fn multi_invoke(self, id: impl Into<String>, config: MultiInvokeConfig) -> Self {
        self.node(NodeSpec::new(id, NodeKind::MultiInvoke(config)))
    }

    pub fn function(self, id: impl Into<String>, function: impl Into<String>, params: Value) -> Self {
        let mut config = FunctionConfig::new(function);
        config.params = params;
        self.node(NodeSpec::new(id, NodeKind::Function(config)))
    }

    pub fn sampler(self, id: impl Into<String>, config: SamplerConfig) -> Self {
        self.node(NodeSpec::new(id, NodeKind::Sampler(config)))
    }

    pub fn subgraph(mut self, id: impl Into<String>, def: SubgraphDef) -> Self {
        self.entries.push(Entry::Subgraph { id: id.into(), def });
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge_def(EdgeDef::new(from, to))
    }

    /// Edge guarded by an inline condition such as `critique.score < 0.8`.
    pub fn edge_when(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        self.edge_def(EdgeDef::new(from, to).when(expr))
    }

    /// Edge guarded by a predicate registered under `predicate`.
    pub fn edge_if(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        self.edge_def(EdgeDef::new(from, to).predicate(predicate))
    }

    pub fn parallel_edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge_def(EdgeDef::new(from, to).parallel())
    }

    pub fn edge_def(mut self, edge: EdgeDef) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn start(mut self, node: impl Into<String>) -> Self {
        self.start = Some(node.into());
        self
    }

    /// Mark a node terminal without an explicit edge to END.
    pub fn end(mut self, node: impl Into<String>) -> Self {
        self.ends.push(node.into());
        self
    }

    pub fn output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    fn apply_override(&mut self, node: &str, patch: &Value) -> Result<(), ConfigError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id() == node)
            .ok_or_else(|| ConfigError::UnknownNode {
                context: format!("override in graph '{}'", self.name),
                node: NodeId::new(node),
            })?;
        match entry {
            Entry::Node(spec) => spec
                .kind
                .apply_override(patch)
                .map_err(|reason| ConfigError::InvalidNode {
                    node: spec.id.clone(),
                    reason: format!("override: {reason}"),
                }),
            Entry::Subgraph { id, .. } => Err(ConfigError::InvalidNode {
                node: NodeId::new(id.as_str()),
                reason: "override: subgraph nodes cannot be overridden".to_string(),
            }),
        }
    }

    pub fn build(self) -> Result<GraphSpec, ConfigError> {
        let mut nodes = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            match entry {
                Entry::Node(node) => nodes.push(node),
                Entry::Subgraph { id, def } => nodes.push(build_subgraph(id, def)?),
            }
        }

        let mut start = self.start.map(NodeId::new);
        let mut edges = Vec::with_capacity(self.edges.len());

        for def in self.edges {
            if def.from == START {
                if def.to == END {
                    return Err(ConfigError::Document("START cannot lead directly to END".to_string()));
                }
                if def.condition.is_some() || def.predicate.is_some() || def.parallel {
                    return Err(ConfigError::Document(
                        "edges from START cannot be conditional or parallel".to_string(),
                    ));
                }
                let target = NodeId::new(def.to);
                match &start {
                    Some(first) if *first != target => {
                        return Err(ConfigError::MultipleStarts {
                            first: first.clone(),
                            second: target,
                        });
                    }
                    _ => start = Some(target),
                }
                continue;
            }

            let condition = match (def.condition, def.predicate) {
                (Some(expr), Some(_)) => {
                    return Err(ConfigError::InvalidCondition {
                        expr,
                        reason: "edge has both a condition and a predicate".to_string(),
                    });
                }
                (Some(expr), None) => Some(EdgeCondition::Expr(Condition::parse(&expr)?)),
                (None, Some(name)) => Some(EdgeCondition::Predicate(name)),
                (None, None) => None,
            };

            edges.push(EdgeSpec {
                source: NodeId::new(def.from),
                target: EdgeTarget::parse(&def.to),
                condition,
                parallel: def.parallel,
                weight: def.weight,
            });
        }

        let start = start.ok_or(ConfigError::MissingStart)?;
        let ends = self.ends.into_iter().map(NodeId::new).collect();

        GraphSpec::assemble(self.name, nodes, edges, start, ends, self.output)
    }
}

fn build_subgraph(id: String, def: SubgraphDef) -> Result<NodeSpec, ConfigError> {
    let SubgraphDef {
        mut graph,
        inputs,
        outputs,
        overrides,
        pre_process,
        post_process,
    } = def;

    for (node, patch) in &overrides {
        graph.apply_override(node, patch)?;
    }

    let child = graph.build().map_err(|e| ConfigError::InvalidNode {
        node: NodeId::new(id.as_str()),
        reason: format!("subgraph: {e}"),
    })?;

    let mut spec = NodeSpec::new(
        id,
        NodeKind::Subgraph(SubgraphConfig {
            graph: Arc::new(child),
            inputs,
            outputs,
        }),
    );
    spec.pre_process = pre_process;
    spec.post_process = post_process;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{PromptMessage, WeightedChoice};
    use serde_json::json;

    fn invoke(prompt: &str) -> InvokeConfig {
        InvokeConfig::new("test-model", vec![PromptMessage::user(prompt)])
    }

    fn linear() -> GraphBuilder {
        GraphBuilder::new("linear")
            .invoke("generate", invoke("Write about {{topic}}"))
            .function("clean", "template", json!({"text": "{{generate}}"}))
            .edge(START, "generate")
            .edge("generate", "clean")
            .edge("clean", END)
    }

    #[test]
    fn test_build_linear_graph() {
        let graph = linear().build().unwrap();
        assert_eq!(graph.start_node().as_str(), "generate");
        assert_eq!(graph.node_count(), 2);
        assert!(graph.is_terminal(&NodeId::new("clean")));
        assert!(!graph.is_terminal(&NodeId::new("generate")));
        assert_eq!(graph.out_edges(&NodeId::new("generate")).len(), 1);
        assert!(graph.resolve(&NodeId::new("missing")).is_none());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = linear().invoke("generate", invoke("again")).build().unwrap_err();
        assert_eq!(err, ConfigError::DuplicateNode(NodeId::new("generate")));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let err = linear().edge("clean", "nowhere").build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode { node, .. } if node.as_str() == "nowhere"));
    }

    #[test]
    fn test_missing_and_multiple_starts() {
        let err = GraphBuilder::new("g")
            .invoke("a", invoke("x"))
            .edge("a", END)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingStart);

        let err = linear().edge(START, "clean").build().unwrap_err();
        assert!(matches!(err, ConfigError::MultipleStarts { .. }));
    }

    #[test]
    fn test_graph_without_end_rejected() {
        let err = GraphBuilder::new("loop")
            .invoke("a", invoke("x"))
            .invoke("b", invoke("y"))
            .edge(START, "a")
            .edge("a", "b")
            .edge("b", "a")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::NoEndNode);
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let err = linear()
            .invoke("orphan", invoke("x"))
            .edge("orphan", END)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Unreachable(NodeId::new("orphan")));
    }

    #[test]
    fn test_dead_end_node_rejected() {
        let err = GraphBuilder::new("g")
            .invoke("a", invoke("x"))
            .invoke("b", invoke("y"))
            .edge(START, "a")
            .edge("a", "b")
            .edge_when("a", END, "done")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::NoOutgoingEdge(NodeId::new("b")));

        // An explicit end declaration makes it terminal
        assert!(GraphBuilder::new("g")
            .invoke("a", invoke("x"))
            .invoke("b", invoke("y"))
            .edge(START, "a")
            .edge("a", "b")
            .edge_when("a", END, "done")
            .end("b")
            .build()
            .is_ok());
    }

    #[test]
    fn test_parallel_edge_to_end_rejected() {
        let err = linear().parallel_edge("generate", END).build().unwrap_err();
        assert_eq!(err, ConfigError::ParallelToEnd(NodeId::new("generate")));
    }

    #[test]
    fn test_fan_out_node_ends_only_conditionally() {
        let fork = || {
            GraphBuilder::new("fork")
                .function("split", "template", json!({}))
                .function("a", "template", json!({}))
                .function("b", "template", json!({}))
                .edge(START, "split")
                .parallel_edge("split", "a")
                .parallel_edge("split", "b")
                .edge("a", END)
                .edge("b", END)
        };

        let err = fork().edge("split", END).build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNode { ref node, .. } if node.as_str() == "split"));
        assert!(fork().edge_when("split", END, "topic == skip").build().is_ok());
    }

    #[test]
    fn test_bad_condition_rejected() {
        let err = linear().edge_when("generate", END, "a b c").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCondition { .. }));
    }

    #[test]
    fn test_bad_sampler_rejected() {
        let err = GraphBuilder::new("g")
            .sampler(
                "pick",
                SamplerConfig {
                    choices: vec![WeightedChoice { value: json!(1), weight: 0.0 }],
                    seed: None,
                    count: None,
                },
            )
            .edge(START, "pick")
            .edge("pick", END)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSampler { .. }));
    }

    #[test]
    fn test_edges_ordered_by_weight_then_declaration() {
        let graph = GraphBuilder::new("g")
            .invoke("a", invoke("x"))
            .invoke("b", invoke("y"))
            .invoke("c", invoke("z"))
            .edge(START, "a")
            .edge_def(EdgeDef::new("a", "b").weight(5))
            .edge_def(EdgeDef::new("a", "c").when("flag"))
            .edge_def(EdgeDef::new("a", END).when("done"))
            .edge("b", END)
            .edge("c", END)
            .build()
            .unwrap();

        let targets: Vec<String> = graph
            .out_edges(&NodeId::new("a"))
            .iter()
            .map(|e| e.target.to_string())
            .collect();
        assert_eq!(targets, vec!["c", "END", "b"]);
    }

    #[test]
    fn test_join_node_detection() {
        let graph = GraphBuilder::new("diamond")
            .function("split", "template", json!({}))
            .function("left", "template", json!({}))
            .function("middle", "template", json!({}))
            .function("right", "template", json!({}))
            .function("left2", "template", json!({}))
            .function("merge", "template", json!({}))
            .edge(START, "split")
            .parallel_edge("split", "left")
            .parallel_edge("split", "middle")
            .parallel_edge("split", "right")
            .edge("left", "left2")
            .edge("left2", "merge")
            .edge("middle", "merge")
            .edge("right", "merge")
            .edge("merge", END)
            .build()
            .unwrap();

        assert_eq!(graph.join_for(&NodeId::new("split")), Some(&NodeId::new("merge")));
        assert_eq!(graph.join_for(&NodeId::new("merge")), None);
    }

    #[test]
    fn test_branch_target_can_be_join() {
        let graph = GraphBuilder::new("skip")
            .function("split", "template", json!({}))
            .function("a", "template", json!({}))
            .function("merge", "template", json!({}))
            .edge(START, "split")
            .parallel_edge("split", "a")
            .parallel_edge("split", "merge")
            .edge("a", "merge")
            .edge("merge", END)
            .build()
            .unwrap();

        assert_eq!(graph.join_for(&NodeId::new("split")), Some(&NodeId::new("merge")));
    }

    #[test]
    fn test_fan_out_without_join() {
        let graph = GraphBuilder::new("fork")
            .function("split", "template", json!({}))
            .function("a", "template", json!({}))
            .function("b", "template", json!({}))
            .edge(START, "split")
            .parallel_edge("split", "a")
            .parallel_edge("split", "b")
            .edge("a", END)
            .edge("b", END)
            .build()
            .unwrap();
        assert_eq!(graph.join_for(&NodeId::new("split")), None);
    }

    #[test]
    fn test_fingerprint_tracks_structure() {
        let a = linear().build().unwrap();
        let b = linear().build().unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let changed = GraphBuilder::new("linear")
            .invoke("generate", invoke("Write about {{topic}} briefly"))
            .function("clean", "template", json!({"text": "{{generate}}"}))
            .edge(START, "generate")
            .edge("generate", "clean")
            .edge("clean", END)
            .build()
            .unwrap();
        assert_ne!(a.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_subgraph_overrides_apply_to_child() {
        let child = GraphBuilder::new("child")
            .invoke("inner", invoke("{{question}}"))
            .edge(START, "inner")
            .edge("inner", END);

        let graph = GraphBuilder::new("parent")
            .subgraph(
                "nested",
                SubgraphDef::new(child)
                    .input("question", "topic")
                    .output("answer", "inner")
                    .override_node("inner", json!({"model": "big", "params": {"temperature": 0.1}})),
            )
            .edge(START, "nested")
            .edge("nested", END)
            .build()
            .unwrap();

        let NodeKind::Subgraph(config) = &graph.resolve(&NodeId::new("nested")).unwrap().kind else {
            panic!("expected subgraph node");
        };
        let NodeKind::Invoke(inner) = &config.graph.resolve(&NodeId::new("inner")).unwrap().kind else {
            panic!("expected invoke node");
        };
        assert_eq!(inner.model, "big");
        assert_eq!(inner.params["temperature"], json!(0.1));
    }

    #[test]
    fn test_override_of_unknown_child_node_rejected() {
        let child = GraphBuilder::new("child")
            .invoke("inner", invoke("x"))
            .edge(START, "inner")
            .edge("inner", END);
        let err = GraphBuilder::new("parent")
            .subgraph("nested", SubgraphDef::new(child).override_node("ghost", json!({})))
            .edge(START, "nested")
            .edge("nested", END)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode { node, .. } if node.as_str() == "ghost"));
    }
}
