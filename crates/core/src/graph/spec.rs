use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};

use super::condition::Condition;
use super::node::{NodeKind, NodeSpec};
use crate::engine::projector::OutputSpec;
use crate::error::ConfigError;
use crate::types::NodeId;

/// Document name of the implicit entry point.
pub const START: &str = "START";
/// Document name of the implicit exit.
pub const END: &str = "END";

/// Where an edge leads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTarget {
    Node(NodeId),
    End,
}

impl EdgeTarget {
    pub fn parse(name: &str) -> Self {
        if name == END {
            Self::End
        } else {
            Self::Node(NodeId::new(name))
        }
    }
}

impl std::fmt::Display for EdgeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(node) => write!(f, "{node}"),
            Self::End => f.write_str(END),
        }
    }
}

/// Guard on an edge
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Inline comparison parsed at build time
    Expr(Condition),
    /// Named predicate from the registry
    Predicate(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub target: EdgeTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
    pub parallel: bool,
    /// Lower weights are evaluated first; ties keep declaration order
    pub weight: i32,
}

/// Immutable, validated graph shared read-only by every record.
#[derive(Debug)]
pub struct GraphSpec {
    name: String,
    graph: DiGraph<NodeSpec, ()>,
    indices: HashMap<NodeId, NodeIndex>,
    edges: HashMap<NodeId, Vec<EdgeSpec>>,
    start: NodeId,
    terminals: HashSet<NodeId>,
    joins: HashMap<NodeId, NodeId>,
    output: Option<OutputSpec>,
    fingerprint: String,
}

impl GraphSpec {
    /// Validate the parts and freeze them into a graph.
    pub(crate) fn assemble(
        name: String,
        nodes: Vec<NodeSpec>,
        edges: Vec<EdgeSpec>,
        start: NodeId,
        explicit_ends: Vec<NodeId>,
        output: Option<OutputSpec>,
    ) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in nodes {
            validate_node(&node)?;
            if indices.contains_key(&node.id) {
                return Err(ConfigError::DuplicateNode(node.id));
            }
            let id = node.id.clone();
            let index = graph.add_node(node);
            indices.insert(id, index);
        }

        if !indices.contains_key(&start) {
            return Err(ConfigError::UnknownNode {
                context: "start".to_string(),
                node: start,
            });
        }

        let mut terminals = HashSet::new();
        let mut by_source: HashMap<NodeId, Vec<EdgeSpec>> = HashMap::new();

        for edge in edges {
            let source_idx = *indices.get(&edge.source).ok_or_else(|| ConfigError::UnknownNode {
                context: format!("edge to '{}'", edge.target),
                node: edge.source.clone(),
            })?;

            match &edge.target {
                EdgeTarget::Node(target) => {
                    let target_idx =
                        *indices.get(target).ok_or_else(|| ConfigError::UnknownNode {
                            context: format!("edge from '{}'", edge.source),
                            node: target.clone(),
                        })?;
                    graph.update_edge(source_idx, target_idx, ());
                }
                EdgeTarget::End => {
                    if edge.parallel {
                        return Err(ConfigError::ParallelToEnd(edge.source.clone()));
                    }
                    terminals.insert(edge.source.clone());
                }
            }

            by_source.entry(edge.source.clone()).or_default().push(edge);
        }

        for node in explicit_ends {
            if !indices.contains_key(&node) {
                return Err(ConfigError::UnknownNode {
                    context: "end".to_string(),
                    node,
                });
            }
            terminals.insert(node);
        }

        if terminals.is_empty() {
            return Err(ConfigError::NoEndNode);
        }

        // Stable sort keeps declaration order among equal weights
        for edges in by_source.values_mut() {
            edges.sort_by_key(|edge| edge.weight);
        }

        // A fan-out node may only end the record conditionally
        for (source, edges) in &by_source {
            let fans_out = edges.iter().any(|edge| edge.parallel);
            let always_ends = edges
                .iter()
                .any(|edge| edge.target == EdgeTarget::End && edge.condition.is_none());
            if fans_out && always_ends {
                return Err(ConfigError::InvalidNode {
                    node: source.clone(),
                    reason: "unconditional END edge next to parallel edges".to_string(),
                });
            }
        }

        for node in graph.node_weights() {
            if !terminals.contains(&node.id) && !by_source.contains_key(&node.id) {
                return Err(ConfigError::NoOutgoingEdge(node.id.clone()));
            }
        }

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&graph, indices[&start]);
        while let Some(index) = bfs.next(&graph) {
            reachable.insert(index);
        }
        if let Some(index) = graph.node_indices().find(|i| !reachable.contains(i)) {
            return Err(ConfigError::Unreachable(graph[index].id.clone()));
        }

        let joins = compute_joins(&graph, &indices, &by_source);

        let mut spec = Self {
            name,
            graph,
            indices,
            edges: by_source,
            start,
            terminals,
            joins,
            output: None,
            fingerprint: String::new(),
        };

        if let Some(output) = &output {
            output.validate(&spec)?;
        }
        spec.output = output;
        spec.fingerprint = spec.compute_fingerprint();

        Ok(spec)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// SHA-256 over the canonical form of nodes, edges and output mapping.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn start_node(&self) -> &NodeId {
        &self.start
    }

    pub fn resolve(&self, node: &NodeId) -> Option<&NodeSpec> {
        self.indices.get(node).map(|index| &self.graph[*index])
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.indices.contains_key(node)
    }

    /// Outgoing edges in evaluation order.
    pub fn out_edges(&self, node: &NodeId) -> &[EdgeSpec] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A node is terminal when it has an edge to END or was declared an end node.
    pub fn is_terminal(&self, node: &NodeId) -> bool {
        self.terminals.contains(node)
    }

    /// The node where the branches fanned out from `node` recombine, if they do.
    pub fn join_for(&self, node: &NodeId) -> Option<&NodeId> {
        self.joins.get(node)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.graph.node_weights()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn output_spec(&self) -> Option<&OutputSpec> {
        self.output.as_ref()
    }

    fn compute_fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            name: &'a str,
            start: &'a NodeId,
            ends: BTreeSet<&'a NodeId>,
            nodes: Vec<&'a NodeSpec>,
            edges: Vec<&'a EdgeSpec>,
            output: Option<&'a OutputSpec>,
        }

        let mut nodes: Vec<&NodeSpec> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut sources: Vec<&NodeId> = self.edges.keys().collect();
        sources.sort();
        let edges = sources
            .into_iter()
            .flat_map(|source| self.edges[source].iter())
            .collect();

        let canonical = Canonical {
            name: &self.name,
            start: &self.start,
            ends: self.terminals.iter().collect(),
            nodes,
            edges,
            output: self.output.as_ref(),
        };
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

fn validate_node(node: &NodeSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidNode {
        node: node.id.clone(),
        reason: reason.to_string(),
    };

    if node.id.as_str().is_empty() || node.id.as_str() == START || node.id.as_str() == END {
        return Err(invalid("reserved or empty node id"));
    }
    if node.id.as_str().contains('.') {
        return Err(invalid("node ids cannot contain '.'"));
    }

    match &node.kind {
        NodeKind::Invoke(config) => {
            if config.prompt.is_empty() {
                return Err(invalid("invoke node needs at least one prompt message"));
            }
            if config.max_attempts == Some(0) {
                return Err(invalid("max_attempts must be at least 1"));
            }
        }
        NodeKind::MultiInvoke(config) => {
            if config.steps.is_empty() {
                return Err(invalid("multi_invoke node needs at least one step"));
            }
            let mut names = HashSet::new();
            for step in &config.steps {
                if step.call.prompt.is_empty() {
                    return Err(invalid("every multi_invoke step needs a prompt"));
                }
                if !names.insert(step.name.as_str()) {
                    return Err(invalid("multi_invoke step names must be unique"));
                }
            }
            if config.repeat.as_ref().is_some_and(|r| r.max_iterations == 0) {
                return Err(invalid("repeat.max_iterations must be at least 1"));
            }
        }
        NodeKind::Sampler(config) => {
            config.validate().map_err(|reason| ConfigError::InvalidSampler {
                node: node.id.clone(),
                reason,
            })?;
        }
        NodeKind::Function(_) | NodeKind::Subgraph(_) => {}
    }
    Ok(())
}

/// For every fan-out node, pick the closest node reachable from all of its parallel targets.
/// A target may itself be the join when every other branch leads into it.
fn compute_joins(
    graph: &DiGraph<NodeSpec, ()>,
    indices: &HashMap<NodeId, NodeIndex>,
    edges: &HashMap<NodeId, Vec<EdgeSpec>>,
) -> HashMap<NodeId, NodeId> {
    let mut joins = HashMap::new();

    for (source, out) in edges {
        if !out.iter().any(|edge| edge.parallel) {
            continue;
        }
        let mut targets: Vec<NodeIndex> = Vec::new();
        for edge in out {
            if let EdgeTarget::Node(target) = &edge.target {
                let index = indices[target];
                if !targets.contains(&index) {
                    targets.push(index);
                }
            }
        }
        if targets.len() < 2 {
            continue;
        }

        let fan_out = indices[source];
        let distances: Vec<HashMap<NodeIndex, usize>> = targets
            .iter()
            .map(|target| dijkstra(graph, *target, None, |_| 1usize))
            .collect();

        let best = graph
            .node_indices()
            .filter(|index| *index != fan_out)
            .filter_map(|index| {
                let hops: Option<Vec<usize>> =
                    distances.iter().map(|d| d.get(&index).copied()).collect();
                let hops = hops?;
                let max = hops.iter().copied().max().unwrap_or(0);
                let sum: usize = hops.iter().sum();
                Some(((max, sum, index.index()), index))
            })
            .min_by_key(|(key, _)| *key);

        if let Some((_, index)) = best {
            joins.insert(source.clone(), graph[index].id.clone());
        }
    }

    joins
}
