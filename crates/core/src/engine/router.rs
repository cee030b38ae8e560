use super::context::RecordContext;
use crate::error::RecordError;
use crate::graph::{EdgeCondition, EdgeSpec, EdgeTarget, GraphSpec};
use crate::registry::Registry;
use crate::types::NodeId;

/// Where a record goes after a node completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Single(NodeId),
    /// Targets run concurrently as branches
    ParallelSet(Vec<NodeId>),
    Terminal,
}

/// Resolves outgoing edges against record state. Pure: same state, same decision.
pub struct EdgeRouter<'a> {
    graph: &'a GraphSpec,
    registry: &'a Registry,
}

impl<'a> EdgeRouter<'a> {
    pub fn new(graph: &'a GraphSpec, registry: &'a Registry) -> Self {
        Self { graph, registry }
    }

    pub fn next(&self, ctx: &RecordContext, from: &NodeId) -> Result<RouteDecision, RecordError> {
        let edges = self.graph.out_edges(from);

        if edges.iter().any(|edge| edge.parallel) {
            return self.fan_out(ctx, from, edges);
        }

        // Conditional edges first (first match wins), then the first unconditional edge
        let mut chosen = None;
        for edge in edges.iter().filter(|edge| edge.condition.is_some()) {
            if self.holds(ctx, edge)? {
                chosen = Some(edge);
                break;
            }
        }
        if chosen.is_none() {
            chosen = edges.iter().find(|edge| edge.condition.is_none());
        }

        match chosen {
            Some(edge) => Ok(match &edge.target {
                EdgeTarget::Node(node) => RouteDecision::Single(node.clone()),
                EdgeTarget::End => RouteDecision::Terminal,
            }),
            None => self.dead_end(from),
        }
    }

    fn fan_out(
        &self,
        ctx: &RecordContext,
        from: &NodeId,
        edges: &[EdgeSpec],
    ) -> Result<RouteDecision, RecordError> {
        let mut targets: Vec<NodeId> = Vec::new();
        for edge in edges {
            if !self.holds(ctx, edge)? {
                continue;
            }
            match &edge.target {
                // A matching END edge ends the record instead of fanning out
                EdgeTarget::End => return Ok(RouteDecision::Terminal),
                EdgeTarget::Node(node) => {
                    if !targets.contains(node) {
                        targets.push(node.clone());
                    }
                }
            }
        }

        match targets.len() {
            0 => self.dead_end(from),
            1 => Ok(RouteDecision::Single(targets.remove(0))),
            _ => Ok(RouteDecision::ParallelSet(targets)),
        }
    }

    fn dead_end(&self, from: &NodeId) -> Result<RouteDecision, RecordError> {
        if self.graph.is_terminal(from) {
            Ok(RouteDecision::Terminal)
        } else {
            Err(RecordError::Routing {
                node: from.clone(),
                reason: "no outgoing edge condition matched".to_string(),
            })
        }
    }

    fn holds(&self, ctx: &RecordContext, edge: &EdgeSpec) -> Result<bool, RecordError> {
        match &edge.condition {
            None => Ok(true),
            Some(EdgeCondition::Expr(condition)) => Ok(condition.evaluate(&ctx.scope())),
            Some(EdgeCondition::Predicate(name)) => {
                let predicate = self.registry.predicate(name).ok_or_else(|| RecordError::Routing {
                    node: edge.source.clone(),
                    reason: format!("predicate '{}' is not registered", name),
                })?;
                Ok(predicate(&ctx.scope()))
            }
        }
    }
}
