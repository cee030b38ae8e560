use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::RecordContext;
use super::node_executor::NodeExecutor;
use super::router::{EdgeRouter, RouteDecision};
use crate::error::{NodeError, RecordError};
use crate::events::EventType;
use crate::graph::{GraphSpec, NodeKind};
use crate::types::{NodeId, NodeStatus, RecordStatus};

/// A finished walk: the final context and how it ended
pub struct TraversalOutcome {
    pub ctx: RecordContext,
    pub result: Result<(), RecordError>,
}

/// How a walk stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
    /// Reached a terminal node
    Terminal,
    /// Arrived at the join node the walk was told to stop at
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Main,
    Branch,
}

/// Drives one record through one graph.
#[derive(Clone)]
pub struct Traversal {
    graph: Arc<GraphSpec>,
    executor: Arc<NodeExecutor>,
}

impl Traversal {
    pub fn new(graph: Arc<GraphSpec>, executor: Arc<NodeExecutor>) -> Self {
        Self { graph, executor }
    }

    pub fn graph(&self) -> &Arc<GraphSpec> {
        &self.graph
    }

    pub fn executor(&self) -> &Arc<NodeExecutor> {
        &self.executor
    }

    /// Walk `ctx` from the start node until a terminal node, a failure or cancellation.
    pub async fn run(&self, mut ctx: RecordContext, cancel: CancellationToken) -> TraversalOutcome {
        ctx.transition(RecordStatus::Running);
        let start = self.graph.start_node().clone();
        let result = self
            .walk(&mut ctx, start, None, Lane::Main, cancel)
            .await
            .map(|_| ());

        let status = match &result {
            Ok(()) => RecordStatus::Completed,
            Err(RecordError::Cancelled) => RecordStatus::Cancelled,
            Err(_) => RecordStatus::Failed,
        };
        ctx.transition(status);
        ctx.set_active(Vec::new());
        TraversalOutcome { ctx, result }
    }

    fn walk<'a>(
        &'a self,
        ctx: &'a mut RecordContext,
        from: NodeId,
        stop_at: Option<NodeId>,
        lane: Lane,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<WalkEnd, RecordError>> {
        Box::pin(async move {
            let mut current = from;
            loop {
                if stop_at.as_ref() == Some(&current) {
                    return Ok(WalkEnd::Joined);
                }
                if cancel.is_cancelled() {
                    return Err(RecordError::Cancelled);
                }
                let limit = self.executor.max_hops();
                if ctx.add_hop() > limit {
                    return Err(RecordError::HopLimitExceeded { limit });
                }

                self.step(ctx, &current, lane, &cancel).await?;

                let router = EdgeRouter::new(&self.graph, self.executor.registry());
                match router.next(ctx, &current)? {
                    RouteDecision::Terminal => return Ok(WalkEnd::Terminal),
                    RouteDecision::Single(next) => current = next,
                    RouteDecision::ParallelSet(targets) => {
                        match self.fan_out(ctx, &current, targets, &cancel).await? {
                            Some(join) => current = join,
                            None => return Ok(WalkEnd::Terminal),
                        }
                    }
                }
            }
        })
    }

    /// Execute one node and commit its output.
    async fn step(
        &self,
        ctx: &mut RecordContext,
        node_id: &NodeId,
        lane: Lane,
        cancel: &CancellationToken,
    ) -> Result<(), RecordError> {
        let node = self.graph.resolve(node_id).ok_or_else(|| RecordError::Internal {
            node: node_id.clone(),
            message: "node missing from graph".to_string(),
        })?;
        let events = self.executor.events();

        ctx.set_active(vec![node_id.clone()]);
        ctx.record(node_id, NodeStatus::Started, None);
        events
            .emit(EventType::NodeStarted {
                record_id: ctx.record_id().clone(),
                node_id: node_id.clone(),
            })
            .await;

        let started = Instant::now();
        // A subgraph's own nodes take permits; holding one across the child walk
        // would starve a fan-out inside it.
        let needs_permit = lane == Lane::Branch && !matches!(node.kind, NodeKind::Subgraph(_));
        let result = if needs_permit {
            match self.executor.branch_permit(cancel).await {
                Ok(_permit) => self.executor.execute(ctx, node, cancel).await,
                Err(err) => Err(err),
            }
        } else {
            self.executor.execute(ctx, node, cancel).await
        };

        match result {
            Ok(value) => {
                ctx.commit(node_id, value);
                ctx.record(node_id, NodeStatus::Completed, None);
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(
                    "Node {} completed for record {} in {}ms",
                    node_id,
                    ctx.record_id(),
                    duration_ms
                );
                events
                    .emit(EventType::NodeCompleted {
                        record_id: ctx.record_id().clone(),
                        node_id: node_id.clone(),
                        duration_ms,
                    })
                    .await;
                Ok(())
            }
            Err(NodeError::Cancelled) => {
                ctx.record(node_id, NodeStatus::Cancelled, None);
                Err(RecordError::Cancelled)
            }
            Err(err) => {
                let attempt = match &err {
                    NodeError::Exhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                let err = RecordError::from_node(node_id, err);
                ctx.record(node_id, NodeStatus::Failed, Some(err.to_string()));
                events
                    .emit(EventType::NodeFailed {
                        record_id: ctx.record_id().clone(),
                        node_id: node_id.clone(),
                        error: err.to_string(),
                        attempt,
                        will_retry: false,
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Run `targets` as concurrent branches and merge them back.
    ///
    /// Returns the join node to continue from, or `None` when the record is
    /// finished (no join, or a branch reached a terminal node first).
    async fn fan_out(
        &self,
        ctx: &mut RecordContext,
        from: &NodeId,
        targets: Vec<NodeId>,
        cancel: &CancellationToken,
    ) -> Result<Option<NodeId>, RecordError> {
        let join = self.graph.join_for(from).cloned();
        let events = self.executor.events();

        ctx.transition(RecordStatus::AwaitingJoin);
        ctx.set_active(targets.clone());
        events
            .emit(EventType::FanOut {
                record_id: ctx.record_id().clone(),
                node_id: from.clone(),
                branches: targets.clone(),
                join: join.clone(),
            })
            .await;
        debug!(
            "Record {} fans out from {} into {} branches",
            ctx.record_id(),
            from,
            targets.len()
        );

        let siblings = cancel.child_token();
        let mut tasks = JoinSet::new();
        for (slot, target) in targets.iter().enumerate() {
            let traversal = self.clone();
            let mut branch = ctx.branch();
            let target = target.clone();
            let stop_at = join.clone();
            let token = siblings.clone();
            tasks.spawn(async move {
                let result = traversal
                    .walk(&mut branch, target, stop_at, Lane::Branch, token)
                    .await;
                (slot, branch, result)
            });
        }

        let mut finished: Vec<Option<(RecordContext, Result<WalkEnd, RecordError>)>> =
            (0..targets.len()).map(|_| None).collect();
        let mut failure: Option<RecordError> = None;
        let mut terminated = false;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, branch, result)) => {
                    match &result {
                        // A branch that ends the record stops its siblings
                        Ok(WalkEnd::Terminal) if join.is_some() => {
                            if failure.is_none() && !terminated {
                                terminated = true;
                                siblings.cancel();
                            }
                        }
                        Ok(_) | Err(RecordError::Cancelled) => {}
                        Err(err) => {
                            if failure.is_none() && !terminated {
                                failure = Some(err.clone());
                                siblings.cancel();
                            }
                        }
                    }
                    finished[slot] = Some((branch, result));
                }
                Err(e) => {
                    warn!("Branch task for record {} aborted: {}", ctx.record_id(), e);
                    if failure.is_none() && !terminated {
                        failure = Some(RecordError::Internal {
                            node: from.clone(),
                            message: e.to_string(),
                        });
                        siblings.cancel();
                    }
                }
            }
        }

        // Merge in declaration order; only successful branches contribute outputs
        let mut owners: HashMap<NodeId, NodeId> = HashMap::new();
        let mut conflict = None;
        for (slot, entry) in finished.into_iter().enumerate() {
            let Some((branch, result)) = entry else {
                continue;
            };
            let keep = result.is_ok();
            if keep {
                for node in branch.written() {
                    if let Some(previous) = owners.insert(node.clone(), targets[slot].clone()) {
                        conflict.get_or_insert_with(|| RecordError::Routing {
                            node: from.clone(),
                            reason: format!(
                                "branches '{}' and '{}' both wrote '{}'",
                                previous, targets[slot], node
                            ),
                        });
                    }
                }
            }
            ctx.merge_branch(branch, keep);
        }

        if cancel.is_cancelled() {
            return Err(RecordError::Cancelled);
        }
        if let Some(err) = failure.or(conflict) {
            return Err(err);
        }

        ctx.transition(RecordStatus::Running);
        if terminated {
            return Ok(None);
        }
        match join {
            Some(join) => {
                events
                    .emit(EventType::Joined {
                        record_id: ctx.record_id().clone(),
                        node_id: join.clone(),
                        branches: targets.len(),
                    })
                    .await;
                ctx.set_active(vec![join.clone()]);
                Ok(Some(join))
            }
            None => Ok(None),
        }
    }
}
