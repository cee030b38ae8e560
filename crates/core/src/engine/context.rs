use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::types::{NodeId, NodeStatus, RecordId, RecordStatus, SourceRecord, TraceEntry};

/// Root segment that always addresses the source payload.
pub const SOURCE_ROOT: &str = "source";

/// Mutable state of one record as it moves through a graph.
///
/// Owned by the task driving the record. During a fan-out each branch works
/// on its own [`RecordContext::branch`] copy and only the node ids it wrote
/// are merged back.
#[derive(Debug, Clone)]
pub struct RecordContext {
    record_id: RecordId,
    index: u64,
    source: Arc<Map<String, Value>>,
    outputs: HashMap<NodeId, Value>,
    active: Vec<NodeId>,
    trace: Vec<TraceEntry>,
    status: RecordStatus,
    visits: HashMap<NodeId, u32>,
    hops: u32,
    // Branch bookkeeping, empty on the main lane
    written: HashSet<NodeId>,
    trace_base: usize,
    hops_base: u32,
}

impl RecordContext {
    pub fn new(record: &SourceRecord) -> Self {
        Self::from_parts(record.id.clone(), record.index, record.payload.clone())
    }

    pub fn from_parts(record_id: RecordId, index: u64, payload: Map<String, Value>) -> Self {
        Self {
            record_id,
            index,
            source: Arc::new(payload),
            outputs: HashMap::new(),
            active: Vec::new(),
            trace: Vec::new(),
            status: RecordStatus::Pending,
            visits: HashMap::new(),
            hops: 0,
            written: HashSet::new(),
            trace_base: 0,
            hops_base: 0,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.source
    }

    pub fn output(&self, node: &NodeId) -> Option<&Value> {
        self.outputs.get(node)
    }

    pub fn outputs(&self) -> &HashMap<NodeId, Value> {
        &self.outputs
    }

    /// Store a node's output under its id, replacing the value from an earlier pass.
    pub fn commit(&mut self, node: &NodeId, output: Value) {
        self.outputs.insert(node.clone(), output);
        *self.visits.entry(node.clone()).or_insert(0) += 1;
        self.written.insert(node.clone());
    }

    /// How many times a node has committed output for this record.
    pub fn visits(&self, node: &NodeId) -> u32 {
        self.visits.get(node).copied().unwrap_or(0)
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    pub(crate) fn add_hop(&mut self) -> u32 {
        self.hops += 1;
        self.hops
    }

    pub fn active(&self) -> &[NodeId] {
        &self.active
    }

    pub(crate) fn set_active(&mut self, nodes: Vec<NodeId>) {
        self.active = nodes;
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub(crate) fn record(&mut self, node: &NodeId, status: NodeStatus, error: Option<String>) {
        self.trace.push(TraceEntry {
            node_id: node.clone(),
            status,
            timestamp: Utc::now(),
            error,
        });
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// Move to `status`. Terminal states are final; later transitions are ignored.
    pub(crate) fn transition(&mut self, status: RecordStatus) -> bool {
        if self.status.is_terminal() {
            tracing::debug!(
                "Ignoring transition {:?} -> {:?} for record {}",
                self.status,
                status,
                self.record_id
            );
            return false;
        }
        self.status = status;
        true
    }

    /// Copy of the context for one parallel branch.
    pub(crate) fn branch(&self) -> Self {
        let mut branch = self.clone();
        branch.written.clear();
        branch.trace_base = branch.trace.len();
        branch.hops_base = branch.hops;
        branch
    }

    /// Node ids this context wrote since it was branched.
    pub(crate) fn written(&self) -> &HashSet<NodeId> {
        &self.written
    }

    /// Fold a finished branch back in: its trace always, its outputs only when `keep_outputs`.
    pub(crate) fn merge_branch(&mut self, branch: RecordContext, keep_outputs: bool) {
        self.trace.extend(branch.trace.into_iter().skip(branch.trace_base));
        self.hops += branch.hops.saturating_sub(branch.hops_base);
        if !keep_outputs {
            return;
        }
        let RecordContext {
            mut outputs,
            visits,
            written,
            ..
        } = branch;
        for node in written {
            if let Some(value) = outputs.remove(&node) {
                self.outputs.insert(node.clone(), value);
            }
            if let Some(count) = visits.get(&node) {
                self.visits.insert(node.clone(), *count);
            }
            self.written.insert(node);
        }
    }

    /// Resolve a dotted path against node outputs and the source payload.
    ///
    /// The first segment names a node id, `source`, or a top-level source field.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;

        let base = if root == SOURCE_ROOT {
            match segments.next() {
                Some(field) => self.source.get(field)?,
                None => return None,
            }
        } else if let Some(output) = self.outputs.get(&NodeId::new(root)) {
            output
        } else {
            self.source.get(root)?
        };

        descend(base, segments)
    }

    /// Read-only view for templates and conditions.
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            ctx: self,
            locals: None,
        }
    }
}

/// Read-only view over a record, optionally layered with node-local variables.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    ctx: &'a RecordContext,
    locals: Option<&'a Map<String, Value>>,
}

impl<'a> Scope<'a> {
    /// Layer `locals` over the record. Local names shadow node ids and source fields.
    pub fn with_locals(self, locals: &'a Map<String, Value>) -> Self {
        Self {
            ctx: self.ctx,
            locals: Some(locals),
        }
    }

    pub fn context(&self) -> &'a RecordContext {
        self.ctx
    }

    pub fn lookup(&self, path: &str) -> Option<&'a Value> {
        if let Some(locals) = self.locals {
            let mut segments = path.split('.');
            if let Some(value) = segments.next().and_then(|root| locals.get(root)) {
                return descend(value, segments);
            }
        }
        self.ctx.lookup(path)
    }
}

fn descend<'v, 's>(mut value: &'v Value, segments: impl Iterator<Item = &'s str>) -> Option<&'v Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}
