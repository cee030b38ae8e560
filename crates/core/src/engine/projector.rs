use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::context::{RecordContext, SOURCE_ROOT};
use crate::error::{ConfigError, RecordError};
use crate::graph::GraphSpec;
use crate::types::{NodeId, OutputRecord, RecordFailure};

/// One key of the output record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    /// Output key; ignored when `flatten` spreads an object
    pub name: String,
    /// Dotted path rooted at a node id or `source`
    pub from: String,
    /// Spread the keys of an object value into the output instead of nesting it
    #[serde(default)]
    pub flatten: bool,
}

impl OutputField {
    pub fn new(name: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            flatten: false,
        }
    }
}

/// Declared shape of output records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Start from the source payload before adding fields
    #[serde(default)]
    pub include_source: bool,
    #[serde(default)]
    pub fields: Vec<OutputField>,
}

impl OutputSpec {
    pub fn field(mut self, name: impl Into<String>, from: impl Into<String>) -> Self {
        self.fields.push(OutputField::new(name, from));
        self
    }

    /// Every path must be rooted at a node of `graph` or at `source`.
    pub fn validate(&self, graph: &GraphSpec) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for field in &self.fields {
            let invalid = |reason: String| ConfigError::InvalidOutput {
                field: field.name.clone(),
                reason,
            };

            let root = field.from.split('.').next().unwrap_or_default();
            if root.is_empty() || field.from.split('.').any(str::is_empty) {
                return Err(invalid(format!("malformed path '{}'", field.from)));
            }
            if root != SOURCE_ROOT && !graph.contains(&NodeId::new(root)) {
                return Err(invalid(format!(
                    "'{}' is neither a node of the graph nor '{}'",
                    root, SOURCE_ROOT
                )));
            }
            if !field.flatten {
                if field.name.is_empty() {
                    return Err(invalid("empty output key".to_string()));
                }
                if !names.insert(field.name.as_str()) {
                    return Err(invalid("duplicate output key".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Maps a finished record context to the record written to the sink
pub struct OutputProjector;

impl OutputProjector {
    /// Pure projection; `failure` is attached for failed or cancelled records.
    pub fn project(
        ctx: &RecordContext,
        spec: Option<&OutputSpec>,
        failure: Option<&RecordError>,
    ) -> OutputRecord {
        let data = match spec {
            Some(spec) => Self::declared(ctx, spec),
            None => Self::default_projection(ctx),
        };

        OutputRecord {
            record_id: ctx.record_id().clone(),
            index: ctx.index(),
            status: ctx.status(),
            data,
            error: failure.map(|err| RecordFailure {
                class: err.class(),
                message: err.to_string(),
                node_id: err.node().cloned(),
            }),
        }
    }

    fn declared(ctx: &RecordContext, spec: &OutputSpec) -> Map<String, Value> {
        let mut data = if spec.include_source {
            ctx.source().clone()
        } else {
            Map::new()
        };

        for field in &spec.fields {
            // Paths off the taken route project as null
            let value = ctx.lookup(&field.from).cloned().unwrap_or(Value::Null);
            match (field.flatten, value) {
                (true, Value::Object(map)) => data.extend(map),
                (_, value) => {
                    data.insert(field.name.clone(), value);
                }
            }
        }
        data
    }

    fn default_projection(ctx: &RecordContext) -> Map<String, Value> {
        let mut data = ctx.source().clone();
        for (node, value) in ctx.outputs() {
            data.insert(node.to_string(), value.clone());
        }
        data
    }
}
