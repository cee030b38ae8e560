use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::builder::{EdgeDef, GraphBuilder, SubgraphDef};
use super::node::{
    FunctionConfig, InvokeConfig, MultiInvokeConfig, NodeKind, NodeSpec, SamplerConfig,
};
use super::spec::GraphSpec;
use crate::connectors::{
    CompositeSource, DataSource, JsonlSink, JsonlSource, MemorySource, MergeMode,
};
use crate::engine::projector::OutputSpec;
use crate::error::ConfigError;

/// Nested subgraph files deeper than this are rejected (guards include cycles)
const MAX_NESTING: usize = 16;

fn default_name() -> String {
    "graph".to_string()
}

/// Serialized graph definition, loaded from TOML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default = "default_name")]
    pub name: String,
    /// Alternative to a `START -> node` edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Nodes that are terminal without an edge to END
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ends: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub edges: Vec<EdgeDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDocument {
    pub id: String,
    #[serde(flatten)]
    pub kind: KindDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindDocument {
    Invoke(InvokeConfig),
    MultiInvoke(MultiInvokeConfig),
    Function(FunctionConfig),
    Sampler(SamplerConfig),
    Subgraph(SubgraphDocument),
}

/// Subgraph node body: either an inline graph or a path to another document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Box<GraphDocument>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDocument {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub weight: i32,
}

/// Where records come from and where results go
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataDocument {
    #[serde(default)]
    pub sources: Vec<SourceDocument>,
    #[serde(default)]
    pub merge: MergeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// JSON Lines file, relative to the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Inline records, used when no path is given
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkDocument {
    pub path: PathBuf,
}

impl GraphDocument {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Document(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Document(e.to_string()))
    }

    /// Load a document, choosing the format from the file extension (`.json`, otherwise TOML).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Document(format!("{}: {}", path.display(), e)))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json(&text)
        } else {
            Self::from_toml(&text)
        };
        parsed.map_err(|e| match e {
            ConfigError::Document(reason) => {
                ConfigError::Document(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
    }

    /// Convert into a builder. Relative subgraph paths resolve against `base_dir`.
    pub fn into_builder(self, base_dir: &Path) -> Result<GraphBuilder, ConfigError> {
        self.convert(base_dir, 0)
    }

    pub fn into_spec(self, base_dir: &Path) -> Result<GraphSpec, ConfigError> {
        self.into_builder(base_dir)?.build()
    }

    fn convert(self, base_dir: &Path, depth: usize) -> Result<GraphBuilder, ConfigError> {
        if depth > MAX_NESTING {
            return Err(ConfigError::Document(format!(
                "subgraphs nested deeper than {} levels",
                MAX_NESTING
            )));
        }

        let mut builder = GraphBuilder::new(self.name);
        if let Some(start) = self.start {
            builder = builder.start(start);
        }
        for end in self.ends {
            builder = builder.end(end);
        }

        for node in self.nodes {
            let NodeDocument {
                id,
                kind,
                pre_process,
                post_process,
            } = node;

            let kind = match kind {
                KindDocument::Invoke(config) => NodeKind::Invoke(config),
                KindDocument::MultiInvoke(config) => NodeKind::MultiInvoke(config),
                KindDocument::Function(config) => NodeKind::Function(config),
                KindDocument::Sampler(config) => NodeKind::Sampler(config),
                KindDocument::Subgraph(sub) => {
                    let child = sub.load_child(&id, base_dir, depth)?;
                    let def = SubgraphDef {
                        graph: child,
                        inputs: sub.inputs,
                        outputs: sub.outputs,
                        overrides: sub.overrides,
                        pre_process,
                        post_process,
                    };
                    builder = builder.subgraph(id, def);
                    continue;
                }
            };

            let mut spec = NodeSpec::new(id, kind);
            spec.pre_process = pre_process;
            spec.post_process = post_process;
            builder = builder.node(spec);
        }

        for edge in self.edges {
            builder = builder.edge_def(EdgeDef {
                from: edge.from,
                to: edge.to,
                condition: edge.condition,
                predicate: edge.predicate,
                parallel: edge.parallel,
                weight: edge.weight,
            });
        }

        if let Some(output) = self.output {
            builder = builder.output(output);
        }

        Ok(builder)
    }
}

impl SubgraphDocument {
    fn load_child(&self, id: &str, base_dir: &Path, depth: usize) -> Result<GraphBuilder, ConfigError> {
        match (&self.graph, &self.path) {
            (Some(graph), None) => (**graph).clone().convert(base_dir, depth + 1),
            (None, Some(path)) => {
                let path = base_dir.join(path);
                let child_dir = path.parent().unwrap_or(base_dir).to_path_buf();
                GraphDocument::from_path(&path)?.convert(&child_dir, depth + 1)
            }
            _ => Err(ConfigError::Document(format!(
                "subgraph node '{}' needs exactly one of `graph` or `path`",
                id
            ))),
        }
    }
}

impl DataDocument {
    /// Open the declared sources as one stream.
    pub async fn open_source(&self, base_dir: &Path) -> anyhow::Result<Box<dyn DataSource>> {
        if self.sources.is_empty() {
            bail!("data section declares no sources");
        }

        let mut opened = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let reader: Box<dyn DataSource> = match &source.path {
                Some(path) => {
                    let path = base_dir.join(path);
                    Box::new(
                        JsonlSource::open(&path)
                            .await
                            .with_context(|| format!("Failed to open source {}", path.display()))?,
                    )
                }
                None => Box::new(MemorySource::new(source.records.clone())),
            };
            opened.push((source.alias.clone(), reader));
        }

        if opened.len() == 1 && opened[0].0.is_none() {
            if let Some((_, reader)) = opened.pop() {
                return Ok(reader);
            }
        }

        let mut composite = CompositeSource::new(self.merge);
        for (alias, reader) in opened {
            composite.add(alias, reader)?;
        }
        Ok(Box::new(composite))
    }

    /// Open the declared sink. `resume` keeps existing content for truncation to the checkpoint.
    pub async fn open_sink(&self, base_dir: &Path, resume: bool) -> anyhow::Result<Option<JsonlSink>> {
        let Some(sink) = &self.sink else {
            return Ok(None);
        };
        let path = base_dir.join(&sink.path);
        let sink = if resume {
            JsonlSink::append(&path).await?
        } else {
            JsonlSink::create(&path).await?
        };
        Ok(Some(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use tempfile::TempDir;

    const QA_GRAPH: &str = r#"
name = "qa"

[[nodes]]
id = "generate"
kind = "invoke"
model = "small"
prompt = [{ role = "system", content = "Be brief." }, { content = "Answer: {{question}}" }]
params = { temperature = 0.7 }

[[nodes]]
id = "critique"
kind = "invoke"
model = "small"
output = "json"
prompt = [{ content = "Score {{generate}}" }]

[[nodes]]
id = "style"
kind = "sampler"
seed = 7
choices = [{ value = "formal", weight = 3 }, { value = "casual" }]

[[edges]]
from = "START"
to = "style"

[[edges]]
from = "style"
to = "generate"

[[edges]]
from = "generate"
to = "critique"

[[edges]]
from = "critique"
to = "generate"
condition = "critique.score < 0.8"

[[edges]]
from = "critique"
to = "END"

[output]
fields = [{ name = "answer", from = "generate" }, { name = "question", from = "source.question" }]

[data]
sources = [{ records = [{ question = "why?" }] }]
"#;

    #[test]
    fn test_toml_document_builds_graph() {
        let doc = GraphDocument::from_toml(QA_GRAPH).unwrap();
        assert_eq!(doc.nodes.len(), 3);
        assert!(doc.data.is_some());

        let graph = doc.into_spec(Path::new(".")).unwrap();
        assert_eq!(graph.name(), "qa");
        assert_eq!(graph.start_node(), &NodeId::new("style"));
        assert!(graph.is_terminal(&NodeId::new("critique")));
        assert_eq!(graph.output_spec().unwrap().fields.len(), 2);

        let NodeKind::Sampler(sampler) = &graph.resolve(&NodeId::new("style")).unwrap().kind else {
            panic!("expected sampler");
        };
        assert_eq!(sampler.weights(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_json_document_matches_toml() {
        let doc = GraphDocument::from_toml(QA_GRAPH).unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let from_json = GraphDocument::from_json(&json).unwrap();

        let a = doc.into_spec(Path::new(".")).unwrap();
        let b = from_json.into_spec(Path::new(".")).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_subgraph_loaded_from_relative_path() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("parts")).unwrap();
        std::fs::write(
            temp_dir.path().join("parts").join("child.json"),
            r#"{"name": "child", "nodes": [{"id": "inner", "kind": "function", "function": "template", "params": {"x": "{{q}}"}}],
                "edges": [{"from": "START", "to": "inner"}, {"from": "inner", "to": "END"}]}"#,
        )
        .unwrap();
        std::fs::write(
            temp_dir.path().join("main.toml"),
            r#"
[[nodes]]
id = "nested"
kind = "subgraph"
path = "parts/child.json"
inputs = { q = "topic" }
outputs = { result = "inner.x" }

[[edges]]
from = "START"
to = "nested"

[[edges]]
from = "nested"
to = "END"
"#,
        )
        .unwrap();

        let doc = GraphDocument::from_path(temp_dir.path().join("main.toml")).unwrap();
        let graph = doc.into_spec(temp_dir.path()).unwrap();
        let NodeKind::Subgraph(config) = &graph.resolve(&NodeId::new("nested")).unwrap().kind else {
            panic!("expected subgraph");
        };
        assert_eq!(config.graph.name(), "child");
        assert_eq!(config.outputs["result"], "inner.x");
    }

    #[test]
    fn test_subgraph_needs_graph_or_path() {
        let err = GraphDocument::from_toml(
            r#"
[[nodes]]
id = "nested"
kind = "subgraph"

[[edges]]
from = "START"
to = "nested"
"#,
        )
        .unwrap()
        .into_spec(Path::new("."))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Document(_)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = GraphDocument::from_toml("[[nodes]]\nid = \"a\"\nkind = \"teleport\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Document(_)));
    }

    #[tokio::test]
    async fn test_data_section_opens_inline_source() {
        let doc = GraphDocument::from_toml(QA_GRAPH).unwrap();
        let source = doc.data.unwrap().open_source(Path::new(".")).await.unwrap();
        assert_eq!(source.len().await.unwrap(), 1);
        let records = source.fetch_range(0, 1).await.unwrap();
        assert_eq!(records[0].payload["question"], "why?");
    }
}
