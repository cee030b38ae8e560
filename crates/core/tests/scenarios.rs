mod common;

use common::{fast_retry, last_message, ScriptedBackend};
use serde_json::json;
use std::sync::Arc;
use synthflow_core::connectors::{MemorySink, MemorySource};
use synthflow_core::graph::{
    InvokeConfig, OutputFormat, PromptMessage, SamplerConfig, SubgraphDef, WeightedChoice,
};
use synthflow_core::{
    BackendError, EngineConfig, ExecutionEngine, FailureClass, GraphBuilder, GraphSpec,
    InferenceResponse, OutputRecord, OutputSpec, RecordStatus, Registry, END, START,
};

async fn run(
    graph: GraphSpec,
    registry: Registry,
    source: MemorySource,
    config: EngineConfig,
) -> (synthflow_core::RunReport, Vec<OutputRecord>) {
    let sink = MemorySink::new();
    let mut engine = ExecutionEngine::new(
        Arc::new(graph),
        Arc::new(registry),
        Box::new(source),
        Box::new(sink.clone()),
        config,
    )
    .unwrap();
    let report = engine.run().await.unwrap();
    (report, sink.records().await)
}

fn prompt(text: &str) -> Vec<PromptMessage> {
    vec![PromptMessage::user(text)]
}

#[tokio::test]
async fn test_linear_pipeline() {
    let writer = Arc::new(ScriptedBackend::new(|prompt, _| {
        Ok(InferenceResponse::text(format!("story about {}", last_message(prompt))))
    }));
    let mut registry = Registry::new();
    registry.register_backend("writer", writer.clone(), 4);

    let graph = GraphBuilder::new("linear")
        .invoke("generate", InvokeConfig::new("writer", prompt("{{topic}}")))
        .edge(START, "generate")
        .edge("generate", END)
        .output(OutputSpec::default().field("topic", "source.topic").field("text", "generate"))
        .build()
        .unwrap();
    let source = MemorySource::from_values(vec![
        json!({"topic": "rust"}),
        json!({"topic": "go"}),
        json!({"topic": "zig"}),
    ]);

    let (report, records) = run(graph, registry, source, EngineConfig::new("linear")).await;

    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(records.len(), 3);
    for (record, topic) in records.iter().zip(["rust", "go", "zig"]) {
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.data["text"], json!(format!("story about {}", topic)));
        assert_eq!(record.data.len(), 2);
    }
    assert_eq!(writer.calls(), 3);
}

#[tokio::test]
async fn test_conditional_loop_revisits_draft() {
    let writer = Arc::new(ScriptedBackend::new(|_, call| {
        Ok(InferenceResponse::text(format!("draft {}", call)))
    }));
    let critic = Arc::new(ScriptedBackend::new(|_, call| {
        let score = if call == 1 { 0.4 } else { 0.9 };
        Ok(InferenceResponse::text(json!({"score": score}).to_string()))
    }));
    let mut registry = Registry::new();
    registry.register_backend("writer", writer.clone(), 1);
    registry.register_backend("critic", critic.clone(), 1);

    let mut critique = InvokeConfig::new("critic", prompt("Rate: {{draft}}"));
    critique.output = OutputFormat::Json;
    let graph = GraphBuilder::new("refine")
        .invoke("draft", InvokeConfig::new("writer", prompt("Write about {{topic}}")))
        .invoke("critique", critique)
        .edge(START, "draft")
        .edge("draft", "critique")
        .edge_when("critique", "draft", "critique.score < 0.8")
        .edge("critique", END)
        .output(OutputSpec::default().field("final", "draft").field("score", "critique.score"))
        .build()
        .unwrap();
    let source = MemorySource::from_values(vec![json!({"topic": "rust"})]);

    let (report, records) = run(graph, registry, source, EngineConfig::new("loop")).await;

    assert_eq!(report.completed, 1);
    assert_eq!(writer.calls(), 2);
    assert_eq!(critic.calls(), 2);
    assert_eq!(records[0].data["final"], json!("draft 2"));
    assert_eq!(records[0].data["score"], json!(0.9));
}

async fn run_flaky(max_attempts: u32) -> (synthflow_core::RunReport, OutputRecord, u32) {
    let backend = Arc::new(ScriptedBackend::new(|prompt, call| {
        if call <= 2 {
            Err(BackendError::Transient("503 service unavailable".to_string()))
        } else {
            Ok(InferenceResponse::text(last_message(prompt)))
        }
    }));
    let mut registry = Registry::new();
    registry.register_backend("flaky", backend.clone(), 1);

    let graph = GraphBuilder::new("retry")
        .invoke("generate", InvokeConfig::new("flaky", prompt("{{topic}}")))
        .edge(START, "generate")
        .edge("generate", END)
        .build()
        .unwrap();
    let config = EngineConfig {
        retry: fast_retry(max_attempts),
        ..EngineConfig::new("retry")
    };
    let source = MemorySource::from_values(vec![json!({"topic": "rust"})]);

    let (report, mut records) = run(graph, registry, source, config).await;
    (report, records.remove(0), backend.calls())
}

#[tokio::test]
async fn test_transient_failure_recovers_within_budget() {
    let (report, record, calls) = run_flaky(3).await;
    assert_eq!(report.completed, 1);
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.data["generate"], json!("rust"));
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn test_transient_failure_exhausts_budget() {
    let (report, record, calls) = run_flaky(2).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[&FailureClass::TransientBackendError], 1);
    assert_eq!(record.status, RecordStatus::Failed);
    let failure = record.error.unwrap();
    assert_eq!(failure.class, FailureClass::TransientBackendError);
    assert_eq!(failure.node_id.unwrap().as_str(), "generate");
    assert_eq!(calls, 2);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let backend = Arc::new(ScriptedBackend::new(|_, _| {
        Err(BackendError::Permanent("400 bad request".to_string()))
    }));
    let mut registry = Registry::new();
    registry.register_backend("strict", backend.clone(), 1);
    let graph = GraphBuilder::new("strict")
        .invoke("generate", InvokeConfig::new("strict", prompt("{{topic}}")))
        .edge(START, "generate")
        .edge("generate", END)
        .build()
        .unwrap();
    let source = MemorySource::from_values(vec![json!({"topic": "a"}), json!({"topic": "b"})]);

    let (report, records) = run(graph, registry, source, EngineConfig::new("strict")).await;

    assert_eq!(report.failed, 2);
    assert_eq!(backend.calls(), 2);
    assert!(records
        .iter()
        .all(|r| r.error.as_ref().unwrap().class == FailureClass::PermanentBackendError));
}

#[tokio::test]
async fn test_subgraph_state_is_isolated() {
    let writer = Arc::new(ScriptedBackend::echo());
    let mut registry = Registry::new();
    registry.register_backend("writer", writer, 4);

    // The child reuses the parent's node id "generate"
    let child = GraphBuilder::new("summarize")
        .invoke("generate", InvokeConfig::new("writer", prompt("Summarize {{text}}")))
        .function("shape", "template", json!({"summary": "{{generate}}", "scratch": "internal"}))
        .edge(START, "generate")
        .edge("generate", "shape")
        .edge("shape", END);
    let graph = GraphBuilder::new("parent")
        .invoke("generate", InvokeConfig::new("writer", prompt("{{topic}}")))
        .subgraph(
            "summarize",
            SubgraphDef::new(child)
                .input("text", "generate")
                .output("summary", "shape.summary"),
        )
        .edge(START, "generate")
        .edge("generate", "summarize")
        .edge("summarize", END)
        .build()
        .unwrap();
    let source = MemorySource::from_values(vec![json!({"topic": "rust"})]);

    let (_, records) = run(graph, registry, source, EngineConfig::new("nested")).await;

    let data = &records[0].data;
    assert_eq!(data["generate"], json!("rust"));
    assert_eq!(data["summarize"], json!({"summary": "Summarize rust"}));
    assert!(!data.contains_key("shape"));
}

#[tokio::test]
async fn test_failed_subgraph_fails_parent_node() {
    let mut registry = Registry::new();
    registry.register_backend(
        "broken",
        Arc::new(ScriptedBackend::new(|_, _| Err(BackendError::Permanent("401".to_string())))),
        1,
    );
    let child = GraphBuilder::new("child")
        .invoke("inner", InvokeConfig::new("broken", prompt("hi")))
        .edge(START, "inner")
        .edge("inner", END);
    let graph = GraphBuilder::new("parent")
        .subgraph("nested", SubgraphDef::new(child))
        .edge(START, "nested")
        .edge("nested", END)
        .build()
        .unwrap();
    let source = MemorySource::from_values(vec![json!({"topic": "rust"})]);

    let (report, records) = run(graph, registry, source, EngineConfig::new("nested")).await;

    assert_eq!(report.failures[&FailureClass::SubgraphError], 1);
    let failure = records[0].error.as_ref().unwrap();
    assert_eq!(failure.node_id.as_ref().unwrap().as_str(), "nested");
}

#[tokio::test]
async fn test_routing_is_deterministic_across_runs() {
    let build = || {
        GraphBuilder::new("personas")
            .sampler(
                "persona",
                SamplerConfig {
                    choices: vec![
                        WeightedChoice { value: json!("formal"), weight: 1.0 },
                        WeightedChoice { value: json!("casual"), weight: 1.0 },
                    ],
                    seed: Some(7),
                    count: None,
                },
            )
            .function("formal", "template", json!("Dear {{topic}}"))
            .function("casual", "template", json!("hey {{topic}}"))
            .edge(START, "persona")
            .edge_when("persona", "formal", "persona == formal")
            .edge("persona", "casual")
            .edge("formal", END)
            .edge("casual", END)
            .build()
            .unwrap()
    };
    let source = || {
        MemorySource::from_values((0..20).map(|i| json!({"id": format!("r{}", i), "topic": i})))
    };
    let config = EngineConfig {
        batch_size: 5,
        ..EngineConfig::new("determinism")
    };

    let (_, first) = run(build(), Registry::new(), source(), config.clone()).await;
    let (_, second) = run(build(), Registry::new(), source(), config).await;

    assert_eq!(first.len(), 20);
    assert_eq!(first, second);
    for record in &first {
        let routed_formal = record.data.contains_key("formal");
        assert_eq!(routed_formal, record.data["persona"] == json!("formal"));
        assert_ne!(routed_formal, record.data.contains_key("casual"));
    }
}
