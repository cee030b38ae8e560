use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use synthflow_core::connectors::{JsonlSink, JsonlSource};
use synthflow_core::events::EventType;
use synthflow_core::graph::{InvokeConfig, PromptMessage};
use synthflow_core::storage::{CheckpointManager, FileCheckpointStore, MemoryEventLog};
use synthflow_core::{
    BackendError, EngineConfig, EngineError, ExecutionEngine, GraphBuilder, GraphSpec,
    InferenceBackend, InferenceResponse, OutputRecord, RecordStatus, RenderedPrompt, Registry,
    RunReport, END, START,
};
use tempfile::TempDir;

fn graph(greeting: &str) -> GraphSpec {
    GraphBuilder::new("greet")
        .function("shape", "template", json!(format!("{} {{{{name}}}}", greeting)))
        .edge(START, "shape")
        .edge("shape", END)
        .build()
        .unwrap()
}

fn write_source(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("input.jsonl");
    let lines: Vec<String> = (0..10)
        .map(|i| json!({"id": format!("rec-{}", i), "name": format!("user{}", i)}).to_string())
        .collect();
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

async fn run(dir: &Path, graph: GraphSpec, config: EngineConfig) -> Result<RunReport, EngineError> {
    let mut engine = open_engine(dir, graph, Registry::new(), config).await?;
    engine.run().await
}

async fn open_engine(
    dir: &Path,
    graph: GraphSpec,
    registry: Registry,
    config: EngineConfig,
) -> Result<ExecutionEngine, EngineError> {
    let source = JsonlSource::open(dir.join("input.jsonl")).await.unwrap();
    let output = dir.join("output.jsonl");
    let sink = if config.resume {
        JsonlSink::append(&output).await.unwrap()
    } else {
        JsonlSink::create(&output).await.unwrap()
    };
    let store = Arc::new(FileCheckpointStore::new(dir.join("checkpoints")).unwrap());
    let checkpoints = CheckpointManager::new(store, config.task_id.clone());

    Ok(ExecutionEngine::new(
        Arc::new(graph),
        Arc::new(registry),
        Box::new(source),
        Box::new(sink),
        config,
    )?
    .with_checkpoints(checkpoints))
}

/// Answers `userN` prompts at once below `slow_from`, otherwise stalls until cancelled
struct GatedBackend {
    slow_from: u64,
}

#[async_trait]
impl InferenceBackend for GatedBackend {
    async fn invoke(
        &self,
        prompt: &RenderedPrompt,
        _params: &Map<String, Value>,
    ) -> Result<InferenceResponse, BackendError> {
        let text = prompt.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let n: u64 = text.trim_start_matches("user").parse().unwrap_or(0);
        if n >= self.slow_from {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(InferenceResponse::text(format!("reply to {}", text)))
    }
}

fn gated_graph() -> GraphSpec {
    GraphBuilder::new("gated")
        .invoke("reply", InvokeConfig::new("gated", vec![PromptMessage::user("{{name}}")]))
        .edge(START, "reply")
        .edge("reply", END)
        .build()
        .unwrap()
}

fn gated_registry(slow_from: u64) -> Registry {
    let mut registry = Registry::new();
    registry.register_backend("gated", Arc::new(GatedBackend { slow_from }), 16);
    registry
}

fn read_output(dir: &Path) -> Vec<OutputRecord> {
    std::fs::read_to_string(dir.join("output.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_resume_continues_after_last_checkpoint() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path());

    let first = EngineConfig {
        record_count: Some(4),
        batch_size: 3,
        checkpoint_interval: 2,
        ..EngineConfig::new("nightly")
    };
    let report = run(dir.path(), graph("hello"), first).await.unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(report.source_cursor, 4);

    // A crash between the sink write and the checkpoint leaves an extra line behind
    let output = dir.path().join("output.jsonl");
    let mut content = std::fs::read_to_string(&output).unwrap();
    content.push_str("{\"partial\": tru\n");
    std::fs::write(&output, content).unwrap();

    let second = EngineConfig {
        resume: true,
        ..EngineConfig::new("nightly")
    };
    let report = run(dir.path(), graph("hello"), second).await.unwrap();
    assert!(report.resumed);
    assert_eq!(report.skipped, 4);
    assert_eq!(report.completed, 6);
    assert_eq!(report.source_cursor, 10);

    let records = read_output(dir.path());
    let indices: Vec<u64> = records.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.status == RecordStatus::Completed));
    assert_eq!(records[7].data["shape"], json!("hello user7"));
}

#[tokio::test]
async fn test_resume_without_checkpoint_starts_fresh() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path());
    std::fs::write(dir.path().join("output.jsonl"), "stale\n").unwrap();

    let config = EngineConfig {
        resume: true,
        record_count: Some(3),
        ..EngineConfig::new("fresh")
    };
    let report = run(dir.path(), graph("hi"), config).await.unwrap();

    assert!(!report.resumed);
    assert_eq!(report.skipped, 0);
    let indices: Vec<u64> = read_output(dir.path()).iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_changed_graph_refuses_checkpoint() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path());

    let first = EngineConfig {
        record_count: Some(2),
        ..EngineConfig::new("nightly")
    };
    run(dir.path(), graph("hello"), first).await.unwrap();

    let second = EngineConfig {
        resume: true,
        ..EngineConfig::new("nightly")
    };
    let err = run(dir.path(), graph("goodbye"), second).await.unwrap_err();
    assert!(matches!(err, EngineError::CheckpointMismatch { ref task_id, .. } if task_id == "nightly"));
}

#[tokio::test]
async fn test_resume_after_cancel_with_records_in_flight() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path());

    // Records 0..4 answer at once; everything after stalls until the run is cancelled
    let first = EngineConfig {
        batch_size: 6,
        checkpoint_interval: 2,
        ..EngineConfig::new("interrupted")
    };
    let log = Arc::new(MemoryEventLog::new());
    let mut engine = open_engine(dir.path(), gated_graph(), gated_registry(4), first)
        .await
        .unwrap()
        .with_event_log(log.clone());

    let token = engine.cancellation_token();
    let watched = log.clone();
    let watcher = tokio::spawn(async move {
        loop {
            let events = watched.events().await;
            let checkpointed = events
                .iter()
                .any(|event| matches!(event.event_type, EventType::CheckpointWritten { .. }));
            let done = events
                .iter()
                .filter(|event| matches!(event.event_type, EventType::RecordCompleted { .. }))
                .count();
            if checkpointed && done >= 4 {
                token.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let report = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("cancellation should interrupt the stalled records")
        .unwrap();
    watcher.await.unwrap();

    assert_eq!(report.completed, 4);
    assert_eq!(report.source_cursor, 4);
    assert!(report.cancelled >= 2, "cancelled: {}", report.cancelled);
    let indices: Vec<u64> = read_output(dir.path()).iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    let second = EngineConfig {
        resume: true,
        ..EngineConfig::new("interrupted")
    };
    let mut engine = open_engine(dir.path(), gated_graph(), gated_registry(u64::MAX), second)
        .await
        .unwrap();
    let report = engine.run().await.unwrap();
    assert!(report.resumed);
    assert_eq!(report.skipped, 4);
    assert_eq!(report.completed, 6);

    let records = read_output(dir.path());
    let indices: Vec<u64> = records.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.status == RecordStatus::Completed));
    assert_eq!(records[6].data["reply"], json!("reply to user6"));
}
