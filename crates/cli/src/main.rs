use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use synthflow_core::connectors::{DataSink, JsonlSink};
use synthflow_core::graph::DataDocument;
use synthflow_core::storage::{CheckpointManager, JsonlEventLog};
use synthflow_core::{EngineConfig, ExecutionEngine, GraphDocument, Registry};

mod backend;
mod config;

use backend::OpenAiBackend;
use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "synthflow")]
#[command(about = "Run a generation graph over a dataset", long_about = None)]
struct Args {
    /// Graph document (TOML, or JSON by extension)
    graph: PathBuf,

    /// Path to configuration file
    #[arg(short, long, default_value = "synthflow.toml")]
    config: PathBuf,

    /// Data directory for checkpoints and event logs
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Task identifier; checkpoints are keyed by it
    #[arg(short, long, env = "SYNTHFLOW_TASK_ID")]
    task_id: Option<String>,

    /// Source offset of the first record
    #[arg(long)]
    start_index: Option<u64>,

    /// Number of records to process
    #[arg(short = 'n', long)]
    record_count: Option<u64>,

    /// Records processed concurrently
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Committed records between checkpoints
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Continue from the task's last checkpoint
    #[arg(long)]
    resume: bool,

    /// Output JSONL file, overriding the graph's sink
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Command-line flags win over the configuration file
    fn apply(&self, engine: &mut EngineConfig) {
        if let Some(task_id) = &self.task_id {
            engine.task_id = task_id.clone();
        }
        if let Some(start_index) = self.start_index {
            engine.start_index = start_index;
        }
        if let Some(count) = self.record_count {
            engine.record_count = Some(count);
        }
        if let Some(batch_size) = self.batch_size {
            engine.batch_size = batch_size;
        }
        if let Some(interval) = self.checkpoint_interval {
            engine.checkpoint_interval = interval;
        }
        engine.resume |= self.resume;
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "synthflow=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_registry(config: &CliConfig) -> Result<Registry> {
    let mut registry = Registry::new();
    for (name, model) in &config.models {
        let backend = OpenAiBackend::new(name, model)
            .with_context(|| format!("Failed to create backend for model {}", name))?;
        registry.register_backend(name.clone(), Arc::new(backend), model.max_concurrent);
        tracing::info!("Registered model {} at {}", name, model.api_base);
    }
    Ok(registry)
}

async fn open_sink(
    args: &Args,
    data: &DataDocument,
    base_dir: &Path,
    resume: bool,
) -> Result<Box<dyn DataSink>> {
    if let Some(path) = &args.output {
        let sink = if resume {
            JsonlSink::append(path).await?
        } else {
            JsonlSink::create(path).await?
        };
        return Ok(Box::new(sink));
    }
    let sink = data
        .open_sink(base_dir, resume)
        .await?
        .context("No output: pass --output or declare a sink in the graph's data section")?;
    Ok(Box::new(sink))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = CliConfig::load(&args.config)?;
    args.apply(&mut config.engine);
    std::fs::create_dir_all(&args.data_dir).context("Failed to create data directory")?;

    let base_dir = args.graph.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut document = GraphDocument::from_path(&args.graph)?;
    let data = document
        .data
        .take()
        .context("Graph document has no data section")?;
    let graph = Arc::new(document.into_spec(&base_dir)?);
    tracing::info!(
        "Loaded graph {} ({} nodes, fingerprint {})",
        graph.name(),
        graph.node_count(),
        graph.fingerprint()
    );

    let resume = config.engine.resume;
    let source = data.open_source(&base_dir).await?;
    let sink = open_sink(&args, &data, &base_dir, resume).await?;
    let registry = build_registry(&config)?;

    let checkpoints = CheckpointManager::new(
        config.checkpoint_store(&args.data_dir)?,
        config.engine.task_id.clone(),
    );
    let mut engine = ExecutionEngine::new(graph, Arc::new(registry), source, sink, config.engine.clone())?
        .with_checkpoints(checkpoints);
    if let Some(path) = config.event_log_path(&args.data_dir) {
        let log = JsonlEventLog::new(path).context("Failed to create event log")?;
        engine = engine.with_event_log(Arc::new(log));
    }

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling in-flight records");
            cancel.cancel();
        }
    });

    let report = engine.run().await?;
    println!("{}", report);

    Ok(())
}
