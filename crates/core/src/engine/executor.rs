use chrono::Utc;
use serde_json::Map;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::RecordContext;
use super::node_executor::NodeExecutor;
use super::projector::OutputProjector;
use super::traversal::Traversal;
use crate::config::EngineConfig;
use crate::connectors::{DataSink, DataSource};
use crate::error::{EngineResult, FailureClass, RecordError};
use crate::events::{EventEmitter, EventLog, EventType};
use crate::graph::GraphSpec;
use crate::registry::Registry;
use crate::report::RunReport;
use crate::storage::{CheckpointManager, Progress};
use crate::types::{OutputRecord, RecordFailure, RecordId, RecordStatus, RunId, SourceRecord};

/// Runs every record of a source through a graph and writes the results to a sink.
///
/// Records are processed concurrently (up to `batch_size` at a time) but
/// committed in source order: the sink and the checkpoint only ever advance
/// over a contiguous prefix of finished records.
pub struct ExecutionEngine {
    run_id: RunId,
    graph: Arc<GraphSpec>,
    registry: Arc<Registry>,
    source: Box<dyn DataSource>,
    sink: Box<dyn DataSink>,
    config: EngineConfig,
    checkpoints: Option<CheckpointManager>,
    event_log: Option<Arc<dyn EventLog>>,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    /// Fails with a configuration error before any record is touched.
    pub fn new(
        graph: Arc<GraphSpec>,
        registry: Arc<Registry>,
        source: Box<dyn DataSource>,
        sink: Box<dyn DataSink>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        registry.validate(&graph)?;

        Ok(Self {
            run_id: RunId::new(),
            graph,
            registry,
            source,
            sink,
            config,
            checkpoints: None,
            event_log: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancelling this token stops dispatch and cancels every in-flight record.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn traversal(&self, events: EventEmitter) -> Traversal {
        let executor = NodeExecutor::new(
            self.registry.clone(),
            self.config.retry.clone(),
            self.config.max_hops,
            self.config.branch_concurrency,
            events,
        );
        Traversal::new(self.graph.clone(), Arc::new(executor))
    }

    /// Process a single record outside the batch loop. Nothing is written to the sink.
    pub async fn run_record(&self, record: SourceRecord) -> OutputRecord {
        let events = EventEmitter::new(self.run_id, self.event_log.clone());
        process_record(self.traversal(events), record, self.cancel.child_token()).await
    }

    pub async fn run(&mut self) -> EngineResult<RunReport> {
        let started_at = Utc::now();
        let events = EventEmitter::new(self.run_id, self.event_log.clone());
        let traversal = self.traversal(events.clone());
        let fingerprint = self.graph.fingerprint().to_string();
        let task_id = self.config.task_id.clone();

        let mut progress = Progress {
            source_cursor: self.config.start_index,
            ..Progress::default()
        };
        let mut resumed = false;
        let mut skipped = 0;

        if self.config.resume {
            match &self.checkpoints {
                Some(manager) => {
                    match manager.restore(&fingerprint).await? {
                        Some(state) => {
                            self.sink.resume_at(state.sink_cursor).await?;
                            skipped = state.source_cursor.saturating_sub(self.config.start_index);
                            progress = Progress::from_checkpoint(&state);
                            progress.source_cursor = state.source_cursor.max(self.config.start_index);
                            resumed = true;
                        }
                        // Nothing was committed; drop whatever an interrupted run left behind
                        None => self.sink.resume_at(0).await?,
                    }
                }
                None => warn!(
                    "Resume requested for task {} but no checkpoint store is configured",
                    task_id
                ),
            }
        }

        let available = self.source.len().await?;
        let mut end = match self.config.record_count {
            Some(count) => available.min(self.config.start_index.saturating_add(count)),
            None => available,
        };

        info!(
            "Starting run {} for task {}: graph {} ({}), records {}..{}",
            self.run_id,
            task_id,
            self.graph.name(),
            &fingerprint[..12.min(fingerprint.len())],
            progress.source_cursor,
            end
        );
        events
            .emit(EventType::RunStarted {
                task_id: task_id.clone(),
                graph: self.graph.name().to_string(),
                fingerprint: fingerprint.clone(),
                start_index: progress.source_cursor,
                resumed,
            })
            .await;

        let batch_size = self.config.batch_size;
        let mut tasks: JoinSet<(u64, OutputRecord)> = JoinSet::new();
        // Offsets dispatched but not yet committed
        let mut uncommitted: BTreeMap<u64, RecordId> = BTreeMap::new();
        let mut finished: BTreeMap<u64, OutputRecord> = BTreeMap::new();
        let mut pending: Vec<OutputRecord> = Vec::new();
        let mut next_offset = progress.source_cursor;
        let mut since_checkpoint = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut failures: BTreeMap<FailureClass, u64> = BTreeMap::new();
        let mut blocked = false;
        let mut cancel_reported = false;

        loop {
            if !self.cancel.is_cancelled() && next_offset < end && tasks.len() < batch_size {
                let want = ((batch_size - tasks.len()) as u64).min(end - next_offset);
                let records = self.source.fetch_range(next_offset, want as usize).await?;
                if records.is_empty() {
                    warn!("Source ended at offset {} (expected {})", next_offset, end);
                    end = next_offset;
                }
                for record in records {
                    let offset = next_offset;
                    next_offset += 1;
                    uncommitted.insert(offset, record.id.clone());
                    spawn_record(&mut tasks, &traversal, offset, record, self.cancel.child_token());
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((offset, output)) => {
                    finished.insert(offset, output);
                }
                Err(e) => {
                    error!("Record task for run {} was lost: {}", self.run_id, e);
                    continue;
                }
            }

            // Advance over the contiguous prefix; a cancelled record holds the cursor
            while !blocked {
                let Some(entry) = finished.first_entry() else {
                    break;
                };
                if *entry.key() != progress.source_cursor {
                    break;
                }
                if entry.get().status == RecordStatus::Cancelled {
                    blocked = true;
                    break;
                }
                let output = entry.remove();
                uncommitted.remove(&progress.source_cursor);
                progress.source_cursor += 1;
                match &output.error {
                    None => {
                        completed += 1;
                        progress.completed += 1;
                    }
                    Some(failure) => {
                        failed += 1;
                        progress.failed += 1;
                        *failures.entry(failure.class).or_insert(0) += 1;
                        *progress.failures.entry(failure.class).or_insert(0) += 1;
                    }
                }
                pending.push(output);
                since_checkpoint += 1;
            }

            if since_checkpoint >= self.config.checkpoint_interval {
                self.commit(&mut pending, &mut progress, &uncommitted, &events).await?;
                since_checkpoint = 0;
            }

            if self.cancel.is_cancelled() && !cancel_reported {
                cancel_reported = true;
                info!(
                    "Run {} cancelled, waiting for {} in-flight record(s)",
                    self.run_id,
                    tasks.len()
                );
                events
                    .emit(EventType::RunCancelled {
                        reason: "cancellation requested".to_string(),
                    })
                    .await;
            }
        }

        let cancelled = uncommitted.len() as u64;
        progress.cancelled += cancelled;
        self.commit(&mut pending, &mut progress, &uncommitted, &events).await?;

        let finished_at = Utc::now();
        let report = RunReport {
            run_id: self.run_id,
            task_id,
            graph: self.graph.name().to_string(),
            resumed,
            skipped,
            completed,
            failed,
            cancelled,
            failures,
            source_cursor: progress.source_cursor,
            started_at,
            finished_at,
        };

        events
            .emit(EventType::RunCompleted {
                completed,
                failed,
                cancelled,
                skipped,
                duration_secs: report.duration_secs().max(0) as u64,
            })
            .await;
        events.flush().await;

        info!(
            "Run {} finished: {} completed, {} failed, {} cancelled, {} skipped",
            self.run_id, completed, failed, cancelled, skipped
        );
        Ok(report)
    }

    /// Write pending outputs, then record the new cursor. Never the other way round.
    async fn commit(
        &mut self,
        pending: &mut Vec<OutputRecord>,
        progress: &mut Progress,
        uncommitted: &BTreeMap<u64, RecordId>,
        events: &EventEmitter,
    ) -> EngineResult<()> {
        if !pending.is_empty() {
            self.sink.write_batch(pending.as_slice()).await?;
            progress.sink_cursor += pending.len() as u64;
            debug!("Wrote {} record(s), sink cursor {}", pending.len(), progress.sink_cursor);
            pending.clear();
        }

        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        progress.in_flight = uncommitted.values().cloned().collect();
        manager
            .snapshot(self.run_id, self.graph.fingerprint(), progress)
            .await?;
        events
            .emit(EventType::CheckpointWritten {
                source_cursor: progress.source_cursor,
                sink_cursor: progress.sink_cursor,
                completed: progress.completed,
            })
            .await;
        Ok(())
    }
}

fn spawn_record(
    tasks: &mut JoinSet<(u64, OutputRecord)>,
    traversal: &Traversal,
    offset: u64,
    record: SourceRecord,
    cancel: CancellationToken,
) {
    let traversal = traversal.clone();
    tasks.spawn(async move {
        let record_id = record.id.clone();
        let index = record.index;
        // A panic inside one record becomes a failed record, not a lost one
        let output = match tokio::spawn(process_record(traversal, record, cancel)).await {
            Ok(output) => output,
            Err(e) => {
                error!("Record {} panicked: {}", record_id, e);
                OutputRecord {
                    record_id,
                    index,
                    status: RecordStatus::Failed,
                    data: Map::new(),
                    error: Some(RecordFailure {
                        class: FailureClass::Internal,
                        message: e.to_string(),
                        node_id: None,
                    }),
                }
            }
        };
        (offset, output)
    });
}

async fn process_record(
    traversal: Traversal,
    record: SourceRecord,
    cancel: CancellationToken,
) -> OutputRecord {
    let events = traversal.executor().events().clone();
    let record_id = record.id.clone();
    let index = record.index;

    events
        .emit(EventType::RecordStarted {
            record_id: record_id.clone(),
            index,
        })
        .await;

    let outcome = traversal.run(RecordContext::new(&record), cancel).await;
    let output = OutputProjector::project(
        &outcome.ctx,
        traversal.graph().output_spec(),
        outcome.result.as_ref().err(),
    );

    match &outcome.result {
        Ok(()) => {
            debug!("Record {} completed after {} hop(s)", record_id, outcome.ctx.hops());
            events
                .emit(EventType::RecordCompleted {
                    record_id,
                    index,
                    hops: outcome.ctx.hops(),
                })
                .await;
        }
        Err(RecordError::Cancelled) => {
            debug!("Record {} cancelled", record_id);
            events.emit(EventType::RecordCancelled { record_id, index }).await;
        }
        Err(err) => {
            error!("Record {} failed ({}): {}", record_id, err.class(), err);
            events
                .emit(EventType::RecordFailed {
                    record_id,
                    index,
                    class: err.class(),
                    error: err.to_string(),
                })
                .await;
        }
    }
    output
}
