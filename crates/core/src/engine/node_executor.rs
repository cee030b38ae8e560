use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::context::{RecordContext, Scope};
use super::traversal::Traversal;
use crate::backend::{InferenceBackend, RenderedPrompt};
use crate::error::{NodeError, RecordError};
use crate::events::{EventEmitter, EventType};
use crate::graph::{
    FunctionConfig, InvokeConfig, MultiInvokeConfig, NodeKind, NodeSpec, OutputFormat,
    SamplerConfig, SubgraphConfig,
};
use crate::registry::{strip_code_fence, Registry};
use crate::retry::RetryPolicy;
use crate::template::TemplateRenderer;
use crate::types::{NodeId, RecordId};

/// Runs one node against a record. Never mutates the record; the caller commits the output.
pub struct NodeExecutor {
    registry: Arc<Registry>,
    retry: RetryPolicy,
    max_hops: u32,
    branch_permits: Arc<Semaphore>,
    events: EventEmitter,
}

impl NodeExecutor {
    pub fn new(
        registry: Arc<Registry>,
        retry: RetryPolicy,
        max_hops: u32,
        branch_concurrency: usize,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry,
            retry,
            max_hops,
            branch_permits: Arc::new(Semaphore::new(branch_concurrency.max(1))),
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Wait for a slot in the shared branch pool
    pub(crate) async fn branch_permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, NodeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NodeError::Cancelled),
            permit = self.branch_permits.clone().acquire_owned() => {
                permit.map_err(|_| NodeError::Cancelled)
            }
        }
    }

    /// Execute `node` for the record in `ctx` and return its output value.
    pub async fn execute(
        self: &Arc<Self>,
        ctx: &RecordContext,
        node: &NodeSpec,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        let locals = match &node.pre_process {
            Some(name) => {
                let hook = self.registry.pre_process(name).ok_or_else(|| {
                    NodeError::Function(format!("pre_process hook '{}' is not registered", name))
                })?;
                hook(&ctx.scope())?
            }
            None => Map::new(),
        };

        let output = {
            let scope = ctx.scope().with_locals(&locals);
            match &node.kind {
                NodeKind::Invoke(config) => {
                    let text = self.call_backend(ctx.record_id(), &node.id, config, &scope, cancel).await?;
                    parse_output(config.output, text)?
                }
                NodeKind::MultiInvoke(config) => {
                    self.multi_invoke(ctx, &node.id, config, &locals, cancel).await?
                }
                NodeKind::Function(config) => self.function(config, &scope).await?,
                NodeKind::Sampler(config) => sample(ctx, &node.id, config)?,
                NodeKind::Subgraph(config) => {
                    self.subgraph(ctx, &node.id, config, &scope, cancel).await?
                }
            }
        };

        match &node.post_process {
            Some(name) => {
                let hook = self.registry.post_process(name).ok_or_else(|| {
                    NodeError::Function(format!("post_process hook '{}' is not registered", name))
                })?;
                hook(output, &ctx.scope().with_locals(&locals))
            }
            None => Ok(output),
        }
    }

    /// Render the prompt and call the backend under the retry policy.
    async fn call_backend(
        &self,
        record_id: &RecordId,
        node_id: &NodeId,
        config: &InvokeConfig,
        scope: &Scope<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, NodeError> {
        let backend = self.registry.backends().get(&config.model).ok_or_else(|| {
            NodeError::Permanent(format!("no backend registered for model '{}'", config.model))
        })?;
        let prompt = RenderedPrompt {
            model: config.model.clone(),
            messages: TemplateRenderer::render_messages(&config.prompt, scope)?,
        };

        let policy = self.retry.with_max_attempts(config.max_attempts);
        let timeout = config.timeout_secs.map(Duration::from_secs);
        let label = format!("node {} for record {}", node_id, record_id);
        let prompt = &prompt;
        let params = &config.params;
        let mut retries = Vec::new();

        let result = policy
            .run(
                &label,
                cancel,
                move |_attempt| {
                    let backend = backend.clone();
                    async move {
                        let call = backend.invoke(prompt, params);
                        let response = match timeout {
                            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                                NodeError::Transient(format!("timed out after {}s", limit.as_secs()))
                            })?,
                            None => call.await,
                        };
                        response.map_err(NodeError::from)
                    }
                },
                |attempt, err| retries.push((attempt, err.to_string())),
            )
            .await;

        for (attempt, error) in retries {
            self.events
                .emit(EventType::NodeFailed {
                    record_id: record_id.clone(),
                    node_id: node_id.clone(),
                    error,
                    attempt,
                    will_retry: true,
                })
                .await;
        }

        let response = result?;
        if let Some(tokens) = response.usage.completion_tokens {
            debug!("Node {} for record {} used {} completion tokens", node_id, record_id, tokens);
        }
        Ok(response.text)
    }

    /// Run the steps in order, feeding each output forward, optionally repeating the pass.
    async fn multi_invoke(
        &self,
        ctx: &RecordContext,
        node_id: &NodeId,
        config: &MultiInvokeConfig,
        base_locals: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        let max_iterations = config.repeat.as_ref().map_or(1, |repeat| repeat.max_iterations.max(1));
        let until = config.repeat.as_ref().and_then(|repeat| repeat.until.as_ref());

        let mut locals = base_locals.clone();
        let mut outputs = Map::new();
        let mut iterations = 0;

        for iteration in 1..=max_iterations {
            iterations = iteration;
            locals.insert("iteration".to_string(), Value::from(iteration));

            for step in &config.steps {
                let text = {
                    let scope = ctx.scope().with_locals(&locals);
                    self.call_backend(ctx.record_id(), node_id, &step.call, &scope, cancel).await?
                };
                let value = parse_output(step.call.output, text)?;
                locals.insert("previous".to_string(), value.clone());
                locals.insert(step.name.clone(), value.clone());
                outputs.insert(step.name.clone(), value);
            }

            if let Some(until) = until {
                if until.evaluate(&ctx.scope().with_locals(&locals)) {
                    break;
                }
            }
        }

        outputs.insert("iterations".to_string(), Value::from(iterations));
        Ok(Value::Object(outputs))
    }

    async fn function(&self, config: &FunctionConfig, scope: &Scope<'_>) -> Result<Value, NodeError> {
        let function = self.registry.function(&config.function).ok_or_else(|| {
            NodeError::Function(format!("function '{}' is not registered", config.function))
        })?;
        function.call(scope, &config.params).await
    }

    /// Run the child graph on a fresh context built from the input mapping.
    async fn subgraph(
        self: &Arc<Self>,
        ctx: &RecordContext,
        node_id: &NodeId,
        config: &SubgraphConfig,
        scope: &Scope<'_>,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        let payload = if config.inputs.is_empty() {
            ctx.source().clone()
        } else {
            config
                .inputs
                .iter()
                .map(|(field, path)| {
                    let value = scope.lookup(path).cloned().unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect()
        };

        let child = RecordContext::from_parts(ctx.record_id().clone(), ctx.index(), payload);
        let traversal = Traversal::new(config.graph.clone(), self.clone());
        let outcome = traversal.run(child, cancel.child_token()).await;
        debug!(
            "Subgraph {} for record {} finished after {} hop(s)",
            node_id,
            ctx.record_id(),
            outcome.ctx.hops()
        );

        match outcome.result {
            Ok(()) => Ok(Value::Object(
                config
                    .outputs
                    .iter()
                    .map(|(key, path)| {
                        let value = outcome.ctx.lookup(path).cloned().unwrap_or(Value::Null);
                        (key.clone(), value)
                    })
                    .collect(),
            )),
            Err(RecordError::Cancelled) => Err(NodeError::Cancelled),
            Err(err) => Err(NodeError::Subgraph(Box::new(err))),
        }
    }
}

fn parse_output(format: OutputFormat, text: String) -> Result<Value, NodeError> {
    match format {
        OutputFormat::Text => Ok(Value::String(text)),
        OutputFormat::Json => serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| NodeError::Permanent(format!("response is not valid JSON: {}", e))),
    }
}

/// Weighted draw; seeded samplers repeat per record, node and visit.
fn sample(ctx: &RecordContext, node_id: &NodeId, config: &SamplerConfig) -> Result<Value, NodeError> {
    let distribution = WeightedIndex::new(config.weights())
        .map_err(|e| NodeError::Function(format!("sampler '{}': {}", node_id, e)))?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::from_seed(derive_seed(seed, ctx.record_id(), node_id, ctx.visits(node_id))),
        None => StdRng::from_entropy(),
    };

    let mut draw = || config.choices[distribution.sample(&mut rng)].value.clone();
    Ok(match config.count {
        Some(count) => Value::Array((0..count).map(|_| draw()).collect()),
        None => draw(),
    })
}

fn derive_seed(seed: u64, record_id: &RecordId, node_id: &NodeId, visit: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(record_id.0.as_bytes());
    hasher.update([0]);
    hasher.update(node_id.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(visit.to_le_bytes());
    hasher.finalize().into()
}
