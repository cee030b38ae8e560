#![allow(dead_code)]

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use synthflow_core::{BackendError, InferenceBackend, InferenceResponse, RenderedPrompt, RetryPolicy};

type Script = dyn Fn(&RenderedPrompt, u32) -> Result<InferenceResponse, BackendError> + Send + Sync;

/// In-process backend answering from a closure of (prompt, 1-based call number)
pub struct ScriptedBackend {
    script: Box<Script>,
    calls: AtomicU32,
    latency_ms: Option<(u64, u64)>,
}

impl ScriptedBackend {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&RenderedPrompt, u32) -> Result<InferenceResponse, BackendError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicU32::new(0),
            latency_ms: None,
        }
    }

    /// Answers with the content of the last prompt message
    pub fn echo() -> Self {
        Self::new(|prompt, _| Ok(InferenceResponse::text(last_message(prompt))))
    }

    /// Sleep a random duration in `min..=max` milliseconds before answering
    pub fn with_latency(mut self, min: u64, max: u64) -> Self {
        self.latency_ms = Some((min, max));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn invoke(
        &self,
        prompt: &RenderedPrompt,
        _params: &Map<String, Value>,
    ) -> Result<InferenceResponse, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((min, max)) = self.latency_ms {
            let ms = rand::thread_rng().gen_range(min..=max);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        (self.script)(prompt, call)
    }
}

pub fn last_message(prompt: &RenderedPrompt) -> String {
    prompt
        .messages
        .last()
        .map(|message| message.content.clone())
        .unwrap_or_default()
}

/// Retry policy with millisecond backoff
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}
