// Inference backend abstraction and per-backend throttling

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Fully rendered request, ready to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    /// Model name as configured on the node
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
}

impl InferenceResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: Usage::default(),
        }
    }
}

/// Backend failure, already classified by the backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Timeout, rate limiting, 5xx, dropped connection
    #[error("{0}")]
    Transient(String),
    /// Invalid request, authentication, unknown model
    #[error("{0}")]
    Permanent(String),
}

impl From<BackendError> for NodeError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(message) => NodeError::Transient(message),
            BackendError::Permanent(message) => NodeError::Permanent(message),
        }
    }
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn invoke(
        &self,
        prompt: &RenderedPrompt,
        params: &Map<String, Value>,
    ) -> Result<InferenceResponse, BackendError>;
}

/// Caps concurrent calls into one backend, independent of record and branch pools
pub struct ThrottledBackend {
    name: String,
    inner: Arc<dyn InferenceBackend>,
    permits: Arc<Semaphore>,
}

impl ThrottledBackend {
    /// `max_concurrent == 0` means unbounded.
    pub fn new(name: impl Into<String>, inner: Arc<dyn InferenceBackend>, max_concurrent: usize) -> Self {
        let permits = if max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            max_concurrent
        };
        Self {
            name: name.into(),
            inner,
            permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl InferenceBackend for ThrottledBackend {
    async fn invoke(
        &self,
        prompt: &RenderedPrompt,
        params: &Map<String, Value>,
    ) -> Result<InferenceResponse, BackendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Permanent(format!("backend '{}' is closed", self.name)))?;
        self.inner.invoke(prompt, params).await
    }
}

/// Model references to throttled backends
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<ThrottledBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        model: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
        max_concurrent: usize,
    ) {
        let model = model.into();
        tracing::debug!("Registered backend for model {} (max_concurrent={})", model, max_concurrent);
        let throttled = ThrottledBackend::new(model.clone(), backend, max_concurrent);
        self.backends.insert(model, Arc::new(throttled));
    }

    pub fn get(&self, model: &str) -> Option<Arc<ThrottledBackend>> {
        self.backends.get(model).cloned()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.backends.contains_key(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowBackend {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for SlowBackend {
        async fn invoke(
            &self,
            _prompt: &RenderedPrompt,
            _params: &Map<String, Value>,
        ) -> Result<InferenceResponse, BackendError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(InferenceResponse::text("ok"))
        }
    }

    #[tokio::test]
    async fn test_throttled_backend_caps_concurrency() {
        let inner = Arc::new(SlowBackend {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut registry = BackendRegistry::new();
        registry.register("m", inner.clone(), 2);
        let backend = registry.get("m").unwrap();

        let prompt = RenderedPrompt {
            model: "m".to_string(),
            messages: vec![],
        };
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let backend = backend.clone();
            let prompt = prompt.clone();
            tasks.spawn(async move { backend.invoke(&prompt, &Map::new()).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().text, "ok");
        }

        assert!(inner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(backend.available_permits(), 2);
    }

    #[test]
    fn test_backend_error_classification() {
        assert!(NodeError::from(BackendError::Transient("503".into())).is_transient());
        assert!(!NodeError::from(BackendError::Permanent("401".into())).is_transient());
    }
}
