use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::Duration;
use synthflow_core::backend::Usage;
use synthflow_core::{BackendError, InferenceBackend, InferenceResponse, RenderedPrompt};

use crate::config::ModelConfig;

/// OpenAI-compatible `/chat/completions` client
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(name: &str, config: &ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok().filter(|key| !key.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                "No API key in {} for model {}, sending unauthenticated requests",
                config.api_key_env,
                name
            );
        }

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone().unwrap_or_else(|| name.to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn invoke(
        &self,
        prompt: &RenderedPrompt,
        params: &Map<String, Value>,
    ) -> Result<InferenceResponse, BackendError> {
        let mut payload = json!({
            "model": self.model,
            "messages": prompt.messages,
        });
        if let Some(body) = payload.as_object_mut() {
            for (key, value) in params {
                body.insert(key.clone(), value.clone());
            }
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| BackendError::Transient(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown".to_string());
            let message = format!("request failed ({status}): {body}");
            return Err(classify(status, message));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|err| BackendError::Transient(format!("response body failed: {err}")))?;
        let text = extract_chat_message(&value).ok_or_else(|| {
            BackendError::Permanent("response has no choices[0].message.content".to_string())
        })?;

        Ok(InferenceResponse {
            text,
            usage: extract_usage(&value),
        })
    }
}

/// 408, 429 and 5xx are worth retrying; every other error status is not
fn classify(status: StatusCode, message: String) -> BackendError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

fn extract_chat_message(value: &Value) -> Option<String> {
    let first = value.get("choices")?.as_array()?.first()?;
    first.get("message")?.get("content")?.as_str().map(str::to_string)
}

fn extract_usage(value: &Value) -> Usage {
    let usage = value.get("usage");
    let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_u64);
    Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
    }
}
