// Prompt templating against record state

use serde_json::{Map, Value};

use crate::backend::ChatMessage;
use crate::engine::context::Scope;
use crate::error::NodeError;
use crate::graph::PromptMessage;

/// Renders `{{path}}` placeholders from a record scope
pub struct TemplateRenderer;

impl TemplateRenderer {
    /// Replace every placeholder in `text`. Strings are inserted raw, other values as JSON.
    pub fn render(text: &str, scope: &Scope<'_>) -> Result<String, NodeError> {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(open) = rest.find("{{") {
            result.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| {
                NodeError::Template(format!("unterminated placeholder in '{}'", text))
            })?;
            let path = after[..close].trim();
            if path.is_empty() {
                return Err(NodeError::Template(format!("empty placeholder in '{}'", text)));
            }
            let value = scope
                .lookup(path)
                .ok_or_else(|| NodeError::Template(format!("unresolved placeholder '{}'", path)))?;
            match value {
                Value::String(s) => result.push_str(s),
                other => result.push_str(&other.to_string()),
            }
            rest = &after[close + 2..];
        }

        result.push_str(rest);
        Ok(result)
    }

    /// Render every string inside a JSON value.
    ///
    /// A string consisting of exactly one placeholder is replaced by the referenced
    /// value itself, keeping its JSON type.
    pub fn render_value(value: &Value, scope: &Scope<'_>) -> Result<Value, NodeError> {
        match value {
            Value::String(text) => {
                if let Some(path) = sole_placeholder(text) {
                    return scope.lookup(path).cloned().ok_or_else(|| {
                        NodeError::Template(format!("unresolved placeholder '{}'", path))
                    });
                }
                Ok(Value::String(Self::render(text, scope)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| Self::render_value(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = Map::with_capacity(map.len());
                for (key, item) in map {
                    rendered.insert(key.clone(), Self::render_value(item, scope)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn render_messages(
        messages: &[PromptMessage],
        scope: &Scope<'_>,
    ) -> Result<Vec<ChatMessage>, NodeError> {
        messages
            .iter()
            .map(|message| {
                Ok(ChatMessage {
                    role: message.role.clone(),
                    content: Self::render(&message.content, scope)?,
                })
            })
            .collect()
    }

    /// Extract placeholder paths from a template string
    pub fn extract_placeholders(text: &str) -> Vec<String> {
        let mut params = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                break;
            };
            let path = after[..close].trim();
            if !path.is_empty() {
                params.push(path.to_string());
            }
            rest = &after[close + 2..];
        }

        params.sort();
        params.dedup();
        params
    }
}

fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
