use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::engine::context::Scope;
use crate::error::ConfigError;

/// Comparison operators, in the order they are searched for when parsing.
const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// A bare word: resolved as a path when present in state, otherwise compared as a string.
    Word(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Truthy { path: String, negate: bool },
    Compare {
        path: String,
        op: CompareOp,
        operand: Operand,
    },
}

/// An edge or loop condition parsed once from its textual form.
///
/// Supported forms: `path`, `!path`, and `path <op> operand` with
/// `==`, `!=`, `>=`, `<=`, `>`, `<`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(invalid(text, "empty condition"));
        }

        let expr = match find_operator(trimmed) {
            Some((pos, token, op)) => {
                let path = trimmed[..pos].trim();
                let rhs = trimmed[pos + token.len()..].trim();
                if path.is_empty() || rhs.is_empty() {
                    return Err(invalid(text, "comparison needs two operands"));
                }
                validate_path(text, path)?;
                Expr::Compare {
                    path: path.to_string(),
                    op,
                    operand: parse_operand(rhs),
                }
            }
            None => {
                let (path, negate) = match trimmed.strip_prefix('!') {
                    Some(rest) => (rest.trim(), true),
                    None => (trimmed, false),
                };
                if path.contains(char::is_whitespace) {
                    return Err(invalid(text, "unsupported expression"));
                }
                validate_path(text, path)?;
                Expr::Truthy {
                    path: path.to_string(),
                    negate,
                }
            }
        };

        Ok(Self {
            source: trimmed.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against the record state visible through `scope`.
    pub fn evaluate(&self, scope: &Scope<'_>) -> bool {
        match &self.expr {
            Expr::Truthy { path, negate } => {
                let value = scope.lookup(path);
                is_truthy(value) != *negate
            }
            Expr::Compare { path, op, operand } => {
                let Some(left) = scope.lookup(path) else {
                    // Missing state only satisfies inequality
                    return *op == CompareOp::Ne;
                };
                let right = match operand {
                    Operand::Literal(value) => value.clone(),
                    Operand::Word(word) => scope
                        .lookup(word)
                        .cloned()
                        .unwrap_or_else(|| Value::String(word.clone())),
                };
                compare(left, *op, &right)
            }
        }
    }
}

impl TryFrom<String> for Condition {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.source
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(expr: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidCondition {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_path(expr: &str, path: &str) -> Result<(), ConfigError> {
    if path.split('.').any(|segment| segment.is_empty()) {
        return Err(invalid(expr, "malformed path"));
    }
    Ok(())
}

fn find_operator(text: &str) -> Option<(usize, &'static str, CompareOp)> {
    // Operators inside quoted literals must not be matched
    let quote_start = text.find(['\'', '"']).unwrap_or(text.len());
    let head = &text[..quote_start];
    OPERATORS
        .iter()
        .find_map(|(token, op)| head.find(token).map(|pos| (pos, *token, *op)))
}

fn parse_operand(text: &str) -> Operand {
    let quoted = (text.starts_with('"') && text.ends_with('"'))
        || (text.starts_with('\'') && text.ends_with('\''));
    if quoted && text.len() >= 2 {
        return Operand::Literal(Value::String(text[1..text.len() - 1].to_string()));
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => Operand::Literal(value),
        _ => Operand::Word(text.to_string()),
    }
}

/// JSON truthiness: null, false, 0, "" and empty collections are false.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let ordering = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => Some(as_text(left).cmp(&as_text(right))),
        },
    };

    let Some(ordering) = ordering else {
        return op == CompareOp::Ne;
    };

    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
