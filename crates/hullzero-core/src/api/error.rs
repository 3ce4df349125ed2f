use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized { detail: Option<String> },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Unprocessable(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body shapes the backend produces: FastAPI's `detail`, or a
/// `message` that is either plain text or a tree of field errors.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
    message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FieldProblem {
    message: Option<String>,
    #[serde(default)]
    children: Vec<FieldProblem>,
}

fn collect_field_messages(nodes: &[FieldProblem], out: &mut Vec<String>) {
    for node in nodes {
        if let Some(ref message) = node.message {
            out.push(message.clone());
        }
        collect_field_messages(&node.children, out);
    }
}

fn messages_from_value(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(_) => {
            // FastAPI puts `msg`, the other backend uses nested `message`
            let mut out = Vec::new();
            if let Ok(nodes) = serde_json::from_value::<Vec<FieldProblem>>(value.clone()) {
                collect_field_messages(&nodes, &mut out);
            }
            if out.is_empty() {
                if let Some(items) = value.as_array() {
                    out.extend(
                        items
                            .iter()
                            .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                            .map(str::to_string),
                    );
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Extract every human-readable message from an error response body.
///
/// Plain-text bodies are returned as-is; JSON bodies are searched for
/// `detail` first and `message` second. Returns an empty list when the body
/// carries nothing useful.
pub fn extract_error_messages(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<ErrorBody>(trimmed) {
        Ok(parsed) => {
            if let Some(ref detail) = parsed.detail {
                let messages = messages_from_value(detail);
                if !messages.is_empty() {
                    return messages;
                }
            }
            parsed
                .message
                .as_ref()
                .map(messages_from_value)
                .unwrap_or_default()
        }
        Err(_) if !trimmed.starts_with('{') && !trimmed.starts_with('[') => {
            vec![trimmed.to_string()]
        }
        Err(_) => Vec::new(),
    }
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Server message if the body has one, otherwise the (truncated) raw body
    fn describe(body: &str) -> String {
        let messages = extract_error_messages(body);
        if messages.is_empty() {
            Self::truncate_body(body)
        } else {
            Self::truncate_body(&messages.join("; "))
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 => ApiError::BadRequest(Self::describe(body)),
            401 => {
                let messages = extract_error_messages(body);
                ApiError::Unauthorized {
                    detail: if messages.is_empty() {
                        None
                    } else {
                        Some(messages.join("; "))
                    },
                }
            }
            403 => ApiError::AccessDenied(Self::describe(body)),
            404 => ApiError::NotFound(Self::describe(body)),
            422 => ApiError::Unprocessable(Self::describe(body)),
            500..=599 => ApiError::ServerError(Self::describe(body)),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, Self::describe(body))),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthorized { detail: Some(d) } => d.clone(),
            ApiError::BadRequest(m)
            | ApiError::AccessDenied(m)
            | ApiError::NotFound(m)
            | ApiError::Unprocessable(m)
            | ApiError::ServerError(m) => m.clone(),
            other => other.to_string(),
        }
    }
}
