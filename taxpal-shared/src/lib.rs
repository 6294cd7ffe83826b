use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Request from client to gateway (`POST /api/chat`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// The question text, or `None` when absent or blank.
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
}

/// Machine-readable error codes carried in the `error` field of failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingMessage,
    RateLimit,
    Timeout,
    AuthError,
    InvalidApiKey,
    ApiKeyMissing,
    ServerError,
    OpenaiError,
    #[serde(other)]
    Unknown,
}

/// Body of every non-2xx gateway response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    #[serde(default)]
    pub message: String,
}

/// Body of `GET /api/test`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub api_key_configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Failure categories understood by both halves of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    RateLimit,
    Timeout,
    AuthError,
    UpstreamError { status: u16, message: String },
    NetworkError,
    Generic { message: String },
}

impl ErrorClassification {
    /// Re-derive the classification from a gateway response status and its
    /// (possibly unparseable) error body.
    pub fn from_response(status: u16, body: Option<&ErrorBody>) -> Self {
        let code = body.map(|b| b.error);
        let message = body
            .map(|b| b.message.clone())
            .filter(|m| !m.is_empty());

        if status == 429 || code == Some(ErrorCode::RateLimit) {
            return Self::RateLimit;
        }
        if matches!(status, 408 | 504) || code == Some(ErrorCode::Timeout) {
            return Self::Timeout;
        }
        if status == 401
            || matches!(code, Some(ErrorCode::AuthError | ErrorCode::InvalidApiKey))
        {
            return Self::AuthError;
        }
        if code == Some(ErrorCode::OpenaiError) {
            return Self::UpstreamError {
                status,
                message: message.unwrap_or_else(|| format!("Upstream error ({status})")),
            };
        }

        Self::Generic {
            message: message.unwrap_or_else(|| format!("Failed to get response ({status})")),
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate limit exceeded"),
            Self::Timeout => write!(f, "request timed out"),
            Self::AuthError => write!(f, "authentication problem with the AI service"),
            Self::UpstreamError { status, message } => {
                write!(f, "AI service error ({status}): {message}")
            }
            Self::NetworkError => write!(f, "network error"),
            Self::Generic { message } => write!(f, "{message}"),
        }
    }
}
