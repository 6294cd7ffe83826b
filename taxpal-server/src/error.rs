use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use taxpal_shared::{ErrorBody, ErrorClassification, ErrorCode};
use thiserror::Error;
use tracing::warn;

use crate::llm::CompletionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSource {
    Local,
    Upstream,
}

/// Everything `/api/chat` can fail with
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No message provided")]
    InvalidInput,

    #[error("OpenAI API key is not configured. Please check server configuration.")]
    Unconfigured,

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited(RateLimitSource),

    #[error("Request to OpenAI API timed out. Please try again later.")]
    Timeout,

    #[error("There was an authentication problem with the AI service.")]
    AuthError,

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("Could not reach the AI service. Please try again later.")]
    Network,

    #[error("An error occurred: {message}")]
    Generic { message: String },
}

impl From<CompletionError> for GatewayError {
    fn from(e: CompletionError) -> Self {
        match e {
            CompletionError::Timeout { .. } => GatewayError::Timeout,
            CompletionError::Unauthorized => GatewayError::AuthError,
            CompletionError::Status { status: 429, .. } => {
                GatewayError::RateLimited(RateLimitSource::Upstream)
            }
            CompletionError::Status { status, message } => GatewayError::Upstream { status, message },
            CompletionError::Network(_) => GatewayError::Network,
            CompletionError::InvalidResponse { reason } => {
                warn!(%reason, "Upstream returned an unreadable completion");
                GatewayError::Generic {
                    message: "Invalid response format from the AI service".to_string(),
                }
            }
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Unconfigured
            | GatewayError::AuthError
            | GatewayError::Network
            | GatewayError::Generic { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidInput => ErrorCode::MissingMessage,
            GatewayError::Unconfigured => ErrorCode::ApiKeyMissing,
            GatewayError::RateLimited(_) => ErrorCode::RateLimit,
            GatewayError::Timeout => ErrorCode::Timeout,
            GatewayError::AuthError => ErrorCode::AuthError,
            GatewayError::Upstream { .. } => ErrorCode::OpenaiError,
            GatewayError::Network | GatewayError::Generic { .. } => ErrorCode::ServerError,
        }
    }

    /// The shared classification the client will derive from this response.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            GatewayError::RateLimited(_) => ErrorClassification::RateLimit,
            GatewayError::Timeout => ErrorClassification::Timeout,
            GatewayError::AuthError => ErrorClassification::AuthError,
            GatewayError::Upstream { status, message } => ErrorClassification::UpstreamError {
                status: *status,
                message: message.clone(),
            },
            GatewayError::Network => ErrorClassification::NetworkError,
            GatewayError::InvalidInput | GatewayError::Unconfigured | GatewayError::Generic { .. } => {
                ErrorClassification::Generic {
                    message: self.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let source = match &self {
            GatewayError::RateLimited(source) => Some(*source),
            _ => None,
        };
        warn!(
            status = status.as_u16(),
            code = ?code,
            rate_limit_source = ?source,
            classification = ?self.classification(),
            "Chat request failed"
        );

        let body = ErrorBody {
            error: code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn completion_errors_map_onto_the_gateway_taxonomy() {
        let timeout: GatewayError = CompletionError::Timeout {
            after: Duration::from_secs(30),
        }
        .into();
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.error_code(), ErrorCode::Timeout);

        let auth: GatewayError = CompletionError::Unauthorized.into();
        assert_eq!(auth.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(auth.error_code(), ErrorCode::AuthError);

        let limited: GatewayError = CompletionError::Status {
            status: 429,
            message: "slow down".to_string(),
        }
        .into();
        assert!(matches!(limited, GatewayError::RateLimited(RateLimitSource::Upstream)));
        assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let relayed: GatewayError = CompletionError::Status {
            status: 503,
            message: "overloaded".to_string(),
        }
        .into();
        assert_eq!(relayed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(relayed.error_code(), ErrorCode::OpenaiError);
        assert_eq!(relayed.to_string(), "overloaded");

        let parse: GatewayError = CompletionError::InvalidResponse {
            reason: "error decoding response body for url (https://upstream.internal/v1)".to_string(),
        }
        .into();
        assert_eq!(parse.error_code(), ErrorCode::ServerError);
        let shown = parse.to_string();
        assert!(shown.contains("Invalid response format from the AI service"));
        assert!(!shown.contains("upstream.internal"));
    }

    #[test]
    fn gateway_and_client_classifications_agree() {
        let cases = [
            GatewayError::RateLimited(RateLimitSource::Local),
            GatewayError::Timeout,
            GatewayError::AuthError,
            GatewayError::Upstream {
                status: 502,
                message: "bad gateway".to_string(),
            },
        ];
        for error in cases {
            let body = ErrorBody {
                error: error.error_code(),
                message: error.to_string(),
            };
            let derived =
                ErrorClassification::from_response(error.status_code().as_u16(), Some(&body));
            assert_eq!(derived, error.classification(), "{error:?}");
        }
    }

    #[test]
    fn out_of_range_upstream_status_becomes_bad_gateway() {
        let error = GatewayError::Upstream {
            status: 42,
            message: "weird".to_string(),
        };
        assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);
    }
}
