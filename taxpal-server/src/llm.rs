use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicy, UpstreamConfig};

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Request to OpenAI API timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Authentication error: the OpenAI API rejected the configured key")]
    Unauthorized,

    #[error("OpenAI API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Network error when connecting to OpenAI API")]
    Network(#[source] reqwest::Error),

    #[error("Invalid response format from OpenAI API: {reason}")]
    InvalidResponse { reason: String },
}

impl CompletionError {
    /// Timeouts and upstream 429/500 are transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Timeout { .. } => true,
            CompletionError::Status { status, .. } => matches!(status, 429 | 500),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [UpstreamMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct UpstreamMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorEnvelope {
    error: UpstreamErrorDetail,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorDetail {
    message: Option<String>,
}

/// Client for the OpenAI-compatible chat completions endpoint.
pub struct CompletionClient {
    client: Client,
    api_key: String,
    config: UpstreamConfig,
    policy: RetryPolicy,
}

impl CompletionClient {
    pub fn new(
        api_key: String,
        config: UpstreamConfig,
        policy: RetryPolicy,
    ) -> Result<Self, CompletionError> {
        info!(
            model = %config.model,
            base_url = %config.base_url,
            max_retries = policy.max_retries,
            timeout_ms = policy.timeout.as_millis() as u64,
            "Initializing completion client"
        );
        let client = Client::builder().build().map_err(CompletionError::Network)?;
        Ok(Self {
            client,
            api_key,
            config,
            policy,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Ask the model to answer `user_message`, retrying transient failures
    /// with exponential backoff.
    pub async fn complete(&self, user_message: &str) -> Result<String, CompletionError> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages: [
                UpstreamMessage {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                UpstreamMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut retries = 0;
        loop {
            match self.attempt(&request).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() && retries <= self.policy.max_retries => {
                    let delay = self.policy.backoff(retries);
                    warn!(
                        error = %e,
                        retry = retries + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Completion attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One call raced against the configured timeout. Dropping the losing
    /// future closes its connection.
    async fn attempt(&self, request: &CompletionRequest<'_>) -> Result<String, CompletionError> {
        match tokio::time::timeout(self.policy.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout {
                after: self.policy.timeout,
            }),
        }
    }

    async fn send(&self, request: &CompletionRequest<'_>) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        debug!(%url, chars = request.messages[1].content.len(), "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(CompletionError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                message: self.upstream_message(status, &body),
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                CompletionError::InvalidResponse {
                    reason: e.to_string(),
                }
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| CompletionError::InvalidResponse {
                reason: "missing choices[0].message.content".to_string(),
            })
    }

    fn transport_error(&self, e: reqwest::Error) -> CompletionError {
        if e.is_timeout() {
            CompletionError::Timeout {
                after: self.policy.timeout,
            }
        } else {
            CompletionError::Network(e)
        }
    }

    /// The `error.message` of an upstream error body, with the credential
    /// scrubbed in case the provider echoed it back.
    fn upstream_message(&self, status: StatusCode, body: &str) -> String {
        let message = serde_json::from_str::<UpstreamErrorEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.error.message)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error from OpenAI API")
                    .to_string()
            });
        if self.api_key.is_empty() {
            message
        } else {
            message.replace(&self.api_key, "[redacted]")
        }
    }
}
