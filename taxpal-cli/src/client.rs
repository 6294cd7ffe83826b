use reqwest::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use std::time::Duration;
use taxpal_shared::{ChatRequest, ChatResponse, ErrorBody, ErrorClassification, HealthResponse};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Server check timed out")]
    Timeout,

    #[error("Connection refused. Server may be down or unreachable.")]
    Connection(#[source] reqwest::Error),

    #[error("Server answered with status {0}")]
    Status(u16),

    #[error("Malformed health response")]
    Malformed(#[source] reqwest::Error),
}

/// HTTP client for the taxpal gateway
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    chat_timeout: Duration,
    probe_timeout: Duration,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, chat_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            chat_timeout,
            probe_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/test`, cache-busted and bounded by the probe timeout.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let url = format!(
            "{}/api/test?t={}",
            self.base_url,
            chrono::Utc::now().timestamp_millis()
        );
        debug!(%url, "Checking server status");

        let exchange = async {
            let response = self
                .http
                .get(&url)
                .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(PRAGMA, "no-cache")
                .header(EXPIRES, "0")
                .send()
                .await
                .map_err(ClientError::Connection)?;

            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Status(status.as_u16()));
            }
            response
                .json::<HealthResponse>()
                .await
                .map_err(ClientError::Malformed)
        };

        match tokio::time::timeout(self.probe_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// `POST /api/chat`. Failures come back already classified.
    pub async fn send_chat(&self, message: &str) -> Result<String, ErrorClassification> {
        let url = format!("{}/api/chat", self.base_url);
        info!(chars = message.len(), "Sending chat request");

        let exchange = async {
            let response = self
                .http
                .post(&url)
                .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(PRAGMA, "no-cache")
                .json(&ChatRequest::new(message))
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "Chat request could not be sent");
                    if e.is_timeout() {
                        ErrorClassification::Timeout
                    } else {
                        ErrorClassification::NetworkError
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                let body: ChatResponse =
                    response
                        .json()
                        .await
                        .map_err(|e| ErrorClassification::Generic {
                            message: format!("Invalid response from server: {e}"),
                        })?;
                return Ok(body.message);
            }

            let body = response.json::<ErrorBody>().await.ok();
            let classification = ErrorClassification::from_response(status.as_u16(), body.as_ref());
            warn!(status = status.as_u16(), ?classification, "Chat request failed");
            Err(classification)
        };

        match tokio::time::timeout(self.chat_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.chat_timeout.as_millis() as u64, "Chat request timed out");
                Err(ErrorClassification::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_url, MockGateway, Reply};
    use std::time::Instant;

    fn client(url: String) -> GatewayClient {
        GatewayClient::new(url, Duration::from_millis(300), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn health_parses_ok_response() {
        let gateway = MockGateway::spawn(vec![Reply::healthy()], vec![]).await;

        let health = client(gateway.url()).health().await.unwrap();

        assert!(health.is_ok());
        assert_eq!(gateway.health_calls(), 1);
    }

    #[tokio::test]
    async fn health_requests_are_cache_busted() {
        let gateway = MockGateway::spawn(vec![Reply::healthy()], vec![]).await;
        let client = client(gateway.url());

        client.health().await.unwrap();
        client.health().await.unwrap();

        let queries = gateway.health_queries();
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.as_deref().is_some_and(|q| q.starts_with("t="))));
    }

    #[tokio::test]
    async fn health_rejects_non_success_and_malformed_bodies() {
        let failing = MockGateway::spawn(vec![Reply::json(500, r#"{"status":"error"}"#)], vec![]).await;
        assert!(matches!(
            client(failing.url()).health().await,
            Err(ClientError::Status(500))
        ));

        let malformed = MockGateway::spawn(vec![Reply::json(200, "OK")], vec![]).await;
        assert!(matches!(
            client(malformed.url()).health().await,
            Err(ClientError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn health_reports_refused_connections() {
        let err = client(closed_url().await).health().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[tokio::test]
    async fn chat_returns_reply_message() {
        let gateway = MockGateway::spawn(vec![], vec![Reply::answer("Yes, it is deductible.")]).await;

        let reply = client(gateway.url()).send_chat("Is it deductible?").await.unwrap();

        assert_eq!(reply, "Yes, it is deductible.");
        assert_eq!(gateway.chat_messages(), vec!["Is it deductible?".to_string()]);
    }

    #[tokio::test]
    async fn chat_failures_are_classified() {
        let gateway = MockGateway::spawn(
            vec![],
            vec![
                Reply::error(429, "RATE_LIMIT", "slow down"),
                Reply::error(504, "TIMEOUT", "upstream slow"),
                Reply::error(500, "AUTH_ERROR", "auth problem"),
                Reply::error(503, "OPENAI_ERROR", "overloaded"),
                Reply::json(500, "<html>oops</html>"),
            ],
        )
        .await;
        let client = client(gateway.url());

        assert_eq!(client.send_chat("a").await, Err(ErrorClassification::RateLimit));
        assert_eq!(client.send_chat("b").await, Err(ErrorClassification::Timeout));
        assert_eq!(client.send_chat("c").await, Err(ErrorClassification::AuthError));
        assert_eq!(
            client.send_chat("d").await,
            Err(ErrorClassification::UpstreamError {
                status: 503,
                message: "overloaded".to_string()
            })
        );
        assert!(matches!(
            client.send_chat("e").await,
            Err(ErrorClassification::Generic { .. })
        ));
    }

    #[tokio::test]
    async fn chat_to_a_dead_server_is_a_network_error() {
        let result = client(closed_url().await).send_chat("hello").await;
        assert_eq!(result, Err(ErrorClassification::NetworkError));
    }

    #[tokio::test]
    async fn chat_times_out_against_a_hanging_server() {
        let gateway = MockGateway::spawn(vec![], vec![Reply::Hang]).await;

        let started = Instant::now();
        let result = client(gateway.url()).send_chat("hello").await;

        assert_eq!(result, Err(ErrorClassification::Timeout));
        assert!(started.elapsed() < Duration::from_millis(300 + 500));
    }
}
