//! Throwaway HTTP servers for exercising the gateway and the completion client.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use crate::config::UpstreamConfig;

pub async fn spawn_router(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Respond { status: u16, body: String },
    Hang,
}

impl MockReply {
    pub fn answer(content: &str) -> Self {
        Self::Respond {
            status: 200,
            body: serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": content } }]
            })
            .to_string(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Respond {
            status,
            body: serde_json::json!({ "error": { "message": format!("mock status {status}") } })
                .to_string(),
        }
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub at: Instant,
    pub authorization: Option<String>,
    pub body: Value,
}

struct MockState {
    script: Vec<MockReply>,
    seen: Mutex<Vec<RecordedRequest>>,
}

/// Fake completion API that plays `script` in order and repeats the last
/// reply once the script runs out.
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn spawn(script: Vec<MockReply>) -> Self {
        assert!(!script.is_empty(), "mock upstream needs at least one reply");
        let state = Arc::new(MockState {
            script,
            seen: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/chat/completions", post(completions))
            .with_state(state.clone());
        let addr = spawn_router(app).await;
        Self { addr, state }
    }

    pub fn config(&self) -> UpstreamConfig {
        test_config(format!("http://{}", self.addr))
    }

    /// Config pointing at a port nothing listens on.
    pub async fn closed_config() -> UpstreamConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        test_config(format!("http://{addr}"))
    }

    pub fn calls(&self) -> usize {
        self.state.seen.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.seen.lock().unwrap().last().cloned()
    }

    /// Time between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        let seen = self.state.seen.lock().unwrap();
        seen.windows(2).map(|w| w[1].at - w[0].at).collect()
    }
}

fn test_config(base_url: String) -> UpstreamConfig {
    UpstreamConfig {
        api_key: Some("sk-test-key".to_string()),
        model: "test-model".to_string(),
        base_url,
        max_tokens: 64,
        temperature: 0.0,
        system_prompt: "You are a test tax assistant.".to_string(),
    }
}

async fn completions(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let index = {
        let mut seen = state.seen.lock().unwrap();
        seen.push(RecordedRequest {
            at: Instant::now(),
            authorization: headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        });
        seen.len() - 1
    };

    match state.script[index.min(state.script.len() - 1)].clone() {
        MockReply::Respond { status, body } => (
            StatusCode::from_u16(status).unwrap(),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        MockReply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}
