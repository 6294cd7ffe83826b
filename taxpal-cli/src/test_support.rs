//! A scripted stand-in for the taxpal gateway.

use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub enum Reply {
    Respond { status: u16, body: String },
    Hang,
}

impl Reply {
    pub fn healthy() -> Self {
        Self::json(200, r#"{"status":"ok","message":"ready","apiKeyConfigured":true}"#)
    }

    pub fn answer(message: &str) -> Self {
        Self::Respond {
            status: 200,
            body: serde_json::json!({ "message": message }).to_string(),
        }
    }

    pub fn error(status: u16, code: &str, message: &str) -> Self {
        Self::Respond {
            status,
            body: serde_json::json!({ "error": code, "message": message }).to_string(),
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            body: body.to_string(),
        }
    }

    async fn respond(self) -> Response {
        match self {
            Reply::Respond { status, body } => (
                StatusCode::from_u16(status).unwrap(),
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                StatusCode::GATEWAY_TIMEOUT.into_response()
            }
        }
    }
}

#[derive(Default)]
struct Recorded {
    health_queries: Vec<Option<String>>,
    chat_messages: Vec<String>,
}

struct MockState {
    health: Vec<Reply>,
    chat: Vec<Reply>,
    recorded: Mutex<Recorded>,
}

/// Plays each script in order, repeating the last entry. An empty health
/// script always answers healthy; an empty chat script always fails.
pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockGateway {
    pub async fn spawn(health: Vec<Reply>, chat: Vec<Reply>) -> Self {
        let state = Arc::new(MockState {
            health,
            chat,
            recorded: Mutex::new(Recorded::default()),
        });
        let app = Router::new()
            .route("/api/test", get(health_handler))
            .route("/api/chat", post(chat_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn health_calls(&self) -> usize {
        self.state.recorded.lock().unwrap().health_queries.len()
    }

    pub fn health_queries(&self) -> Vec<Option<String>> {
        self.state.recorded.lock().unwrap().health_queries.clone()
    }

    pub fn chat_calls(&self) -> usize {
        self.state.recorded.lock().unwrap().chat_messages.len()
    }

    pub fn chat_messages(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().chat_messages.clone()
    }
}

/// A URL nothing listens on.
pub async fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn pick(script: &[Reply], index: usize) -> Option<Reply> {
    script.get(index.min(script.len().saturating_sub(1))).cloned()
}

async fn health_handler(State(state): State<Arc<MockState>>, RawQuery(query): RawQuery) -> Response {
    let index = {
        let mut recorded = state.recorded.lock().unwrap();
        recorded.health_queries.push(query);
        recorded.health_queries.len() - 1
    };
    pick(&state.health, index)
        .unwrap_or_else(Reply::healthy)
        .respond()
        .await
}

async fn chat_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let index = {
        let mut recorded = state.recorded.lock().unwrap();
        recorded
            .chat_messages
            .push(body["message"].as_str().unwrap_or_default().to_string());
        recorded.chat_messages.len() - 1
    };
    pick(&state.chat, index)
        .unwrap_or_else(|| Reply::error(500, "SERVER_ERROR", "no scripted reply"))
        .respond()
        .await
}
