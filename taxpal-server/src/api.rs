use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use taxpal_shared::{ChatRequest, ChatResponse, HealthResponse};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{GatewayError, RateLimitSource};
use crate::llm::{CompletionClient, CompletionError};
use crate::rate_limit::TokenBucket;

/// Process-wide state handed to every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub limiter: TokenBucket,
    /// `None` when no API key is configured.
    pub completion: Option<CompletionClient>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self, CompletionError> {
        let completion = match &config.upstream.api_key {
            Some(key) => Some(CompletionClient::new(
                key.clone(),
                config.upstream.clone(),
                config.retry,
            )?),
            None => None,
        };
        Ok(Self {
            limiter: TokenBucket::new(config.rate_limit),
            completion,
            config,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state
        .config
        .static_dir
        .clone()
        .filter(|dir| dir.is_dir());
    let cors = cors_layer(&state.config.allowed_origins);

    let api = Router::new()
        .route("/api/test", get(health))
        .route("/api/chat", post(chat))
        .with_state(state);

    let app = match static_dir {
        Some(dir) => {
            let index = dir.join("index.html");
            api.fallback_service(ServeDir::new(dir).not_found_service(ServeFile::new(index)))
        }
        None => api.fallback(not_found),
    };

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let api_key_configured = state.completion.is_some();
    debug!(api_key_configured, "Health check");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: if api_key_configured {
            "Server is running and API key is configured".to_string()
        } else {
            "Server is running but API key is missing".to_string()
        },
        api_key_configured,
        port: Some(state.config.port),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
    })
}

async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, GatewayError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "Unreadable chat request body");
            ChatRequest::default()
        }
    };

    let message = request.text().ok_or(GatewayError::InvalidInput)?;
    let completion = state.completion.as_ref().ok_or(GatewayError::Unconfigured)?;

    if !state.limiter.try_acquire() {
        debug!(
            capacity = state.limiter.max_tokens(),
            available = state.limiter.available_at(Instant::now()),
            "Local token bucket empty"
        );
        return Err(GatewayError::RateLimited(RateLimitSource::Local));
    }

    info!(chars = message.len(), model = completion.model(), "Forwarding chat message");
    let reply = completion.complete(message).await?;
    info!(chars = reply.len(), "Received completion");

    Ok(Json(ChatResponse { message: reply }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        "No front-end build is being served.\n\
         API endpoints:\n  GET  /api/test - check that the server is running\n  POST /api/chat - ask a question ({\"message\": \"...\"})\n",
    )
}
