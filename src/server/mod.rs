pub mod page;
pub mod types;

use axum::{
    extract::{Form, Json, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::envconfig::Host;
use crate::runner::{Engine, GenerateError, GenerationParams};
use page::PageState;
use types::{ErrorResponse, FormInput, GenerateRequest, GenerateResponse};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{field} must be a number, got {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error("generation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidNumber { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Generate(e) if e.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// Shared handle to the one loaded engine. Requests take the lock for a
/// whole generation, so they run one at a time.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<Engine>>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/generate", post(generate_form))
        .route("/api/generate", post(generate_api))
        .route("/api/health", get(health))
        .route("/api/version", get(version))
        .layer(axum::middleware::from_fn(crate::middleware::log_requests))
        .with_state(state)
}

/// Binds `host` and serves until Ctrl-C.
pub async fn serve(state: AppState, host: &Host) -> Result<(), ServerError> {
    let addr = host.addr();
    let listener = tokio::net::TcpListener::bind((host.host.as_str(), host.port))
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!("listening on http://{}", listener.local_addr().map(|a| a.to_string()).unwrap_or(addr));

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Runs one generation off the async workers.
pub async fn run_generation(state: &AppState, prompt: String, params: GenerationParams) -> Result<String, ServerError> {
    let engine = Arc::clone(&state.engine);
    let output = tokio::task::spawn_blocking(move || engine.lock().generate_reply(&prompt, &params)).await??;
    Ok(output)
}

async fn index() -> Html<String> {
    Html(page::render(&PageState::default()))
}

async fn generate_form(State(state): State<AppState>, Form(input): Form<FormInput>) -> Response {
    let request = GenerateRequest::from(input);
    let mut page = PageState {
        prompt: request.prompt.clone(),
        ..PageState::default()
    };

    let result = match request.params() {
        Ok(params) => {
            page.temperature = params.temperature;
            page.max_new_tokens = params.max_new_tokens;
            run_generation(&state, request.prompt, params).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(output) => {
            page.output = output;
            Html(page::render(&page)).into_response()
        }
        Err(e) => {
            let status = e.status();
            page.output = format!("Error: {}", e);
            (status, Html(page::render(&page))).into_response()
        }
    }
}

async fn generate_api(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServerError> {
    let params = request.params()?;
    let start = Instant::now();
    let output = run_generation(&state, request.prompt, params).await?;
    Ok(Json(GenerateResponse {
        output,
        created_at: Utc::now().to_rfc3339(),
        duration_ms: start.elapsed().as_millis() as u64,
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn version() -> impl IntoResponse {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}
