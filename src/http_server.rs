//! HTTP server implementation using Axum.

use crate::controller::SessionStatus;
use crate::error::SessionError;
use crate::state::{AppState, READY_WAIT_MS};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// Request/Response types
#[derive(Serialize)]
struct SessionInfo {
    #[serde(flatten)]
    status: SessionStatus,
    url: Option<String>,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct InstallResponse {
    exit_code: i32,
}

#[derive(Deserialize)]
struct ReadyQuery {
    #[serde(default = "default_ready_wait")]
    timeout_ms: u64,
}

fn default_ready_wait() -> u64 { READY_WAIT_MS }

#[derive(Serialize)]
struct ReadyResponse {
    url: String,
}

type ApiError = (StatusCode, String);

fn reject(err: SessionError) -> ApiError {
    let status = match err {
        SessionError::NotInitialized
        | SessionError::AlreadyBooted
        | SessionError::InstallInProgress => StatusCode::CONFLICT,
        SessionError::InstallFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SessionError::DisposalTimeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, status = status.as_u16(), "Session request failed");
    (status, err.to_string())
}

/// Routes for the session API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/session", get(get_session).delete(dispose_session))
        .route("/session/initialize", post(initialize))
        .route("/session/install", post(install))
        .route("/session/start", post(start))
        .route("/session/bootstrap", post(bootstrap))
        .route("/session/ready", get(ready))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves, then dispose the session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let session = state.session.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped, disposing session");
    session.dispose().await;
    Ok(())
}

/// Run the HTTP server on the given port until Ctrl-C.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn health() -> &'static str {
    "OK"
}

async fn get_session(State(state): State<AppState>) -> Json<SessionInfo> {
    Json(SessionInfo {
        status: state.session.status().await,
        url: state.current_url(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn initialize(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.session.initialize().await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn install(State(state): State<AppState>) -> Result<Json<InstallResponse>, ApiError> {
    let exit_code = state.session.install_dependencies().await.map_err(reject)?;
    Ok(Json(InstallResponse { exit_code }))
}

async fn start(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.ready_url.send_replace(None);
    state
        .session
        .start_dev_server(state.ready_recorder())
        .await
        .map_err(reject)?;
    Ok(StatusCode::ACCEPTED)
}

async fn bootstrap(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.ready_url.send_replace(None);
    state
        .session
        .bootstrap(state.ready_recorder())
        .await
        .map_err(reject)?;
    Ok(StatusCode::ACCEPTED)
}

async fn ready(
    State(state): State<AppState>,
    Query(query): Query<ReadyQuery>,
) -> Result<Json<ReadyResponse>, ApiError> {
    let mut rx = state.ready_url.subscribe();
    let wait = tokio::time::timeout(
        Duration::from_millis(query.timeout_ms),
        rx.wait_for(Option::is_some),
    )
    .await;
    let url = match wait {
        Ok(Ok(url)) => url.clone(),
        _ => None,
    };
    match url {
        Some(url) => Ok(Json(ReadyResponse { url })),
        None => Err((
            StatusCode::GATEWAY_TIMEOUT,
            "dev server not ready".to_string(),
        )),
    }
}

async fn dispose_session(State(state): State<AppState>) -> StatusCode {
    state.session.dispose().await;
    state.ready_url.send_replace(None);
    StatusCode::NO_CONTENT
}
