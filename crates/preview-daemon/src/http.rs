use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use preview_engine::{CatalogResolver, StatusBoard};
use preview_proto::protocol::{GroupId, SessionSnapshot};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::bridge::Bridge;

#[derive(Clone)]
pub struct HttpState {
    pub status: StatusBoard,
    pub catalog: Arc<dyn CatalogResolver>,
    pub bridge: Bridge,
}

#[derive(Serialize)]
struct SessionsResponse {
    rev: u64,
    sessions: Vec<SessionSnapshot>,
}

#[derive(Serialize)]
struct HealthResponse {
    catalog_ready: bool,
    bridge_clients: usize,
    active_sessions: usize,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/sessions", get(get_sessions))
        .route("/api/sessions/:group_id", get(get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_health(State(state): State<HttpState>) -> Json<HealthResponse> {
    let active_sessions = state
        .status
        .all()
        .await
        .iter()
        .filter(|s| !s.state.is_idle())
        .count();
    Json(HealthResponse {
        catalog_ready: state.catalog.is_ready(),
        bridge_clients: state.bridge.client_count().await,
        active_sessions,
    })
}

async fn get_sessions(State(state): State<HttpState>) -> Json<SessionsResponse> {
    let rev = state.status.rev();
    Json(SessionsResponse {
        rev,
        sessions: state.status.all().await,
    })
}

async fn get_session(
    State(state): State<HttpState>,
    Path(group_id): Path<u64>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    state
        .status
        .get(GroupId(group_id))
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
