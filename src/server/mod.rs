pub mod api;
pub mod broadcast;
pub mod error;

use crate::infra::SessionStore;
use axum::Router;
use axum::routing::{get, post};
use broadcast::Broadcaster;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub projects_dir: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/conversations", get(api::list_conversations))
        .route(
            "/api/conversations/archive-all",
            post(api::archive_all_sessions),
        )
        .route(
            "/api/conversations/{id}",
            get(api::get_conversation)
                .put(api::update_session)
                .delete(api::delete_session),
        )
        .route(
            "/api/conversations/{id}/metadata",
            get(api::get_conversation_metadata),
        )
        .route("/api/system/status", get(api::system_status))
        .route("/api/stream/{streaming_id}", get(api::stream))
        .with_state(state)
}

pub async fn run_http_server(port: u16, state: AppState) -> Result<(), String> {
    run_http_server_on(SocketAddr::from(([127, 0, 0, 1], port)), state).await
}

pub async fn run_http_server_on(addr: SocketAddr, state: AppState) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|error| error.to_string())?;
    serve(listener, state).await
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<(), String> {
    let app = build_router(state);
    axum::serve(listener, app)
        .await
        .map_err(|error| error.to_string())
}
