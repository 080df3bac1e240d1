mod chat;
mod convert;
mod gemini_api;
mod internal;
mod routes;
mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use lmbridge_core::AppState;

/// Assemble the full HTTP surface: OpenAI endpoints, the Gemini `v1beta`
/// surface, the tab WebSocket, and the internal capture/monitor endpoints.
pub fn bridge_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(routes::list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1beta/models", get(gemini_api::list_models))
        .route("/v1beta/models/{*model_action}", post(gemini_api::generate))
        .route("/ws", get(ws::tab_socket))
        .route("/internal/start_id_capture", post(internal::start_id_capture))
        .route(
            "/internal/receive_captured_ids",
            post(internal::receive_captured_ids),
        )
        .route("/internal/capture_status", get(internal::capture_status))
        .route(
            "/internal/save_captured_model",
            post(internal::save_captured_model),
        )
        .route("/internal/events", get(ws::monitor_socket))
        .with_state(state)
}
