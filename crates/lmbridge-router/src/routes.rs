use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};

use lmbridge_core::AppState;
use lmbridge_protocol::openai::response::{ModelEntry, ModelList};

/// `GET /v1/models`: endpoint-map keys when present, else the fallback map.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let entries: Vec<ModelEntry> = state
        .config
        .model_names()
        .into_iter()
        .map(ModelEntry::bridge_owned)
        .collect();
    Json(ModelList::new(entries)).into_response()
}
