use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::info;

use lmbridge_config::{EndpointEntry, SessionBinding, SessionMode};
use lmbridge_core::AppState;
use lmbridge_protocol::wire::TabCommand;

#[derive(Debug, Default, Deserialize)]
pub struct StartCaptureBody {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub battle_target: Option<String>,
}

/// Tell a connected tab to enter id-capture mode.
pub async fn start_id_capture(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Response {
    // An empty body is fine; the capture mode is optional.
    let body: StartCaptureBody = if body.is_empty() {
        StartCaptureBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "bad_body", "detail": err.to_string()})),
                )
                    .into_response();
            }
        }
    };
    let command = TabCommand::ActivateIdCapture {
        mode: body.mode.clone(),
        battle_target: body.battle_target.clone(),
    };
    let Ok(frame) = serde_json::to_string(&command) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encode_failed").into_response();
    };

    let Some((tab, sender)) = state.tabs.any_tab().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "no_tab_connected"})),
        )
            .into_response();
    };
    if sender.send(frame).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "tab_send_failed"})),
        )
            .into_response();
    }

    {
        let mut capture = state.capture.lock().expect("capture lock");
        capture.mode = body.mode;
        capture.battle_target = body.battle_target;
        capture.session_id = None;
        capture.message_id = None;
        capture.captured_at = None;
    }
    info!(tab = %tab, "id capture activated");
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CapturedIdsBody {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
}

/// Receive the ids the user-script captured from the arena page.
pub async fn receive_captured_ids(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CapturedIdsBody>,
) -> Response {
    {
        let mut capture = state.capture.lock().expect("capture lock");
        capture.session_id = Some(body.session_id.clone());
        capture.message_id = body.message_id.clone();
        capture.captured_at = Some(OffsetDateTime::now_utc());
    }
    state.monitoring.broadcast(serde_json::json!({
        "type": "ids_captured",
        "session_id_tail": tail(&body.session_id),
    }));
    info!("session ids captured");
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

pub async fn capture_status(State(state): State<Arc<AppState>>) -> Response {
    let capture = state.capture.lock().expect("capture lock").clone();
    Json(serde_json::json!({
        "captured": capture.session_id.is_some(),
        "session_id_tail": capture.session_id.as_deref().map(tail),
        "mode": capture.mode,
        "battle_target": capture.battle_target,
        "captured_at": capture.captured_at.map(|at| at.to_string()),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SaveCapturedBody {
    pub model_name: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub battle_target: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<lmbridge_config::ModelKind>,
    #[serde(default)]
    pub max_temperature: Option<f64>,
}

/// Bind the captured session to a model name and persist the mapping.
pub async fn save_captured_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SaveCapturedBody>,
) -> Response {
    let capture = state.capture.lock().expect("capture lock").clone();
    let Some(session_id) = capture.session_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "no_captured_ids"})),
        )
            .into_response();
    };

    let mode = body
        .mode
        .or(capture.mode)
        .and_then(|m| match m.as_str() {
            "battle" => Some(SessionMode::Battle),
            "direct_chat" => Some(SessionMode::DirectChat),
            _ => None,
        });
    let binding = SessionBinding {
        session_id,
        mode,
        battle_target: body.battle_target.or(capture.battle_target),
        kind: body.kind.unwrap_or_default(),
        max_temperature: body.max_temperature,
        image_compression: None,
    };

    if let Err(err) = state
        .config
        .upsert_endpoint(&body.model_name, EndpointEntry::Single(binding))
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "save_failed", "detail": err.to_string()})),
        )
            .into_response();
    }

    state.capture.lock().expect("capture lock").session_id = None;
    (
        StatusCode::OK,
        Json(serde_json::json!({"ok": true, "model": body.model_name})),
    )
        .into_response()
}

fn tail(session_id: &str) -> String {
    let start = session_id.len().saturating_sub(6);
    format!("...{}", &session_id[start..])
}
