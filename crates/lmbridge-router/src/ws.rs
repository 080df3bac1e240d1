use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use lmbridge_common::DEFAULT_TAB_ID;
use lmbridge_core::AppState;
use lmbridge_core::channels::ChannelFrame;
use lmbridge_core::lifecycle::PendingItem;
use lmbridge_core::tabs::TAB_CAPACITY;
use lmbridge_protocol::wire::TabFrame;

use crate::chat::handle_chat_completion;

const TAB_ID_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// User-script tab connection endpoint.
pub async fn tab_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tab_socket(socket, state))
}

async fn handle_tab_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // The first frame may announce the tab id; legacy scripts send a regular
    // data frame instead, which must still be routed.
    let mut tab_id = DEFAULT_TAB_ID.to_string();
    let mut stashed: Option<TabFrame> = None;
    match tokio::time::timeout(TAB_ID_HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<TabFrame>(&text) {
            Ok(frame) => {
                if let Some(id) = &frame.tab_id {
                    tab_id = id.clone();
                } else {
                    warn!("no tab id in first frame; using the default slot");
                    stashed = Some(frame);
                }
            }
            Err(_) => warn!("unparseable first frame; using the default tab id"),
        },
        Ok(Some(Ok(_))) => {}
        Ok(Some(Err(_))) | Ok(None) => return,
        Err(_) => warn!("tab id handshake timed out; using the default slot"),
    }

    // Outbound frames ride a queue so any task can write to this tab.
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let total = state.tabs.register(&tab_id, tx).await;
    // Any fresh connection means a verification challenge (if any) is over.
    state.verification.clear();
    state.monitoring.broadcast(serde_json::json!({
        "type": "browser_status",
        "connected": true,
    }));
    state.monitoring.broadcast(serde_json::json!({
        "type": "tab_connection",
        "action": "connected",
        "tab_id": tab_id,
        "total_tabs": total,
        "total_capacity": total * TAB_CAPACITY,
    }));

    if state.config.config().enable_auto_retry {
        recover_open_requests(&state);
        if !state.pending.is_empty() {
            tokio::spawn(drain_pending(state.clone()));
        }
    }

    if let Some(frame) = stashed {
        route_frame(&state, &tab_id, frame);
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<TabFrame>(&text) {
                Ok(frame) => route_frame(&state, &tab_id, frame),
                Err(err) => warn!(tab = %tab_id, %err, "invalid tab frame dropped"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Disconnect protocol: counters, registry, then reassignment.
    info!(tab = %tab_id, "tab disconnected; starting cleanup");
    let summary = state.tabs.remove(&tab_id).await;
    writer.abort();

    state.monitoring.broadcast(serde_json::json!({
        "type": "browser_status",
        "connected": summary.remaining_tabs > 0,
    }));
    state.monitoring.broadcast(serde_json::json!({
        "type": "tab_connection",
        "action": "disconnected",
        "tab_id": tab_id,
        "total_tabs": summary.remaining_tabs,
        "total_capacity": summary.remaining_tabs * TAB_CAPACITY,
    }));

    if summary.remaining_tabs > 0 {
        state.reassign_pending(&tab_id).await;
    } else if !state.config.config().enable_auto_retry {
        // Nothing left to serve the open channels; terminate them.
        for request_id in state.channels.open_request_ids() {
            state
                .channels
                .push_error_and_done(&request_id, "Browser disconnected during operation");
        }
    }
}

fn route_frame(state: &Arc<AppState>, tab_id: &str, frame: TabFrame) {
    let (Some(request_id), Some(data)) = (frame.request_id, frame.data) else {
        warn!(tab = tab_id, "tab frame without request_id/data dropped");
        return;
    };
    state
        .channels
        .route_frame(tab_id, &request_id, ChannelFrame::classify(data));
}

/// Re-queue every still-open request whose metadata survived the disconnect;
/// channels whose metadata is gone get a terminal error.
fn recover_open_requests(state: &Arc<AppState>) {
    let open = state.channels.open_request_ids();
    if open.is_empty() {
        return;
    }
    info!(count = open.len(), "recovering open requests after reconnect");
    for request_id in open {
        match state.channels.metadata(&request_id) {
            Some(meta) => {
                let (tx, _rx) = oneshot::channel();
                state.pending.push(PendingItem {
                    request: meta.openai_request,
                    original_request_id: Some(request_id),
                    responder: tx,
                });
            }
            None => {
                warn!(request = %request_id, "request data lost during reconnection");
                state
                    .channels
                    .push_error_and_done(&request_id, "Request data lost during reconnection");
            }
        }
    }
}

/// Replay parked requests one by one with a small gap between them.
async fn drain_pending(state: Arc<AppState>) {
    while let Some(item) = state.pending.pop() {
        let original = item.original_request_id.clone();
        let response =
            handle_chat_completion(state.clone(), None, item.request, true, original).await;
        let _ = item.responder.send(Ok(response));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Dashboard event stream: relays monitoring broadcast events until either
/// side hangs up.
pub async fn monitor_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_monitor_socket(socket, state))
}

async fn handle_monitor_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.monitoring.subscribe();
    loop {
        select! {
            msg = socket.recv() => {
                if msg.is_none() {
                    break;
                }
            }
            event = rx.recv() => {
                let Ok(event) = event else {
                    break;
                };
                if socket.send(Message::Text(event.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
