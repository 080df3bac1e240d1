use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lmbridge_common::TabId;
use lmbridge_config::{ModelKind, SessionMode};
use lmbridge_protocol::openai::request::ChatCompletionRequest;
use lmbridge_protocol::wire::RetryInfo;

/// A frame routed into one request's response channel, classified from the
/// raw `data` field of a tab message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    /// Concatenable fragment of the arena wire format.
    Chunk(String),
    /// Literal `"[DONE]"`.
    Done,
    /// `{"error": ...}` object sent by the user-script.
    Error(String),
    /// `{"retry_info": {...}}` progress report.
    Retry(RetryInfo),
}

impl ChannelFrame {
    pub fn classify(data: serde_json::Value) -> ChannelFrame {
        match data {
            serde_json::Value::String(text) if text == "[DONE]" => ChannelFrame::Done,
            serde_json::Value::String(text) => ChannelFrame::Chunk(text),
            serde_json::Value::Array(items) => {
                let joined: String = items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                ChannelFrame::Chunk(joined)
            }
            serde_json::Value::Object(map) => {
                if let Some(retry) = map.get("retry_info") {
                    let info: RetryInfo =
                        serde_json::from_value(retry.clone()).unwrap_or_default();
                    return ChannelFrame::Retry(info);
                }
                if let Some(error) = map.get("error") {
                    let message = match error {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    return ChannelFrame::Error(message);
                }
                ChannelFrame::Chunk(serde_json::Value::Object(map).to_string())
            }
            other => ChannelFrame::Chunk(other.to_string()),
        }
    }
}

/// Per-request bookkeeping, created on admission, mutated on transfer,
/// destroyed at the terminal event.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub openai_request: ChatCompletionRequest,
    pub model_name: String,
    pub session_id: String,
    pub mode_override: Option<SessionMode>,
    pub battle_target_override: Option<String>,
    pub model_kind: ModelKind,
    pub target_model_id: Option<String>,
    pub tab_id: Option<TabId>,
    pub original_tab_id: Option<TabId>,
    pub transfer_count: u32,
    pub transfer_allowed: bool,
    pub created_at: OffsetDateTime,
}

/// Response-channel broker: one FIFO per active request id, plus the pending
/// metadata that decides which tab may write into it.
#[derive(Default)]
pub struct ChannelBroker {
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<ChannelFrame>>>,
    metadata: Mutex<HashMap<String, PendingRequest>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a request: create its channel and store the metadata.
    pub fn admit(&self, meta: PendingRequest) -> mpsc::UnboundedReceiver<ChannelFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .expect("channel map lock")
            .insert(meta.request_id.clone(), tx);
        self.metadata
            .lock()
            .expect("metadata map lock")
            .insert(meta.request_id.clone(), meta);
        rx
    }

    /// Route one inbound frame. A frame is accepted when the sender tab owns
    /// the request, or when the request allows cross-tab delivery (transfer),
    /// or when no metadata survives (legacy frames).
    pub fn route_frame(&self, sender_tab: &str, request_id: &str, frame: ChannelFrame) {
        let Some(tx) = self
            .channels
            .lock()
            .expect("channel map lock")
            .get(request_id)
            .cloned()
        else {
            warn!(request = request_id, "frame for unknown or closed request dropped");
            return;
        };

        let accept = match self
            .metadata
            .lock()
            .expect("metadata map lock")
            .get(request_id)
        {
            Some(meta) => {
                let expected = meta.tab_id.as_deref();
                if meta.transfer_allowed {
                    if expected.is_some_and(|tab| tab != sender_tab) {
                        info!(
                            request = request_id,
                            expected = expected.unwrap_or(""),
                            actual = sender_tab,
                            "cross-tab frame accepted for transferred request"
                        );
                    }
                    true
                } else {
                    expected == Some(sender_tab)
                }
            }
            None => true,
        };

        if !accept {
            warn!(
                request = request_id,
                sender = sender_tab,
                "frame from non-owner tab rejected"
            );
            return;
        }
        let _ = tx.send(frame);
    }

    pub fn metadata(&self, request_id: &str) -> Option<PendingRequest> {
        self.metadata
            .lock()
            .expect("metadata map lock")
            .get(request_id)
            .cloned()
    }

    pub fn with_metadata_mut<R>(
        &self,
        request_id: &str,
        f: impl FnOnce(&mut PendingRequest) -> R,
    ) -> Option<R> {
        self.metadata
            .lock()
            .expect("metadata map lock")
            .get_mut(request_id)
            .map(f)
    }

    /// Pending requests currently assigned to one tab.
    pub fn owned_by(&self, tab_id: &str) -> Vec<PendingRequest> {
        self.metadata
            .lock()
            .expect("metadata map lock")
            .values()
            .filter(|meta| meta.tab_id.as_deref() == Some(tab_id))
            .cloned()
            .collect()
    }

    pub fn open_request_ids(&self) -> Vec<String> {
        self.channels
            .lock()
            .expect("channel map lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Terminal error followed by the done marker.
    pub fn push_error_and_done(&self, request_id: &str, message: impl Into<String>) {
        let tx = self
            .channels
            .lock()
            .expect("channel map lock")
            .get(request_id)
            .cloned();
        if let Some(tx) = tx {
            let _ = tx.send(ChannelFrame::Error(message.into()));
            let _ = tx.send(ChannelFrame::Done);
        }
    }

    pub fn remove_channel(&self, request_id: &str) {
        self.channels
            .lock()
            .expect("channel map lock")
            .remove(request_id);
    }

    pub fn remove_metadata(&self, request_id: &str) {
        self.metadata
            .lock()
            .expect("metadata map lock")
            .remove(request_id);
    }

    /// Normal-end cleanup: a short grace delay absorbs frames that cross the
    /// `[DONE]` boundary before the channel disappears.
    pub fn remove_after_grace(self: &std::sync::Arc<Self>, request_id: &str, grace: Duration) {
        let broker = std::sync::Arc::clone(self);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            broker.remove_channel(&request_id);
            broker.remove_metadata(&request_id);
        });
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("channel map lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(request_id: &str, tab: Option<&str>, transfer_allowed: bool) -> PendingRequest {
        PendingRequest {
            request_id: request_id.to_string(),
            openai_request: serde_json::from_value(serde_json::json!({"model": "m"})).unwrap(),
            model_name: "m".to_string(),
            session_id: "s".to_string(),
            mode_override: None,
            battle_target_override: None,
            model_kind: ModelKind::Text,
            target_model_id: None,
            tab_id: tab.map(|t| t.to_string()),
            original_tab_id: tab.map(|t| t.to_string()),
            transfer_count: 0,
            transfer_allowed,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn classify_distinguishes_frame_kinds() {
        assert_eq!(
            ChannelFrame::classify(serde_json::json!("[DONE]")),
            ChannelFrame::Done
        );
        assert_eq!(
            ChannelFrame::classify(serde_json::json!("a0:\"x\"")),
            ChannelFrame::Chunk("a0:\"x\"".to_string())
        );
        assert_eq!(
            ChannelFrame::classify(serde_json::json!({"error": "boom"})),
            ChannelFrame::Error("boom".to_string())
        );
        match ChannelFrame::classify(serde_json::json!({"retry_info": {"attempt": 2, "max_attempts": 5}})) {
            ChannelFrame::Retry(info) => assert_eq!(info.attempt, 2),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(
            ChannelFrame::classify(serde_json::json!(["a", "b"])),
            ChannelFrame::Chunk("ab".to_string())
        );
    }

    #[tokio::test]
    async fn owner_tab_frames_are_delivered() {
        let broker = ChannelBroker::new();
        let mut rx = broker.admit(meta("r1", Some("t1"), false));
        broker.route_frame("t1", "r1", ChannelFrame::Chunk("x".to_string()));
        assert_eq!(rx.recv().await, Some(ChannelFrame::Chunk("x".to_string())));
    }

    #[tokio::test]
    async fn non_owner_frames_are_rejected_unless_transfer_allowed() {
        let broker = ChannelBroker::new();
        let mut rx = broker.admit(meta("r1", Some("t1"), false));
        broker.route_frame("t2", "r1", ChannelFrame::Chunk("bad".to_string()));
        broker.route_frame("t1", "r1", ChannelFrame::Done);
        // The rejected frame never arrives; the owner's Done is first.
        assert_eq!(rx.recv().await, Some(ChannelFrame::Done));

        let mut rx = broker.admit(meta("r2", Some("t1"), true));
        broker.route_frame("t2", "r2", ChannelFrame::Chunk("ok".to_string()));
        assert_eq!(rx.recv().await, Some(ChannelFrame::Chunk("ok".to_string())));
    }

    #[tokio::test]
    async fn error_and_done_are_terminal_sequence() {
        let broker = ChannelBroker::new();
        let mut rx = broker.admit(meta("r1", Some("t1"), true));
        broker.push_error_and_done("r1", "transfer budget exhausted");
        assert_eq!(
            rx.recv().await,
            Some(ChannelFrame::Error("transfer budget exhausted".to_string()))
        );
        assert_eq!(rx.recv().await, Some(ChannelFrame::Done));
    }

    #[tokio::test]
    async fn grace_removal_keeps_channel_briefly() {
        let broker = std::sync::Arc::new(ChannelBroker::new());
        let _rx = broker.admit(meta("r1", Some("t1"), true));
        broker.remove_after_grace("r1", Duration::from_millis(30));
        assert_eq!(broker.channel_count(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.channel_count(), 0);
        assert!(broker.metadata("r1").is_none());
    }

    #[test]
    fn owned_by_filters_on_current_tab() {
        let broker = ChannelBroker::new();
        let _a = broker.admit(meta("r1", Some("t1"), true));
        let _b = broker.admit(meta("r2", Some("t2"), true));
        let owned = broker.owned_by("t1");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].request_id, "r1");
    }
}
