use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use lmbridge_config::ImageReturnMode;
use lmbridge_protocol::arena::{ArenaScanner, ArenaToken, contains_challenge};
use lmbridge_protocol::wire::RetryInfo;

use crate::channels::ChannelFrame;
use crate::lifecycle::ChallengeAction;
use crate::state::AppState;

/// Post-`[DONE]` window in which late frames are still folded into the
/// buffer before the forced drain.
const LATE_DATA_WINDOW: Duration = Duration::from_millis(200);
const CHANNEL_GRACE: Duration = Duration::from_secs(1);

/// Structured event stream handed to the SSE/JSON responder.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    Content(String),
    Reasoning(String),
    /// Reasoning phase is over; the next content token follows.
    ReasoningEnd,
    /// Whole reasoning buffer, emitted once when streaming is not preserved.
    ReasoningComplete(String),
    Retry(RetryInfo),
    Finish {
        reason: String,
        usage: Option<UsageTally>,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageTally {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTally {
    pub fn from_upstream(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let pick = |keys: [&str; 2]| -> u64 {
            keys.iter()
                .filter_map(|key| value.get(key).and_then(|v| v.as_u64()))
                .find(|n| *n > 0)
                .unwrap_or(0)
        };
        Some(Self {
            input_tokens: pick(["inputTokens", "prompt_tokens"]),
            output_tokens: pick(["outputTokens", "completion_tokens"]),
        })
    }
}

/// Spawn the parser task for one admitted request. It reads the raw frames
/// routed by the broker and yields [`ProcessorEvent`]s; dropping the returned
/// receiver cancels the request (a cancel envelope goes to the owning tab).
pub fn spawn_processor(
    state: Arc<AppState>,
    request_id: String,
    frames: mpsc::UnboundedReceiver<ChannelFrame>,
) -> mpsc::UnboundedReceiver<ProcessorEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        Processor {
            state,
            request_id,
            tx,
            scanner: ArenaScanner::new(),
            has_reasoning: false,
            reasoning_ended: false,
            reasoning_parts: Vec::new(),
            cancelled: false,
        }
        .run(frames)
        .await;
    });
    rx
}

struct Processor {
    state: Arc<AppState>,
    request_id: String,
    tx: mpsc::UnboundedSender<ProcessorEvent>,
    scanner: ArenaScanner,
    has_reasoning: bool,
    reasoning_ended: bool,
    reasoning_parts: Vec<String>,
    cancelled: bool,
}

impl Processor {
    async fn run(mut self, mut frames: mpsc::UnboundedReceiver<ChannelFrame>) {
        let config = self.state.config.config();
        let frame_timeout = Duration::from_secs(config.stream_response_timeout_seconds);

        loop {
            let received = tokio::select! {
                // Consumer hung up (client disconnect): cancel immediately.
                _ = self.tx.closed() => None,
                received = tokio::time::timeout(frame_timeout, frames.recv()) => Some(received),
            };
            let Some(received) = received else {
                self.cancelled = true;
                break;
            };
            let frame = match received {
                Err(_) => {
                    warn!(request = %self.short(), "no upstream frame within the stream timeout");
                    self.emit(ProcessorEvent::Error(format!(
                        "Response timed out after {} seconds.",
                        frame_timeout.as_secs()
                    )));
                    break;
                }
                // Channel torn down underneath us: the request was cancelled
                // or force-terminated.
                Ok(None) => {
                    self.cancelled = true;
                    break;
                }
                Ok(Some(frame)) => frame,
            };

            match frame {
                ChannelFrame::Retry(retry) => {
                    info!(
                        request = %self.short(),
                        attempt = retry.attempt,
                        max = retry.max_attempts,
                        "user-script retry in progress"
                    );
                    if !self.emit(ProcessorEvent::Retry(retry)) {
                        break;
                    }
                }
                ChannelFrame::Error(message) => {
                    let friendly = self.classify_error(&message).await;
                    self.emit(ProcessorEvent::Error(friendly));
                    break;
                }
                ChannelFrame::Done => {
                    // Absorb one late frame, then flush whatever is left.
                    if let Ok(Some(ChannelFrame::Chunk(extra))) =
                        tokio::time::timeout(LATE_DATA_WINDOW, frames.recv()).await
                    {
                        let tokens = self.scanner.push(&extra);
                        if !self.handle_tokens(tokens).await {
                            break;
                        }
                    }
                    let tokens = self.scanner.drain();
                    self.handle_tokens(tokens).await;
                    break;
                }
                ChannelFrame::Chunk(text) => {
                    let tokens = self.scanner.push(&text);
                    if self.scanner.challenge_pending() {
                        let message = self.handle_challenge().await;
                        self.emit(ProcessorEvent::Error(message));
                        break;
                    }
                    if !self.handle_tokens(tokens).await {
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Deliver the token batch; returns false once the consumer went away.
    async fn handle_tokens(&mut self, tokens: Vec<ArenaToken>) -> bool {
        let mut batch_has_reasoning = false;
        for token in tokens {
            match token {
                ArenaToken::Reasoning(text) => {
                    if self.reasoning_ended {
                        warn!(
                            request = %self.short(),
                            "reasoning fragment after content; think-tag output may drop it"
                        );
                    }
                    self.has_reasoning = true;
                    batch_has_reasoning = true;
                    self.reasoning_parts.push(text.clone());
                    let config = self.state.config.config();
                    if config.enable_reasoning_output
                        && config.preserve_streaming
                        && !self.emit(ProcessorEvent::Reasoning(text))
                    {
                        return false;
                    }
                }
                ArenaToken::Text(text) => {
                    if self.has_reasoning && !self.reasoning_ended && !batch_has_reasoning {
                        self.reasoning_ended = true;
                        if self.state.config.config().enable_reasoning_output
                            && !self.emit(ProcessorEvent::ReasoningEnd)
                        {
                            return false;
                        }
                    }
                    if !self.emit(ProcessorEvent::Content(text)) {
                        return false;
                    }
                }
                ArenaToken::Image(url) => {
                    if !self.handle_image(url).await {
                        return false;
                    }
                }
                ArenaToken::Finish { reason, usage } => {
                    let usage = usage.as_ref().and_then(UsageTally::from_upstream);
                    if !self.emit(ProcessorEvent::Finish { reason, usage }) {
                        return false;
                    }
                }
                ArenaToken::Error(message) => {
                    let friendly = self.classify_error(&message).await;
                    self.emit(ProcessorEvent::Error(friendly));
                    return false;
                }
            }
        }
        true
    }

    /// Emit an image either as its URL or downloaded and inlined as base64,
    /// per configuration; local saving happens off the response path.
    async fn handle_image(&mut self, url: String) -> bool {
        let config = self.state.config.config();
        match config.image_return_format.mode {
            ImageReturnMode::Url => {
                if config.save_images_locally {
                    self.state.spawn_image_save(&self.request_id, url.clone());
                }
                self.emit(ProcessorEvent::Content(format!("![Image]({url})")))
            }
            ImageReturnMode::Base64 => {
                if let Some(cached) = self.state.image_cache.get(&url) {
                    return self.emit(ProcessorEvent::Content(cached));
                }
                match self.state.downloader.download(&url).await {
                    Ok(bytes) => {
                        if config.save_images_locally {
                            self.state
                                .spawn_image_save_bytes(&self.request_id, url.clone(), bytes.clone());
                        }
                        let mime = guess_mime(&url);
                        let markdown = format!(
                            "![Image]({})",
                            lmbridge_image::image_to_data_uri(&bytes, mime)
                        );
                        self.state.image_cache.insert(url, markdown.clone());
                        self.emit(ProcessorEvent::Content(markdown))
                    }
                    Err(err) => {
                        warn!(request = %self.short(), %err, "image download failed; relaying URL");
                        self.emit(ProcessorEvent::Content(format!("![Image]({url})")))
                    }
                }
            }
        }
    }

    async fn classify_error(&self, message: &str) -> String {
        if message.contains("413") || message.to_ascii_lowercase().contains("too large") {
            return "Upload failed: the attachment exceeds the upstream size limit \
                    (usually around 5MB). Compress the file or send a smaller one."
                .to_string();
        }
        if contains_challenge(message) {
            return self.handle_challenge().await;
        }
        message.to_string()
    }

    async fn handle_challenge(&self) -> String {
        let cooldown =
            Duration::from_secs(self.state.config.config().verification.cooldown_seconds);
        match self.state.verification.on_challenge(cooldown) {
            ChallengeAction::Refresh { message } => {
                if let Some((tab, sender)) = self.state.tabs.any_tab().await {
                    let refresh = serde_json::json!({"command": "refresh"}).to_string();
                    if sender.send(refresh).is_ok() {
                        info!(tab = %tab, "refresh command sent for verification challenge");
                    }
                }
                message
            }
            ChallengeAction::Wait { message } => message,
        }
    }

    fn emit(&mut self, event: ProcessorEvent) -> bool {
        if self.tx.send(event).is_err() {
            self.cancelled = true;
            false
        } else {
            true
        }
    }

    async fn finish(self) {
        let config = self.state.config.config();
        if !self.cancelled
            && config.enable_reasoning_output
            && self.has_reasoning
            && !config.preserve_streaming
        {
            let full = self.reasoning_parts.concat();
            let _ = self.tx.send(ProcessorEvent::ReasoningComplete(full));
        }

        if self.cancelled {
            self.state.cancel_to_tab(&self.request_id).await;
        }

        // Every terminal path gives the tab its slot back exactly once: the
        // metadata entry is the release token.
        if let Some(meta) = self.state.channels.metadata(&self.request_id)
            && let Some(tab) = meta.tab_id
        {
            self.state.tabs.release(&tab).await;
        }

        if self.cancelled {
            self.state.channels.remove_channel(&self.request_id);
            self.state.channels.remove_metadata(&self.request_id);
        } else {
            self.state
                .channels
                .remove_after_grace(&self.request_id, CHANNEL_GRACE);
        }
    }

    fn short(&self) -> &str {
        &self.request_id[..self.request_id.len().min(8)]
    }
}

fn guess_mime(url: &str) -> &'static str {
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}
