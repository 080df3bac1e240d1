use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::{error, info, warn};

use lmbridge_config::{BridgeConfig, ConfigStore};
use lmbridge_image::{
    FilebedUploader, HttpImageHost, ImageDownloader, ImagePipeline, ProcessedImageCache,
    save_image_locally,
};
use lmbridge_protocol::wire::{RequestEnvelope, RetryConfig, TabCommand};

use crate::channels::ChannelBroker;
use crate::http::BridgeHttpClient;
use crate::lifecycle::{PendingQueue, VerificationGuard};
use crate::monitoring::{MonitoringService, RequestOutcome};
use crate::tabs::TabRegistry;
use crate::translate::{TranslationInput, build_arena_payload};

/// Record captured by the id-capture flow and shown by the admin surface.
#[derive(Debug, Clone, Default)]
pub struct CaptureState {
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub mode: Option<String>,
    pub battle_target: Option<String>,
    pub captured_at: Option<OffsetDateTime>,
}

/// Process-wide services. Everything mutable lives behind an explicit
/// service object; cross-references are by id, never by pointer graph.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub tabs: TabRegistry,
    pub channels: Arc<ChannelBroker>,
    pub monitoring: Arc<MonitoringService>,
    pub verification: Arc<VerificationGuard>,
    pub pending: PendingQueue,
    pub images: ImagePipeline,
    pub downloader: Arc<ImageDownloader>,
    /// Downloaded arena images, keyed by source URL (base64 return mode).
    pub image_cache: ProcessedImageCache,
    pub http: BridgeHttpClient,
    pub capture: Mutex<CaptureState>,
    pub image_dir: PathBuf,
    last_activity: Mutex<Instant>,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigStore>,
        monitoring: Arc<MonitoringService>,
        data_dir: PathBuf,
    ) -> Result<Arc<Self>, String> {
        let snapshot = config.config();
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(snapshot.download_timeout.connect))
            .build()
            .map_err(|err| format!("http client build failed: {err}"))?;

        let cache = ProcessedImageCache::new(
            Duration::from_secs(snapshot.processed_image_cache.ttl_seconds),
            snapshot.processed_image_cache.max_size,
        );
        let uploader = FilebedUploader::new(Box::new(HttpImageHost::new(client.clone())));
        let downloader = Arc::new(ImageDownloader::new(
            client.clone(),
            snapshot.max_concurrent_downloads,
            snapshot.download_timeout.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            tabs: TabRegistry::new(),
            channels: Arc::new(ChannelBroker::new()),
            monitoring,
            verification: Arc::new(VerificationGuard::new()),
            pending: PendingQueue::new(),
            images: ImagePipeline::new(cache, uploader),
            downloader,
            image_cache: ProcessedImageCache::new(Duration::from_secs(3600), 1000),
            http: BridgeHttpClient::new(client, Duration::from_secs(30)),
            capture: Mutex::new(CaptureState::default()),
            image_dir: data_dir.join("downloaded_images"),
            last_activity: Mutex::new(Instant::now()),
        }))
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    pub fn retry_config(&self, config: &BridgeConfig) -> RetryConfig {
        let retry = &config.empty_response_retry;
        RetryConfig {
            enabled: retry.enabled,
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            show_retry_info: retry.show_retry_info_to_client,
        }
    }

    /// Tell the tab currently owning a request to abort its fetch.
    pub async fn cancel_to_tab(&self, request_id: &str) {
        let Some(meta) = self.channels.metadata(request_id) else {
            return;
        };
        let Some(tab_id) = meta.tab_id else {
            return;
        };
        let command = TabCommand::CancelRequest {
            request_id: request_id.to_string(),
        };
        let Ok(frame) = serde_json::to_string(&command) else {
            return;
        };
        if self.tabs.send_to(&tab_id, frame).await {
            info!(request = %short(request_id), tab = %tab_id, "cancel command sent");
        }
    }

    /// Sweeper entry point: reclaim a stuck request exactly once.
    pub async fn force_terminate(&self, request_id: &str, reason: &str) {
        self.monitoring.request_end(
            request_id,
            RequestOutcome {
                success: false,
                error: Some(reason.to_string()),
                ..RequestOutcome::default()
            },
        );
        if let Some(meta) = self.channels.metadata(request_id) {
            if let Some(tab) = &meta.tab_id {
                self.tabs.release(tab).await;
            }
            // Removing the metadata first stops the processor from releasing
            // the counter a second time.
            self.channels.remove_metadata(request_id);
        }
        self.channels.push_error_and_done(request_id, reason);
        self.channels.remove_channel(request_id);
    }

    /// §4.D reassignment: migrate every request owned by a dead tab onto the
    /// least-loaded survivor, or terminate those out of transfer budget.
    pub async fn reassign_pending(self: &Arc<Self>, dead_tab: &str) {
        if self.tabs.connected_count().await == 0 {
            warn!(tab = dead_tab, "no surviving tab; pending requests cannot move");
            return;
        }

        let config = self.config.config();
        let max_transfers = config.max_request_transfers;
        let orphans = self.channels.owned_by(dead_tab);
        if orphans.is_empty() {
            return;
        }
        info!(tab = dead_tab, count = orphans.len(), "reassigning orphaned requests");

        for meta in orphans {
            let request_id = meta.request_id.clone();
            if meta.transfer_count >= max_transfers {
                warn!(
                    request = %short(&request_id),
                    transfers = meta.transfer_count,
                    "transfer budget exhausted; failing request"
                );
                self.channels.push_error_and_done(
                    &request_id,
                    format!("Request failed after {max_transfers} transfer attempts"),
                );
                self.channels.remove_metadata(&request_id);
                continue;
            }

            let Some((target_tab, sender)) = self.tabs.peek_least_loaded().await else {
                self.channels
                    .push_error_and_done(&request_id, "Request reassignment failed: no tab");
                continue;
            };

            let original_tab = meta
                .original_tab_id
                .clone()
                .unwrap_or_else(|| dead_tab.to_string());
            let next_count = meta.transfer_count + 1;

            let input = TranslationInput {
                request: &meta.openai_request,
                session_id: &meta.session_id,
                mode_override: meta.mode_override,
                battle_target_override: meta.battle_target_override.as_deref(),
                model_kind: meta.model_kind,
                target_model_id: meta.target_model_id.clone(),
            };
            let payload = match build_arena_payload(&input, &config) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(request = %short(&request_id), %err, "re-translation failed");
                    self.channels
                        .push_error_and_done(&request_id, format!("Request reassignment failed: {err}"));
                    continue;
                }
            };

            let envelope = RequestEnvelope {
                request_id: request_id.clone(),
                payload,
                retry_config: self.retry_config(&config),
                is_transfer: Some(true),
                original_tab_id: Some(original_tab.clone()),
                transfer_count: Some(next_count),
            };
            let Ok(frame) = serde_json::to_string(&envelope) else {
                self.channels
                    .push_error_and_done(&request_id, "Request reassignment failed: encode error");
                continue;
            };

            if sender.send(frame).is_err() {
                self.channels
                    .push_error_and_done(&request_id, "Request reassignment failed: tab send error");
                continue;
            }

            self.channels.with_metadata_mut(&request_id, |m| {
                m.tab_id = Some(target_tab.clone());
                m.original_tab_id = Some(original_tab.clone());
                m.transfer_count = next_count;
                m.transfer_allowed = true;
            });
            self.tabs.increment(&target_tab).await;
            info!(
                request = %short(&request_id),
                from = dead_tab,
                to = %target_tab,
                transfers = next_count,
                "request transferred"
            );
        }
    }

    /// Fire-and-forget local save for a URL-mode image.
    pub fn spawn_image_save(self: &Arc<Self>, request_id: &str, url: String) {
        let state = Arc::clone(self);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            match state.downloader.download(&url).await {
                Ok(bytes) => {
                    let config = state.config.config();
                    save_image_locally(
                        state.image_dir.clone(),
                        bytes,
                        &url,
                        &request_id,
                        &config.local_save_format,
                    )
                    .await;
                }
                Err(err) => warn!(%err, "background image download failed"),
            }
        });
    }

    /// Same, when the bytes are already in hand.
    pub fn spawn_image_save_bytes(self: &Arc<Self>, request_id: &str, url: String, bytes: Vec<u8>) {
        let state = Arc::clone(self);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            let config = state.config.config();
            save_image_locally(
                state.image_dir.clone(),
                bytes,
                &url,
                &request_id,
                &config.local_save_format,
            )
            .await;
        });
    }
}

fn short(request_id: &str) -> &str {
    &request_id[..request_id.len().min(8)]
}
