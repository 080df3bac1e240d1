use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use lmbridge_protocol::openai::types::ChatMessage;

/// Durable sink for finished requests (the SQLite log implements this).
/// Best-effort: a failing sink never affects the request path.
pub trait RequestLogSink: Send + Sync {
    fn write<'a>(&'a self, record: &'a RequestRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// One row of the durable request log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp: f64,
    pub date: String,
    pub model: String,
    pub status: String,
    pub success: bool,
    pub duration: f64,
    pub error: Option<String>,
    pub mode: Option<String>,
    pub session_id: Option<String>,
    pub messages_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub request_id: String,
    pub model: String,
    pub mode: Option<String>,
    pub session_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub params: serde_json::Value,
    pub started_at: OffsetDateTime,
}

/// Terminal report for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub response_content: Option<String>,
    pub reasoning_content: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost breakdown from the direct connector, already JSON-shaped.
    pub cost: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
struct Stats {
    total: u64,
    success: u64,
    failure: u64,
    per_model: HashMap<String, u64>,
}

/// Fingerprint of a resolved request kept for post-hoc inspection.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetails {
    pub request_id: String,
    pub model: String,
    pub success: bool,
    pub duration: f64,
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub response_content: Option<String>,
    pub reasoning_content: Option<String>,
    pub finished_at: String,
}

#[derive(Default)]
struct DetailsLru {
    entries: HashMap<String, RequestDetails>,
    order: VecDeque<String>,
    approx_bytes: usize,
}

/// Observability surface: active-request map, bounded details LRU, broadcast
/// channel to dashboards, and fan-out to durable sinks.
pub struct MonitoringService {
    active: Mutex<HashMap<String, ActiveRequest>>,
    details: Mutex<DetailsLru>,
    stats: Mutex<Stats>,
    tx: broadcast::Sender<String>,
    sinks: RwLock<Vec<Arc<dyn RequestLogSink>>>,
    log_dir: PathBuf,
    details_limit: usize,
    details_max_bytes: usize,
}

impl MonitoringService {
    pub fn new(log_dir: PathBuf, details_limit: usize, details_max_bytes: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            active: Mutex::new(HashMap::new()),
            details: Mutex::new(DetailsLru::default()),
            stats: Mutex::new(Stats::default()),
            tx,
            sinks: RwLock::new(Vec::new()),
            log_dir,
            details_limit: details_limit.max(1),
            details_max_bytes,
        }
    }

    pub async fn add_sink(&self, sink: Arc<dyn RequestLogSink>) {
        self.sinks.write().await.push(sink);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event: serde_json::Value) {
        let _ = self.tx.send(event.to_string());
    }

    pub fn request_start(
        &self,
        request_id: &str,
        model: &str,
        mode: Option<String>,
        session_id: Option<String>,
        messages: Vec<ChatMessage>,
        params: serde_json::Value,
    ) {
        let info = ActiveRequest {
            request_id: request_id.to_string(),
            model: model.to_string(),
            mode,
            session_id,
            messages,
            params,
            started_at: OffsetDateTime::now_utc(),
        };
        self.active
            .lock()
            .expect("active request lock")
            .insert(request_id.to_string(), info);
        self.broadcast(serde_json::json!({
            "type": "request_start",
            "request_id": request_id,
            "model": model,
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
        }));
    }

    pub fn active_request(&self, request_id: &str) -> Option<ActiveRequest> {
        self.active
            .lock()
            .expect("active request lock")
            .get(request_id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active request lock").len()
    }

    /// Active requests older than `max_age`; the sweeper force-terminates
    /// them through the state layer.
    pub fn stale_requests(&self, max_age: Duration) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        self.active
            .lock()
            .expect("active request lock")
            .values()
            .filter(|info| (now - info.started_at).unsigned_abs() > max_age)
            .map(|info| info.request_id.clone())
            .collect()
    }

    /// Report one terminal outcome. Exactly one of success/error/timeout/
    /// cancelled paths calls this per admitted request.
    pub fn request_end(self: &Arc<Self>, request_id: &str, outcome: RequestOutcome) {
        let Some(info) = self
            .active
            .lock()
            .expect("active request lock")
            .remove(request_id)
        else {
            debug!(request = request_id, "request_end for unknown request");
            return;
        };

        let finished_at = OffsetDateTime::now_utc();
        let duration = (finished_at - info.started_at).as_seconds_f64();

        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.total += 1;
            if outcome.success {
                stats.success += 1;
            } else {
                stats.failure += 1;
            }
            *stats.per_model.entry(info.model.clone()).or_insert(0) += 1;
        }

        let details = RequestDetails {
            request_id: request_id.to_string(),
            model: info.model.clone(),
            success: outcome.success,
            duration,
            error: outcome.error.clone(),
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            response_content: outcome.response_content.clone(),
            reasoning_content: outcome.reasoning_content.clone(),
            finished_at: finished_at.to_string(),
        };
        self.store_details(details);

        self.broadcast(serde_json::json!({
            "type": "request_end",
            "request_id": request_id,
            "success": outcome.success,
        }));

        let (input_cost, output_cost, total_cost, currency) = match &outcome.cost {
            Some(cost) => (
                cost.get("input_cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
                cost.get("output_cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
                cost.get("total_cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
                cost.get("currency")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            ),
            None => (0.0, 0.0, 0.0, None),
        };

        let record = RequestRecord {
            request_id: request_id.to_string(),
            timestamp: finished_at.unix_timestamp() as f64,
            date: format!(
                "{:04}-{:02}-{:02}",
                finished_at.year(),
                finished_at.month() as u8,
                finished_at.day()
            ),
            model: info.model.clone(),
            status: if outcome.success { "success" } else { "failed" }.to_string(),
            success: outcome.success,
            duration,
            error: outcome.error.clone(),
            mode: info.mode.clone(),
            session_id: info.session_id.clone(),
            messages_count: info.messages.len() as i64,
            input_tokens: outcome.input_tokens as i64,
            output_tokens: outcome.output_tokens as i64,
            total_tokens: (outcome.input_tokens + outcome.output_tokens) as i64,
            input_cost,
            output_cost,
            total_cost,
            currency,
        };

        // Durable writes ride on their own tasks; the request path never
        // waits on a sink.
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let sinks = service.sinks.read().await.clone();
            for sink in sinks {
                let record = record.clone();
                tokio::spawn(async move {
                    sink.write(&record).await;
                });
            }
            service.write_file_log(&record).await;
        });
    }

    fn store_details(&self, details: RequestDetails) {
        let mut lru = self.details.lock().expect("details lock");
        let size = approx_size(&details);
        if lru
            .entries
            .insert(details.request_id.clone(), details.clone())
            .is_none()
        {
            lru.order.push_back(details.request_id.clone());
            lru.approx_bytes += size;
        }

        while lru.entries.len() > self.details_limit {
            evict_one(&mut lru);
        }
        // Soft byte cap: shed the oldest tenth at once.
        if lru.approx_bytes > self.details_max_bytes {
            let shed = (lru.entries.len() / 10).max(1);
            for _ in 0..shed {
                evict_one(&mut lru);
            }
        }
    }

    pub fn request_details(&self, request_id: &str) -> Option<RequestDetails> {
        self.details
            .lock()
            .expect("details lock")
            .entries
            .get(request_id)
            .cloned()
    }

    pub fn details_count(&self) -> usize {
        self.details.lock().expect("details lock").entries.len()
    }

    pub fn summary(&self) -> serde_json::Value {
        let stats = self.stats.lock().expect("stats lock");
        serde_json::json!({
            "total_requests": stats.total,
            "success": stats.success,
            "failure": stats.failure,
            "active": self.active_count(),
            "per_model": stats.per_model,
        })
    }

    /// One JSON file per finished request under `logs/YYYYMMDD/HH/`.
    async fn write_file_log(&self, record: &RequestRecord) {
        let now = OffsetDateTime::now_utc();
        let dir = self
            .log_dir
            .join(format!("{:04}{:02}{:02}", now.year(), now.month() as u8, now.day()))
            .join(format!("{:02}", now.hour()));
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!(%err, "request log directory create failed");
            return;
        }
        let safe_model: String = record
            .model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let short = &record.request_id[..record.request_id.len().min(8)];
        let name = format!(
            "{safe_model}_{:04}{:02}{:02}_{:02}{:02}_{short}.json",
            now.year(),
            now.month() as u8,
            now.day(),
            now.hour(),
            now.minute()
        );
        match serde_json::to_vec_pretty(record) {
            Ok(body) => {
                if let Err(err) = tokio::fs::write(dir.join(name), body).await {
                    warn!(%err, "request log write failed");
                }
            }
            Err(err) => warn!(%err, "request log encode failed"),
        }
    }
}

fn evict_one(lru: &mut DetailsLru) {
    if let Some(oldest) = lru.order.pop_front()
        && let Some(evicted) = lru.entries.remove(&oldest)
    {
        lru.approx_bytes = lru.approx_bytes.saturating_sub(approx_size(&evicted));
    }
}

fn approx_size(details: &RequestDetails) -> usize {
    128 + details.response_content.as_deref().map_or(0, str::len)
        + details.reasoning_content.as_deref().map_or(0, str::len)
        + details.error.as_deref().map_or(0, str::len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(limit: usize, max_bytes: usize) -> Arc<MonitoringService> {
        Arc::new(MonitoringService::new(
            std::env::temp_dir().join("lmbridge-monitor-tests"),
            limit,
            max_bytes,
        ))
    }

    #[tokio::test]
    async fn end_moves_request_from_active_to_details() {
        let monitoring = service(100, usize::MAX);
        monitoring.request_start("r1", "m", None, None, Vec::new(), serde_json::json!({}));
        assert_eq!(monitoring.active_count(), 1);

        monitoring.request_end(
            "r1",
            RequestOutcome {
                success: true,
                response_content: Some("hello".to_string()),
                input_tokens: 3,
                output_tokens: 5,
                ..RequestOutcome::default()
            },
        );
        assert_eq!(monitoring.active_count(), 0);
        let details = monitoring.request_details("r1").unwrap();
        assert!(details.success);
        assert_eq!(details.output_tokens, 5);
    }

    #[tokio::test]
    async fn details_lru_enforces_item_cap() {
        let monitoring = service(3, usize::MAX);
        for i in 0..5 {
            let id = format!("r{i}");
            monitoring.request_start(&id, "m", None, None, Vec::new(), serde_json::json!({}));
            monitoring.request_end(&id, RequestOutcome::default());
        }
        assert_eq!(monitoring.details_count(), 3);
        assert!(monitoring.request_details("r0").is_none());
        assert!(monitoring.request_details("r4").is_some());
    }

    #[tokio::test]
    async fn broadcast_carries_start_and_end_events() {
        let monitoring = service(10, usize::MAX);
        let mut rx = monitoring.subscribe();
        monitoring.request_start("r1", "m", None, None, Vec::new(), serde_json::json!({}));
        monitoring.request_end("r1", RequestOutcome::default());

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "request_start");
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "request_end");
    }

    #[tokio::test]
    async fn stale_scan_finds_old_requests() {
        let monitoring = service(10, usize::MAX);
        monitoring.request_start("r1", "m", None, None, Vec::new(), serde_json::json!({}));
        assert!(monitoring.stale_requests(Duration::from_secs(600)).is_empty());
        assert_eq!(
            monitoring.stale_requests(Duration::from_secs(0)),
            vec!["r1".to_string()]
        );
    }
}
