use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use lmbridge_common::BridgeError;
use lmbridge_protocol::openai::request::ChatCompletionRequest;

use crate::respond::BridgeResponse;
use crate::state::AppState;

/// A request parked while no tab is connected. The admitting handler awaits
/// `responder`; the drain task resolves it once a tab comes back.
pub struct PendingItem {
    pub request: ChatCompletionRequest,
    pub original_request_id: Option<String>,
    pub responder: oneshot::Sender<Result<BridgeResponse, BridgeError>>,
}

#[derive(Default)]
pub struct PendingQueue {
    inner: Mutex<VecDeque<PendingItem>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: PendingItem) {
        let mut queue = self.inner.lock().expect("pending queue lock");
        queue.push_back(item);
        info!(queued = queue.len(), "request parked until a tab reconnects");
    }

    pub fn pop(&self) -> Option<PendingItem> {
        self.inner.lock().expect("pending queue lock").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerificationPhase {
    Idle,
    Refreshing,
    Cooldown,
}

#[derive(Debug)]
struct VerificationState {
    phase: VerificationPhase,
    cooldown_until: Option<Instant>,
}

/// What the stream parser should do about a detected challenge.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeAction {
    /// First sighting: tell a tab to refresh and start the cool-down.
    Refresh { message: String },
    /// Already cooling down; just report the remaining time.
    Wait { message: String },
}

/// Process-wide human-verification state machine:
/// IDLE → (challenge) → REFRESHING → (timer) → IDLE, with COOLDOWN gating
/// admissions; any fresh tab connection resets to IDLE.
pub struct VerificationGuard {
    inner: Mutex<VerificationState>,
}

impl Default for VerificationGuard {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VerificationState {
                phase: VerificationPhase::Idle,
                cooldown_until: None,
            }),
        }
    }
}

impl VerificationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining cool-down in whole seconds, if the gate is closed.
    pub fn remaining(&self) -> Option<u64> {
        let state = self.inner.lock().expect("verification lock");
        let until = state.cooldown_until?;
        let now = Instant::now();
        if until > now {
            Some((until - now).as_secs())
        } else {
            None
        }
    }

    /// Admission gate: while the cool-down runs, every tab-path request is
    /// rejected with the (skew-adjusted) remaining seconds.
    pub fn gate(&self, display_skew_seconds: u64) -> Result<(), BridgeError> {
        match self.remaining() {
            Some(remaining) => Err(BridgeError::VerificationChallenge {
                remaining_seconds: remaining.saturating_sub(display_skew_seconds),
            }),
            None => Ok(()),
        }
    }

    /// Record a detected challenge. Only the first sighting starts the
    /// cool-down (the caller refreshes the browser and schedules the reset).
    pub fn on_challenge(self: &Arc<Self>, cooldown: Duration) -> ChallengeAction {
        let mut state = self.inner.lock().expect("verification lock");
        match state.phase {
            VerificationPhase::Idle => {
                state.phase = VerificationPhase::Refreshing;
                state.cooldown_until = Some(Instant::now() + cooldown);
                drop(state);

                let guard = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    guard.timer_reset();
                });

                ChallengeAction::Refresh {
                    message: format!(
                        "Human verification challenge detected; a browser refresh was issued. \
                         Cooling down for {} seconds, please retry later.",
                        cooldown.as_secs()
                    ),
                }
            }
            VerificationPhase::Refreshing | VerificationPhase::Cooldown => {
                let remaining = state
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(0);
                ChallengeAction::Wait {
                    message: if remaining > 0 {
                        format!(
                            "Waiting for the human verification cool-down to finish... \
                             ({remaining}s remaining)"
                        )
                    } else {
                        "Waiting for human verification to complete...".to_string()
                    },
                }
            }
        }
    }

    fn timer_reset(&self) {
        let mut state = self.inner.lock().expect("verification lock");
        if state.phase != VerificationPhase::Idle {
            state.phase = VerificationPhase::Idle;
            state.cooldown_until = None;
            info!("verification cool-down elapsed; admissions reopened");
        }
    }

    /// A fresh tab connection means the challenge was solved (or never
    /// existed): clear everything.
    pub fn clear(&self) {
        let mut state = self.inner.lock().expect("verification lock");
        if state.phase != VerificationPhase::Idle || state.cooldown_until.is_some() {
            info!("new tab connection; verification state reset");
        }
        state.phase = VerificationPhase::Idle;
        state.cooldown_until = None;
    }
}

/// Periodic scan for requests stuck past the active-request timeout; each one
/// is force-terminated so its tab counter and channel are reclaimed.
pub async fn stale_request_sweeper(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let max_age = Duration::from_secs(state.config.config().active_request_timeout_seconds);
        let stale = state.monitoring.stale_requests(max_age);
        if stale.is_empty() {
            continue;
        }
        warn!(count = stale.len(), "force-terminating stale requests");
        for request_id in &stale {
            state
                .force_terminate(request_id, "request exceeded the active-request timeout")
                .await;
        }
        state.monitoring.broadcast(serde_json::json!({
            "type": "stale_requests_cleaned",
            "count": stale.len(),
        }));
    }
}

/// Idle self-restart: when no request has arrived for the configured window,
/// replace the process with a fresh image (same executable, same arguments).
pub async fn idle_restart_watchdog(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let config = state.config.config();
        if !config.enable_idle_restart || config.idle_restart_timeout_seconds < 0 {
            continue;
        }
        let timeout = Duration::from_secs(config.idle_restart_timeout_seconds as u64);
        if state.idle_for() > timeout {
            warn!(idle_seconds = state.idle_for().as_secs(), "idle timeout reached; restarting");
            restart_process();
        }
    }
}

fn restart_process() -> ! {
    let exe = std::env::current_exe().unwrap_or_else(|_| "lmbridge".into());
    let args: Vec<String> = std::env::args().skip(1).collect();
    match std::process::Command::new(&exe).args(&args).spawn() {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!(%err, "self-restart spawn failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_reports_skewed_remaining_and_reopens() {
        let guard = Arc::new(VerificationGuard::new());
        assert!(guard.gate(3).is_ok());

        let action = guard.on_challenge(Duration::from_millis(200));
        assert!(matches!(action, ChallengeAction::Refresh { .. }));

        match guard.gate(3) {
            Err(BridgeError::VerificationChallenge { remaining_seconds }) => {
                // 200ms cool-down rounds to 0s; the skew only subtracts.
                assert_eq!(remaining_seconds, 0);
            }
            other => panic!("expected gate rejection, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(guard.gate(3).is_ok());
    }

    #[tokio::test]
    async fn repeat_challenge_waits_instead_of_refreshing() {
        let guard = Arc::new(VerificationGuard::new());
        let first = guard.on_challenge(Duration::from_secs(25));
        let second = guard.on_challenge(Duration::from_secs(25));
        assert!(matches!(first, ChallengeAction::Refresh { .. }));
        assert!(matches!(second, ChallengeAction::Wait { .. }));
    }

    #[tokio::test]
    async fn new_connection_clears_cooldown() {
        let guard = Arc::new(VerificationGuard::new());
        guard.on_challenge(Duration::from_secs(25));
        assert!(guard.gate(0).is_err());
        guard.clear();
        assert!(guard.gate(0).is_ok());
    }

    #[test]
    fn pending_queue_is_fifo() {
        let queue = PendingQueue::new();
        for tag in ["a", "b"] {
            let (tx, _rx) = oneshot::channel();
            queue.push(PendingItem {
                request: serde_json::from_value(serde_json::json!({"model": tag})).unwrap(),
                original_request_id: None,
                responder: tx,
            });
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().request.model.as_deref(), Some("a"));
        assert_eq!(queue.pop().unwrap().request.model.as_deref(), Some("b"));
        assert!(queue.pop().is_none());
    }
}
