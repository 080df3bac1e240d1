use std::collections::HashMap;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use lmbridge_common::{BridgeError, TabId};

/// Browser HTTP/1.1 per-origin concurrency; advisory only, the balancer does
/// not block past it.
pub const TAB_CAPACITY: usize = 6;

const SELECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound half of one tab connection: serialized JSON frames consumed by
/// the socket writer task.
pub type TabSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct RegistryInner {
    tabs: HashMap<TabId, TabSender>,
    counts: HashMap<TabId, usize>,
    connected_at: HashMap<TabId, OffsetDateTime>,
    /// Legacy "default" slot kept pointed at some live tab.
    default_tab: Option<TabId>,
}

/// Connected-tab registry plus the per-tab in-flight counters used for
/// least-loaded selection.
#[derive(Default)]
pub struct TabRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug)]
pub struct DisconnectSummary {
    pub residual_in_flight: usize,
    pub remaining_tabs: usize,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a tab connection. Returns the new tab count.
    pub async fn register(&self, tab_id: &str, sender: TabSender) -> usize {
        let mut inner = self.inner.lock().await;
        if inner.tabs.insert(tab_id.to_string(), sender).is_some() {
            warn!(tab = tab_id, "existing tab connection replaced");
        }
        inner
            .connected_at
            .insert(tab_id.to_string(), OffsetDateTime::now_utc());
        if inner.default_tab.is_none() || tab_id == lmbridge_common::DEFAULT_TAB_ID {
            inner.default_tab = Some(tab_id.to_string());
        }
        let total = inner.tabs.len();
        info!(
            tab = tab_id,
            tabs = total,
            capacity = total * TAB_CAPACITY,
            "tab connected"
        );
        total
    }

    /// Pick the least-loaded connected tab and account one request to it.
    /// The whole operation is bounded by a 5 s timeout so a wedged lock
    /// surfaces as service-unavailable instead of a hang.
    pub async fn select_best_tab(&self) -> Result<(TabId, TabSender), BridgeError> {
        let selection = tokio::time::timeout(SELECT_TIMEOUT, async {
            let mut inner = self.inner.lock().await;
            if inner.tabs.is_empty() {
                return Err(BridgeError::NoTabConnected);
            }

            // Sweep counters for tabs that are no longer connected, then make
            // sure every live tab has one.
            let live: Vec<TabId> = inner.tabs.keys().cloned().collect();
            inner.counts.retain(|tab, _| live.contains(tab));
            for tab in &live {
                inner.counts.entry(tab.clone()).or_insert(0);
            }

            let best = live
                .iter()
                .min_by_key(|tab| (inner.counts.get(*tab).copied().unwrap_or(0), (*tab).clone()))
                .cloned()
                .ok_or(BridgeError::NoTabConnected)?;

            let count = inner.counts.entry(best.clone()).or_insert(0);
            *count += 1;
            if *count > TAB_CAPACITY {
                warn!(tab = %best, in_flight = *count, "tab above advisory capacity");
            }
            let sender = inner.tabs.get(&best).cloned().ok_or(BridgeError::NoTabConnected)?;
            Ok((best, sender))
        })
        .await;

        match selection {
            Ok(result) => result,
            Err(_) => {
                warn!("tab selection timed out; registry may be deadlocked");
                self.dump_state().await;
                Err(BridgeError::TabLockTimeout)
            }
        }
    }

    /// Least-loaded tab without incrementing; used by the reassignment path
    /// which accounts the request itself.
    pub async fn peek_least_loaded(&self) -> Option<(TabId, TabSender)> {
        let inner = self.inner.lock().await;
        let best = inner
            .tabs
            .keys()
            .min_by_key(|tab| (inner.counts.get(*tab).copied().unwrap_or(0), (*tab).clone()))
            .cloned()?;
        let sender = inner.tabs.get(&best).cloned()?;
        Some((best, sender))
    }

    pub async fn increment(&self, tab_id: &str) {
        let mut inner = self.inner.lock().await;
        *inner.counts.entry(tab_id.to_string()).or_insert(0) += 1;
    }

    /// Release one accounted request, clamped at zero.
    pub async fn release(&self, tab_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(count) = inner.counts.get_mut(tab_id)
            && *count > 0
        {
            *count -= 1;
        }
    }

    /// Disconnect protocol: drop the counter (logging any residual), drop the
    /// tab, and point the legacy default slot at a surviving tab.
    pub async fn remove(&self, tab_id: &str) -> DisconnectSummary {
        let mut inner = self.inner.lock().await;
        let residual = inner.counts.remove(tab_id).unwrap_or(0);
        if residual > 0 {
            warn!(tab = tab_id, residual, "tab disconnected with in-flight requests");
        }
        inner.tabs.remove(tab_id);
        inner.connected_at.remove(tab_id);
        if inner.default_tab.as_deref() == Some(tab_id) {
            inner.default_tab = inner.tabs.keys().next().cloned();
        }
        DisconnectSummary {
            residual_in_flight: residual,
            remaining_tabs: inner.tabs.len(),
        }
    }

    pub async fn send_to(&self, tab_id: &str, frame: String) -> bool {
        let sender = {
            let inner = self.inner.lock().await;
            inner.tabs.get(tab_id).cloned()
        };
        match sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Some live tab (the legacy default slot), e.g. for the refresh command.
    pub async fn any_tab(&self) -> Option<(TabId, TabSender)> {
        let inner = self.inner.lock().await;
        let tab = inner
            .default_tab
            .clone()
            .filter(|tab| inner.tabs.contains_key(tab))
            .or_else(|| inner.tabs.keys().next().cloned())?;
        let sender = inner.tabs.get(&tab).cloned()?;
        Some((tab, sender))
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.lock().await.tabs.len()
    }

    pub async fn in_flight(&self, tab_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .counts
            .get(tab_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_in_flight(&self) -> usize {
        self.inner.lock().await.counts.values().sum()
    }

    async fn dump_state(&self) {
        // Best effort; if the lock is truly wedged this also times out.
        if let Ok(inner) = tokio::time::timeout(Duration::from_millis(100), self.inner.lock()).await
        {
            warn!(tabs = inner.tabs.len(), counts = ?inner.counts, "registry state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> TabSender {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn selection_prefers_least_loaded() {
        let registry = TabRegistry::new();
        registry.register("t1", sender()).await;
        registry.register("t2", sender()).await;

        let (first, _) = registry.select_best_tab().await.unwrap();
        let (second, _) = registry.select_best_tab().await.unwrap();
        // Two selections land on the two different tabs.
        assert_ne!(first, second);
        assert_eq!(registry.total_in_flight().await, 2);

        registry.release(&first).await;
        let (third, _) = registry.select_best_tab().await.unwrap();
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn empty_registry_rejects_selection() {
        let registry = TabRegistry::new();
        assert!(matches!(
            registry.select_best_tab().await,
            Err(BridgeError::NoTabConnected)
        ));
    }

    #[tokio::test]
    async fn release_clamps_at_zero() {
        let registry = TabRegistry::new();
        registry.register("t1", sender()).await;
        registry.release("t1").await;
        assert_eq!(registry.in_flight("t1").await, 0);
    }

    #[tokio::test]
    async fn stale_counters_are_swept_on_selection() {
        let registry = TabRegistry::new();
        registry.register("t1", sender()).await;
        registry.increment("ghost").await;
        let (tab, _) = registry.select_best_tab().await.unwrap();
        assert_eq!(tab, "t1");
        assert_eq!(registry.in_flight("ghost").await, 0);
        assert_eq!(registry.total_in_flight().await, 1);
    }

    #[tokio::test]
    async fn disconnect_reports_residual_and_promotes_default() {
        let registry = TabRegistry::new();
        registry.register("t1", sender()).await;
        registry.register("t2", sender()).await;
        registry.increment("t1").await;

        let summary = registry.remove("t1").await;
        assert_eq!(summary.residual_in_flight, 1);
        assert_eq!(summary.remaining_tabs, 1);
        let (promoted, _) = registry.any_tab().await.unwrap();
        assert_eq!(promoted, "t2");
    }
}
