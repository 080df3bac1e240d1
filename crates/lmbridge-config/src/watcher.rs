use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::store::ConfigStore;

/// Poll the config files for modification and hot-swap changed ones.
/// The original service checked every 30 s; callers pass the period so tests
/// can tighten it.
pub async fn watch_config_files(store: Arc<ConfigStore>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; files were just loaded.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let changed = store.reload_if_changed();
        if !changed.is_empty() {
            info!(files = ?changed, "configuration files reloaded");
        }
    }
}
