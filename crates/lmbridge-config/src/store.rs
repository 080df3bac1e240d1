use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binding::{EndpointEntry, ModelKind};
use crate::jsonc::parse_jsonc;
use crate::types::BridgeConfig;

/// The three hot-reloadable files.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config: PathBuf,
    pub endpoint_map: PathBuf,
    pub model_map: PathBuf,
}

impl ConfigPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            config: dir.join("config.jsonc"),
            endpoint_map: dir.join("model_endpoint_map.json"),
            model_map: dir.join("models.json"),
        }
    }
}

/// Entry of the optional `models.json` fallback map. The file value is either
/// a plain id or an `"id:type"` string (`"null"` id meaning none).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackModel {
    pub id: Option<String>,
    pub kind: ModelKind,
}

impl FallbackModel {
    fn from_raw(raw: &serde_json::Value) -> Self {
        let Some(text) = raw.as_str() else {
            return FallbackModel::default();
        };
        match text.split_once(':') {
            Some((id, kind)) => FallbackModel {
                id: (!id.eq_ignore_ascii_case("null")).then(|| id.to_string()),
                kind: match kind {
                    "image" => ModelKind::Image,
                    "search" => ModelKind::Search,
                    _ => ModelKind::Text,
                },
            },
            None => FallbackModel {
                id: Some(text.to_string()),
                kind: ModelKind::Text,
            },
        }
    }
}

/// Hot-reloadable configuration store. Readers take consistent snapshots;
/// a failed reload keeps the previous snapshot in place.
pub struct ConfigStore {
    paths: ConfigPaths,
    config: ArcSwap<BridgeConfig>,
    endpoints: ArcSwap<HashMap<String, EndpointEntry>>,
    models: ArcSwap<HashMap<String, FallbackModel>>,
    mtimes: Mutex<HashMap<PathBuf, SystemTime>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl ConfigStore {
    pub fn load(paths: ConfigPaths) -> Self {
        let store = Self {
            paths,
            config: ArcSwap::from_pointee(BridgeConfig::default()),
            endpoints: ArcSwap::from_pointee(HashMap::new()),
            models: ArcSwap::from_pointee(HashMap::new()),
            mtimes: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        };
        store.force_reload();
        store
    }

    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config.load_full()
    }

    pub fn endpoints(&self) -> Arc<HashMap<String, EndpointEntry>> {
        self.endpoints.load_full()
    }

    pub fn fallback_models(&self) -> Arc<HashMap<String, FallbackModel>> {
        self.models.load_full()
    }

    pub fn get_endpoint(&self, model: &str) -> Option<EndpointEntry> {
        self.endpoints.load().get(model).cloned()
    }

    /// Ids served by `GET /v1/models`: endpoint-map keys when the map is
    /// non-empty, otherwise the fallback model map.
    pub fn model_names(&self) -> Vec<String> {
        let endpoints = self.endpoints.load();
        let mut names: Vec<String> = if endpoints.is_empty() {
            self.models.load().keys().cloned().collect()
        } else {
            endpoints.keys().cloned().collect()
        };
        names.sort();
        names
    }

    /// Current cursor for a pool of `len` bindings without advancing it.
    pub fn peek_round_robin(&self, model: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cursors = self.cursors.lock().expect("round-robin cursor lock");
        cursors.get(model).copied().unwrap_or(0) % len
    }

    /// Advance the cursor. Called once the request has actually been
    /// enqueued, so a stuck binding cannot starve the rest of the pool.
    pub fn advance_round_robin(&self, model: &str) {
        let len = match self.endpoints.load().get(model) {
            Some(EndpointEntry::Pool(bindings)) if !bindings.is_empty() => bindings.len(),
            _ => return,
        };
        let mut cursors = self.cursors.lock().expect("round-robin cursor lock");
        let slot = cursors.entry(model.to_string()).or_insert(0);
        *slot = (*slot + 1) % len;
    }

    pub fn force_reload(&self) {
        self.reload_config(true);
        self.reload_endpoints(true);
        self.reload_models(true);
    }

    /// Reload any file whose mtime moved; returns the file names that were
    /// actually re-read.
    pub fn reload_if_changed(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.reload_config(false) {
            changed.push("config.jsonc");
        }
        if self.reload_endpoints(false) {
            changed.push("model_endpoint_map.json");
        }
        if self.reload_models(false) {
            changed.push("models.json");
        }
        changed
    }

    /// Persist one model binding into the endpoint map file and swap the new
    /// map in (used by the id-capture flow).
    pub fn upsert_endpoint(&self, model: &str, entry: EndpointEntry) -> std::io::Result<()> {
        let mut map = self.endpoints.load().as_ref().clone();
        map.insert(model.to_string(), entry);
        let text = serde_json::to_string_pretty(&map)?;
        std::fs::write(&self.paths.endpoint_map, text)?;
        if let Ok(meta) = std::fs::metadata(&self.paths.endpoint_map)
            && let Ok(modified) = meta.modified()
        {
            self.mtimes
                .lock()
                .expect("config mtime lock")
                .insert(self.paths.endpoint_map.clone(), modified);
        }
        self.endpoints.store(Arc::new(map));
        info!(model, "model binding saved");
        Ok(())
    }

    fn file_changed(&self, path: &Path, force: bool) -> Option<SystemTime> {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        if force {
            return Some(modified);
        }
        let mtimes = self.mtimes.lock().expect("config mtime lock");
        (mtimes.get(path) != Some(&modified)).then_some(modified)
    }

    fn record_mtime(&self, path: &Path, modified: SystemTime) {
        self.mtimes
            .lock()
            .expect("config mtime lock")
            .insert(path.to_path_buf(), modified);
    }

    fn reload_config(&self, force: bool) -> bool {
        let path = self.paths.config.clone();
        let Some(modified) = self.file_changed(&path, force) else {
            return false;
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), %err, "config read failed; keeping previous");
                return false;
            }
        };
        match parse_jsonc::<BridgeConfig>(&text) {
            Ok(config) => {
                self.config.store(Arc::new(config));
                self.record_mtime(&path, modified);
                info!(path = %path.display(), "configuration loaded");
                true
            }
            Err(err) => {
                // Keep the previous snapshot; mtime stays stale so the next
                // cycle retries.
                warn!(path = %path.display(), %err, "config reload failed; keeping previous");
                false
            }
        }
    }

    fn reload_endpoints(&self, force: bool) -> bool {
        let path = self.paths.endpoint_map.clone();
        let Some(modified) = self.file_changed(&path, force) else {
            return false;
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), %err, "endpoint map read failed; keeping previous");
                return false;
            }
        };
        if text.trim().is_empty() {
            self.endpoints.store(Arc::new(HashMap::new()));
            self.record_mtime(&path, modified);
            return true;
        }
        match serde_json::from_str::<HashMap<String, EndpointEntry>>(&text) {
            Ok(map) => {
                let count = map.len();
                self.endpoints.store(Arc::new(map));
                self.record_mtime(&path, modified);
                info!(count, "model endpoint map loaded");
                true
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "endpoint map reload failed; keeping previous");
                false
            }
        }
    }

    fn reload_models(&self, force: bool) -> bool {
        let path = self.paths.model_map.clone();
        let Some(modified) = self.file_changed(&path, force) else {
            return false;
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), %err, "model map read failed; keeping previous");
                return false;
            }
        };
        if text.trim().is_empty() {
            self.models.store(Arc::new(HashMap::new()));
            self.record_mtime(&path, modified);
            return true;
        }
        match serde_json::from_str::<HashMap<String, serde_json::Value>>(&text) {
            Ok(raw) => {
                let map: HashMap<String, FallbackModel> = raw
                    .iter()
                    .map(|(name, value)| (name.clone(), FallbackModel::from_raw(value)))
                    .collect();
                let count = map.len();
                self.models.store(Arc::new(map));
                self.record_mtime(&path, modified);
                info!(count, "fallback model map loaded");
                true
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "model map reload failed; keeping previous");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_model_parses_id_type_syntax() {
        let m = FallbackModel::from_raw(&serde_json::json!("abc123:image"));
        assert_eq!(m.id.as_deref(), Some("abc123"));
        assert_eq!(m.kind, ModelKind::Image);

        let m = FallbackModel::from_raw(&serde_json::json!("null:search"));
        assert_eq!(m.id, None);
        assert_eq!(m.kind, ModelKind::Search);

        let m = FallbackModel::from_raw(&serde_json::json!("plain-id"));
        assert_eq!(m.id.as_deref(), Some("plain-id"));
        assert_eq!(m.kind, ModelKind::Text);
    }
}
