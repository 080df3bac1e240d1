use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Content-hash cache of processed image outputs (file-bed URL or data URI),
/// keyed by sha256 of the base64 payload. TTL'd, with oldest-first eviction
/// past the size cap.
pub struct ProcessedImageCache {
    ttl: Duration,
    max_size: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, (String, Instant)>,
    order: VecDeque<String>,
}

/// Hash the payload without decoding it; a data-URI prefix is stripped so the
/// same bytes always produce the same key.
pub fn content_hash(base64_payload: &str) -> String {
    let data = match base64_payload.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => base64_payload,
    };
    let digest = Sha256::digest(data.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

impl ProcessedImageCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size: max_size.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("image cache lock");
        let (value, stored_at) = inner.entries.get(key)?;
        if stored_at.elapsed() >= self.ttl {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        Some(value.clone())
    }

    pub fn insert(&self, key: String, value: String) {
        let mut inner = self.inner.lock().expect("image cache lock");
        if inner.entries.insert(key.clone(), (value, Instant::now())).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.max_size {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("image cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_data_uri_header() {
        let bare = content_hash("aGVsbG8=");
        let uri = content_hash("data:image/png;base64,aGVsbG8=");
        assert_eq!(bare, uri);
        assert_eq!(bare.len(), 64);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ProcessedImageCache::new(Duration::from_millis(0), 10);
        cache.insert("k".to_string(), "v".to_string());
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn size_cap_evicts_oldest() {
        let cache = ProcessedImageCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), "1".to_string());
        cache.insert("b".to_string(), "2".to_string());
        cache.insert("c".to_string(), "3".to_string());
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }
}
