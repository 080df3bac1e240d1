use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{info, warn};

use lmbridge_config::{FilebedEndpoint, FilebedStrategy};

/// One file-host backend. Object-safe so tests can count calls.
pub trait ImageHost: Send + Sync {
    fn upload<'a>(
        &'a self,
        endpoint: &'a FilebedEndpoint,
        file_name: &'a str,
        data_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;
}

/// Real file-bed client: POST `{file_name, file_data, api_key}`, answer is
/// `{"success": true, "filename": "..."}` (or a ready-made `url`).
pub struct HttpImageHost {
    client: wreq::Client,
}

impl HttpImageHost {
    pub fn new(client: wreq::Client) -> Self {
        Self { client }
    }
}

impl ImageHost for HttpImageHost {
    fn upload<'a>(
        &'a self,
        endpoint: &'a FilebedEndpoint,
        file_name: &'a str,
        data_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "file_name": file_name,
                "file_data": data_uri,
                "api_key": endpoint.api_key,
            });
            let resp = self
                .client
                .post(&endpoint.url)
                .json(&body)
                .timeout(Duration::from_secs(60))
                .send()
                .await
                .map_err(|err| format!("upload request failed: {err}"))?;

            let status = resp.status().as_u16();
            let text = resp
                .text()
                .await
                .map_err(|err| format!("upload body read failed: {err}"))?;
            if status == 413 {
                return Err("upload rejected: payload too large (413)".to_string());
            }
            if !(200..300).contains(&status) {
                return Err(format!("upload failed: HTTP {status}: {text}"));
            }

            let parsed: serde_json::Value =
                serde_json::from_str(&text).map_err(|err| format!("upload reply not JSON: {err}"))?;
            if let Some(url) = parsed.get("url").and_then(|u| u.as_str()) {
                return Ok(url.to_string());
            }
            let filename = parsed
                .get("filename")
                .and_then(|f| f.as_str())
                .ok_or_else(|| format!("upload reply missing filename: {text}"))?;
            let base = endpoint
                .url
                .trim_end_matches('/')
                .strip_suffix("/upload")
                .unwrap_or(endpoint.url.trim_end_matches('/'))
                .to_string();
            Ok(format!("{base}/uploads/{filename}"))
        })
    }
}

/// Endpoint selection plus failure bookkeeping. Failed endpoints are held in
/// a disabled map and auto-rehabilitated after the recovery interval.
pub struct FilebedUploader {
    host: Box<dyn ImageHost>,
    disabled: Mutex<HashMap<String, Instant>>,
    cursor: Mutex<usize>,
}

impl FilebedUploader {
    pub fn new(host: Box<dyn ImageHost>) -> Self {
        Self {
            host,
            disabled: Mutex::new(HashMap::new()),
            cursor: Mutex::new(0),
        }
    }

    pub fn disabled_endpoints(&self) -> Vec<String> {
        self.disabled
            .lock()
            .expect("filebed disabled lock")
            .keys()
            .cloned()
            .collect()
    }

    fn rehabilitate(&self, recovery: Duration) {
        let mut disabled = self.disabled.lock().expect("filebed disabled lock");
        let recovered: Vec<String> = disabled
            .iter()
            .filter(|(_, at)| at.elapsed() >= recovery)
            .map(|(name, _)| name.clone())
            .collect();
        for name in recovered {
            disabled.remove(&name);
            info!(endpoint = %name, "file-bed endpoint rehabilitated");
        }
    }

    fn order<'a>(
        &self,
        active: &[&'a FilebedEndpoint],
        strategy: FilebedStrategy,
    ) -> Vec<&'a FilebedEndpoint> {
        let mut ordered: Vec<&FilebedEndpoint> = active.to_vec();
        match strategy {
            FilebedStrategy::Random => {
                ordered.shuffle(&mut rand::rng());
            }
            FilebedStrategy::RoundRobin => {
                let mut cursor = self.cursor.lock().expect("filebed cursor lock");
                let start = *cursor % ordered.len();
                ordered.rotate_left(start);
                *cursor += 1;
            }
            FilebedStrategy::Failover => {
                let cursor = self.cursor.lock().expect("filebed cursor lock");
                let start = *cursor % ordered.len();
                ordered.rotate_left(start);
            }
        }
        ordered
    }

    /// Try the configured endpoints in strategy order. Each failure disables
    /// that endpoint for `recovery`; when all fail the caller falls back to
    /// inline base64.
    pub async fn upload(
        &self,
        endpoints: &[FilebedEndpoint],
        strategy: FilebedStrategy,
        recovery: Duration,
        file_name: &str,
        data_uri: &str,
    ) -> Result<String, String> {
        self.rehabilitate(recovery);

        let disabled: Vec<String> = self.disabled_endpoints();
        let active: Vec<&FilebedEndpoint> = endpoints
            .iter()
            .filter(|ep| ep.enabled && !disabled.contains(&ep.name))
            .collect();
        if active.is_empty() {
            return Err("no active file-bed endpoint".to_string());
        }

        let ordered = self.order(&active, strategy);
        let mut last_error = String::new();
        for (attempt, endpoint) in ordered.iter().enumerate() {
            match self.host.upload(endpoint, file_name, data_uri).await {
                Ok(url) => {
                    info!(endpoint = %endpoint.name, "file-bed upload succeeded");
                    return Ok(url);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.name, %err, "file-bed upload failed; disabling endpoint");
                    self.disabled
                        .lock()
                        .expect("filebed disabled lock")
                        .insert(endpoint.name.clone(), Instant::now());
                    if strategy == FilebedStrategy::Failover && attempt == 0 {
                        // The preferred endpoint is down; start from the next
                        // one until it recovers.
                        *self.cursor.lock().expect("filebed cursor lock") += 1;
                    }
                    last_error = err;
                }
            }
        }
        Err(format!("all file-bed endpoints failed; last error: {last_error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHost {
        calls: AtomicUsize,
        fail_names: Vec<String>,
    }

    impl ImageHost for ScriptedHost {
        fn upload<'a>(
            &'a self,
            endpoint: &'a FilebedEndpoint,
            _file_name: &'a str,
            _data_uri: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_names.contains(&endpoint.name);
            let name = endpoint.name.clone();
            Box::pin(async move {
                if fail {
                    Err("HTTP 500".to_string())
                } else {
                    Ok(format!("https://host/{name}/file.png"))
                }
            })
        }
    }

    fn endpoints() -> Vec<FilebedEndpoint> {
        vec![
            FilebedEndpoint {
                name: "primary".to_string(),
                url: "https://a/upload".to_string(),
                ..FilebedEndpoint::default()
            },
            FilebedEndpoint {
                name: "backup".to_string(),
                url: "https://b/upload".to_string(),
                ..FilebedEndpoint::default()
            },
        ]
    }

    #[tokio::test]
    async fn failing_endpoint_is_disabled_and_next_tried() {
        let uploader = FilebedUploader::new(Box::new(ScriptedHost {
            calls: AtomicUsize::new(0),
            fail_names: vec!["primary".to_string()],
        }));
        let url = uploader
            .upload(
                &endpoints(),
                FilebedStrategy::Failover,
                Duration::from_secs(300),
                "x.png",
                "data:image/png;base64,AA==",
            )
            .await
            .unwrap();
        assert!(url.contains("backup"));
        assert_eq!(uploader.disabled_endpoints(), vec!["primary".to_string()]);
    }

    #[tokio::test]
    async fn disabled_endpoint_is_skipped_until_recovery() {
        let uploader = FilebedUploader::new(Box::new(ScriptedHost {
            calls: AtomicUsize::new(0),
            fail_names: vec!["primary".to_string()],
        }));
        let eps = endpoints();
        let _ = uploader
            .upload(&eps, FilebedStrategy::Failover, Duration::from_secs(300), "x", "d")
            .await;

        // Second upload must not touch the disabled primary.
        let url = uploader
            .upload(&eps, FilebedStrategy::RoundRobin, Duration::from_secs(300), "x", "d")
            .await
            .unwrap();
        assert!(url.contains("backup"));

        // Zero recovery interval rehabilitates it immediately.
        uploader.rehabilitate(Duration::from_secs(0));
        assert!(uploader.disabled_endpoints().is_empty());
    }

    #[tokio::test]
    async fn all_endpoints_failing_reports_error() {
        let uploader = FilebedUploader::new(Box::new(ScriptedHost {
            calls: AtomicUsize::new(0),
            fail_names: vec!["primary".to_string(), "backup".to_string()],
        }));
        let err = uploader
            .upload(
                &endpoints(),
                FilebedStrategy::Random,
                Duration::from_secs(300),
                "x",
                "d",
            )
            .await
            .unwrap_err();
        assert!(err.contains("all file-bed endpoints failed"));
    }
}
