use std::time::Duration;

use tracing::{info, warn};

use lmbridge_config::{BridgeConfig, ImageCompression};

use crate::cache::{ProcessedImageCache, content_hash};
use crate::filebed::FilebedUploader;
use crate::optimize::{decode_base64_image, image_to_data_uri, mime_for_format, optimize_image};

/// The §4.B contract: hash-cache lookup, decode, optimize, host upload with
/// failover, base64 fallback, cache store.
pub struct ImagePipeline {
    cache: ProcessedImageCache,
    uploader: FilebedUploader,
}

impl ImagePipeline {
    pub fn new(cache: ProcessedImageCache, uploader: FilebedUploader) -> Self {
        Self { cache, uploader }
    }

    /// Process one base64 image payload. Returns the output (URL or data URI)
    /// plus an optional diagnostic; on failure the original payload comes
    /// back unchanged with the diagnostic set.
    pub async fn process_image(
        &self,
        payload: &str,
        file_name: &str,
        request_id: &str,
        config: &BridgeConfig,
        model_cfg: Option<&ImageCompression>,
    ) -> (String, Option<String>) {
        let cache_cfg = &config.processed_image_cache;
        let key = cache_cfg.enabled.then(|| content_hash(payload));

        if let Some(key) = &key
            && let Some(hit) = self.cache.get(key)
        {
            info!(request = %&request_id[..request_id.len().min(8)], "image cache hit");
            return (hit, None);
        }

        let decoded = match decode_base64_image(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "image decode failed; passing payload through");
                return (payload.to_string(), Some(err));
            }
        };

        let effective = config.image_optimization.merged_with(model_cfg);
        let (mut bytes, mut format) = (decoded.bytes, decoded.format);
        if effective.enabled {
            // Pixel work happens off the event loop.
            let cfg = effective.clone();
            let input = bytes.clone();
            let result = tokio::task::spawn_blocking(move || optimize_image(&input, &cfg, format))
                .await
                .unwrap_or_else(|err| Err(format!("optimize task failed: {err}")));
            match result {
                Ok((optimized, out_format)) => {
                    bytes = optimized;
                    format = out_format;
                }
                // Optimization errors fall through to the unoptimized bytes.
                Err(err) => warn!(%err, "image optimization failed; using original bytes"),
            }
        }

        let mime = mime_for_format(format);
        let output = if config.file_bed_enabled {
            let data_uri = image_to_data_uri(&bytes, mime);
            match self
                .uploader
                .upload(
                    &config.file_bed_endpoints,
                    config.file_bed_selection_strategy,
                    Duration::from_secs(config.filebed_recovery_seconds),
                    file_name,
                    &data_uri,
                )
                .await
            {
                Ok(url) => url,
                Err(err) => {
                    warn!(%err, "file-bed upload failed; falling back to inline base64");
                    data_uri
                }
            }
        } else {
            image_to_data_uri(&bytes, mime)
        };

        if let Some(key) = key {
            self.cache.insert(key, output.clone());
        }
        (output, None)
    }

    pub fn cache(&self) -> &ProcessedImageCache {
        &self.cache
    }

    pub fn uploader(&self) -> &FilebedUploader {
        &self.uploader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filebed::ImageHost;
    use lmbridge_config::FilebedEndpoint;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHost {
        calls: Arc<AtomicUsize>,
        fail_first: bool,
    }

    impl ImageHost for CountingHost {
        fn upload<'a>(
            &'a self,
            endpoint: &'a FilebedEndpoint,
            _file_name: &'a str,
            _data_uri: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_first && endpoint.name == "first";
            Box::pin(async move {
                if fail {
                    Err("HTTP 500".to_string())
                } else {
                    Ok("https://bed/second/img.jpg".to_string())
                }
            })
        }
    }

    fn pipeline(calls: Arc<AtomicUsize>, fail_first: bool) -> ImagePipeline {
        ImagePipeline::new(
            ProcessedImageCache::new(Duration::from_secs(3600), 16),
            FilebedUploader::new(Box::new(CountingHost { calls, fail_first })),
        )
    }

    fn sample_png_uri() -> String {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_fn(64, 64, |x, y| {
            image::Rgba([(x * 3) as u8, (y * 3) as u8, 90, 255])
        }));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        image_to_data_uri(&out.into_inner(), "image/png")
    }

    fn filebed_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.file_bed_enabled = true;
        config.file_bed_selection_strategy = lmbridge_config::FilebedStrategy::Failover;
        config.file_bed_endpoints = vec![
            FilebedEndpoint {
                name: "first".to_string(),
                url: "https://bed/first/upload".to_string(),
                ..FilebedEndpoint::default()
            },
            FilebedEndpoint {
                name: "second".to_string(),
                url: "https://bed/second/upload".to_string(),
                ..FilebedEndpoint::default()
            },
        ];
        config
    }

    #[tokio::test]
    async fn cached_payload_never_touches_an_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipe = pipeline(calls.clone(), false);
        let config = filebed_config();
        let payload = sample_png_uri();

        let (first, err) = pipe.process_image(&payload, "a.png", "req1", &config, None).await;
        assert!(err.is_none());
        let after_first = calls.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        let (second, err) = pipe.process_image(&payload, "a.png", "req2", &config, None).await;
        assert!(err.is_none());
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn first_endpoint_failure_fails_over_and_is_recorded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipe = pipeline(calls, true);
        let config = filebed_config();
        let payload = sample_png_uri();

        let (output, err) = pipe
            .process_image(&payload, "big.png", "req3", &config, None)
            .await;
        assert!(err.is_none());
        assert_eq!(output, "https://bed/second/img.jpg");
        assert_eq!(pipe.uploader().disabled_endpoints(), vec!["first".to_string()]);
        // The returned URL is now cached under the payload hash.
        assert_eq!(pipe.cache().len(), 1);
    }

    #[tokio::test]
    async fn decode_failure_passes_payload_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipe = pipeline(calls.clone(), false);
        let config = BridgeConfig::default();

        let (output, err) = pipe
            .process_image("data:image/png;base64,???", "x.png", "req4", &config, None)
            .await;
        assert_eq!(output, "data:image/png;base64,???");
        assert!(err.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_compression_converts_to_jpeg_under_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipe = pipeline(calls, false);
        let mut config = BridgeConfig::default();
        config.file_bed_enabled = false;
        let model_cfg = ImageCompression {
            enabled: Some(true),
            convert_png_to_jpg: Some(true),
            target_size_kb: Some(50),
            ..ImageCompression::default()
        };

        let payload = sample_png_uri();
        let (output, err) = pipe
            .process_image(&payload, "c.png", "req5", &config, Some(&model_cfg))
            .await;
        assert!(err.is_none());
        assert!(output.starts_with("data:image/jpeg;base64,"));
    }
}
