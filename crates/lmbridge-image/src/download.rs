use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use lmbridge_config::{DownloadTimeouts, LocalSaveFormat};

const RETRY_DELAYS: [u64; 2] = [1, 2];

/// Downloader for arena-returned image URLs. A semaphore bounds concurrency
/// so a burst of image responses cannot exhaust the connection pool.
pub struct ImageDownloader {
    client: wreq::Client,
    permits: Arc<Semaphore>,
    timeouts: DownloadTimeouts,
}

impl ImageDownloader {
    pub fn new(client: wreq::Client, max_concurrent: usize, timeouts: DownloadTimeouts) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeouts,
        }
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| "download pool closed".to_string())?;

        let mut last_error = String::new();
        let attempts = self.timeouts.max_retries.max(1);
        for attempt in 0..attempts {
            match self.try_download(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    warn!(attempt, %err, "image download attempt failed");
                    last_error = err;
                }
            }
            if (attempt as usize) < RETRY_DELAYS.len() && attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAYS[attempt as usize])).await;
            }
        }
        Err(last_error)
    }

    async fn try_download(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(url)
            .header(
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            )
            .header("Accept", "image/webp,image/apng,image/*,*/*;q=0.8")
            .header("Referer", "https://lmarena.ai/")
            .timeout(Duration::from_secs(self.timeouts.total))
            .send()
            .await
            .map_err(|err| format!("request failed: {err}"))?;

        let status = resp.status().as_u16();
        if status != 200 {
            return Err(format!("HTTP {status}"));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| format!("body read failed: {err}"))?;
        debug!(len = bytes.len(), "image downloaded");
        Ok(bytes.to_vec())
    }
}

/// Persist a downloaded image under `downloaded_images/YYYYMMDD/`, optionally
/// re-encoding per the local-save format config. Best-effort.
pub async fn save_image_locally(
    base_dir: PathBuf,
    mut data: Vec<u8>,
    source_url: &str,
    request_id: &str,
    format_cfg: &LocalSaveFormat,
) {
    let mut ext = extension_from_url(source_url);

    if format_cfg.enabled && format_cfg.format != "original" {
        let target = format_cfg.format.to_ascii_lowercase();
        match reencode(&data, &target, format_cfg.jpeg_quality) {
            Ok((converted, converted_ext)) => {
                data = converted;
                ext = converted_ext;
            }
            Err(err) => warn!(%err, "local save conversion failed; keeping original bytes"),
        }
    }

    let now = time::OffsetDateTime::now_utc();
    let date_dir = base_dir.join(format!(
        "{:04}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day()
    ));
    if let Err(err) = tokio::fs::create_dir_all(&date_dir).await {
        warn!(%err, "could not create image save directory");
        return;
    }

    let stamp = format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}_{:03}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    );
    let short = &request_id[..request_id.len().min(8)];
    let path = date_dir.join(format!("{stamp}_{short}.{ext}"));
    match tokio::fs::write(&path, &data).await {
        Ok(()) => info!(path = %path.display(), size_kb = data.len() / 1024, "image saved"),
        Err(err) => warn!(%err, "image save failed"),
    }
}

fn extension_from_url(url: &str) -> String {
    let lowered = url.to_ascii_lowercase();
    for known in ["jpeg", "jpg", "png", "gif", "webp"] {
        if lowered.contains(&format!(".{known}")) {
            return known.to_string();
        }
    }
    "png".to_string()
}

fn reencode(data: &[u8], target: &str, jpeg_quality: u8) -> Result<(Vec<u8>, String), String> {
    let img = image::load_from_memory(data).map_err(|err| err.to_string())?;
    let mut out = std::io::Cursor::new(Vec::new());
    let ext = match target {
        "jpeg" | "jpg" => {
            let img = image::DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut out,
                jpeg_quality.clamp(1, 100),
            );
            img.write_with_encoder(encoder).map_err(|err| err.to_string())?;
            "jpg"
        }
        "webp" => {
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut out);
            img.write_with_encoder(encoder).map_err(|err| err.to_string())?;
            "webp"
        }
        _ => {
            img.write_to(&mut out, image::ImageFormat::Png)
                .map_err(|err| err.to_string())?;
            "png"
        }
    };
    Ok((out.into_inner(), ext.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_guess_prefers_url_hint() {
        assert_eq!(extension_from_url("https://x/a.webp?sig=1"), "webp");
        assert_eq!(extension_from_url("https://x/a.JPG"), "jpg");
        assert_eq!(extension_from_url("https://x/opaque"), "png");
    }
}
