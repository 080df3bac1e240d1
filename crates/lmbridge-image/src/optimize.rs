use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use tracing::{debug, warn};

use lmbridge_config::ImageOptimization;

#[derive(Debug)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

/// Decode a base64 payload (bare or data-URI) and sniff its format.
pub fn decode_base64_image(payload: &str) -> Result<DecodedImage, String> {
    let data = match payload.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => payload,
    };
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|err| format!("base64 decode failed: {err}"))?;
    let format = image::guess_format(&bytes).map_err(|err| format!("unknown image format: {err}"))?;
    Ok(DecodedImage { bytes, format })
}

pub fn mime_for_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        _ => "image/png",
    }
}

pub fn image_to_data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Apply the configured optimization steps. Returns the re-encoded bytes and
/// the output format; any failure reports an error string so callers can fall
/// through to the unoptimized bytes.
pub fn optimize_image(
    bytes: &[u8],
    config: &ImageOptimization,
    original_format: ImageFormat,
) -> Result<(Vec<u8>, ImageFormat), String> {
    let mut img = image::load_from_memory(bytes).map_err(|err| format!("decode failed: {err}"))?;
    let original_size = bytes.len();

    // Re-rendering through a fresh pixel buffer drops EXIF and other
    // metadata blocks.
    if config.strip_metadata {
        img = DynamicImage::ImageRgba8(img.to_rgba8());
    }

    if img.width() > config.max_width || img.height() > config.max_height {
        let (old_w, old_h) = (img.width(), img.height());
        img = img.resize(config.max_width, config.max_height, FilterType::Lanczos3);
        debug!(
            "downscaled {}x{} -> {}x{}",
            old_w,
            old_h,
            img.width(),
            img.height()
        );
    }

    let mut output_format = original_format;
    if config.convert_png_to_jpg && original_format == ImageFormat::Png {
        output_format = ImageFormat::Jpeg;
    }
    if let Some(target) = config.target_format.as_deref() {
        output_format = match target.to_ascii_lowercase().as_str() {
            "png" => ImageFormat::Png,
            "jpg" | "jpeg" => ImageFormat::Jpeg,
            "webp" => ImageFormat::WebP,
            _ => output_format,
        };
    }
    if config.convert_to_webp {
        output_format = ImageFormat::WebP;
    }

    // JPEG has no alpha channel; flatten onto white first.
    if output_format == ImageFormat::Jpeg {
        img = flatten_to_white(img);
    }

    let quality = match output_format {
        ImageFormat::Jpeg => config.jpeg_quality,
        ImageFormat::WebP => config.webp_quality,
        _ => 95,
    };

    if let Some(target_kb) = config.target_size_kb
        && target_kb > 0
        && output_format == ImageFormat::Jpeg
    {
        let (data, final_quality) = compress_to_target_size(&img, target_kb, quality);
        debug!(
            "target-size compression: {}KB -> {}KB (quality {final_quality})",
            original_size / 1024,
            data.len() / 1024
        );
        return Ok((data, output_format));
    }

    let data = encode(&img, output_format, quality)?;
    debug!(
        "optimized: {}KB -> {}KB",
        original_size / 1024,
        data.len() / 1024
    );
    Ok((data, output_format))
}

fn flatten_to_white(img: DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let mut flat = image::RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |channel: u8| -> u8 {
            ((channel as u32 * alpha + 255 * (255 - alpha)) / 255) as u8
        };
        flat.put_pixel(x, y, image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    DynamicImage::ImageRgb8(flat)
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, String> {
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            img.write_with_encoder(encoder)
                .map_err(|err| format!("jpeg encode failed: {err}"))?;
        }
        ImageFormat::WebP => {
            // The codec here is lossless; the quality knob does not apply.
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut out);
            img.write_with_encoder(encoder)
                .map_err(|err| format!("webp encode failed: {err}"))?;
        }
        _ => {
            img.write_to(&mut out, ImageFormat::Png)
                .map_err(|err| format!("png encode failed: {err}"))?;
        }
    }
    Ok(out.into_inner())
}

/// Binary-search JPEG quality in `[10, initial]` toward a byte budget.
/// Returns the best fit, or the lowest-quality encoding when the budget is
/// unreachable.
fn compress_to_target_size(img: &DynamicImage, target_kb: u32, initial_quality: u8) -> (Vec<u8>, u8) {
    const MIN_QUALITY: u8 = 10;
    let target_bytes = target_kb as usize * 1024;

    let mut low = MIN_QUALITY;
    let mut high = initial_quality.max(MIN_QUALITY);
    let mut best: Option<(Vec<u8>, u8)> = None;

    for _ in 0..10 {
        if low > high {
            break;
        }
        let mid = ((low as u16 + high as u16) / 2) as u8;
        let Ok(data) = encode(img, ImageFormat::Jpeg, mid) else {
            break;
        };
        if data.len() <= target_bytes {
            best = Some((data, mid));
            low = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            high = mid - 1;
        }
    }

    match best {
        Some(found) => found,
        None => {
            let data = encode(img, ImageFormat::Jpeg, MIN_QUALITY).unwrap_or_default();
            if data.len() > target_bytes {
                warn!(
                    "even quality {MIN_QUALITY} misses the {target_kb}KB budget ({}KB)",
                    data.len() / 1024
                );
            }
            (data, MIN_QUALITY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(width: u32, height: u32) -> String {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        }));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        image_to_data_uri(&out.into_inner(), "image/png")
    }

    #[test]
    fn decode_accepts_data_uri_and_bare_base64() {
        let uri = sample_png(8, 8);
        let decoded = decode_base64_image(&uri).unwrap();
        assert_eq!(decoded.format, ImageFormat::Png);

        let bare = uri.split_once(',').unwrap().1.to_string();
        assert!(decode_base64_image(&bare).is_ok());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_base64_image("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn png_converts_to_jpeg_with_flattened_alpha() {
        let uri = sample_png(16, 16);
        let decoded = decode_base64_image(&uri).unwrap();
        let config = ImageOptimization {
            enabled: true,
            convert_png_to_jpg: true,
            ..ImageOptimization::default()
        };
        let (bytes, format) = optimize_image(&decoded.bytes, &config, decoded.format).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn oversized_image_is_downscaled() {
        let uri = sample_png(64, 32);
        let decoded = decode_base64_image(&uri).unwrap();
        let config = ImageOptimization {
            enabled: true,
            max_width: 32,
            max_height: 32,
            ..ImageOptimization::default()
        };
        let (bytes, _) = optimize_image(&decoded.bytes, &config, decoded.format).unwrap();
        let resized = image::load_from_memory(&bytes).unwrap();
        assert!(resized.width() <= 32 && resized.height() <= 32);
        // Aspect ratio preserved: 64x32 -> 32x16.
        assert_eq!((resized.width(), resized.height()), (32, 16));
    }

    #[test]
    fn target_size_budget_is_respected() {
        let uri = sample_png(256, 256);
        let decoded = decode_base64_image(&uri).unwrap();
        let config = ImageOptimization {
            enabled: true,
            convert_png_to_jpg: true,
            target_size_kb: Some(24),
            ..ImageOptimization::default()
        };
        let (bytes, format) = optimize_image(&decoded.bytes, &config, decoded.format).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
        assert!(bytes.len() <= 24 * 1024, "got {} bytes", bytes.len());
    }
}
