//! Encoding of finished bitmaps and decoding of source images

use crate::job::OutputFormat;
use crate::{Error, Result};
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};
use log::{debug, error, warn};
use std::path::Path;
use std::time::Duration;

/// Encode a bitmap: PNG is lossless, JPEG is flattened onto white first
pub fn encode(img: &RgbaImage, format: OutputFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Png => {
            PngEncoder::new(&mut buf).write_image(
                img.as_raw(),
                img.width(),
                img.height(),
                ExtendedColorType::Rgba8,
            )?;
        }
        OutputFormat::Jpeg => {
            let rgb = flatten_on_white(img);
            JpegEncoder::new_with_quality(&mut buf, jpeg_quality.clamp(1, 100)).write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                ExtendedColorType::Rgb8,
            )?;
        }
    }
    Ok(buf)
}

fn flatten_on_white(img: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let [r, g, b, a] = img.get_pixel(x, y).0;
        let a = a as u32;
        let mix = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
        image::Rgb([mix(r), mix(g), mix(b)])
    })
}

/// Decode the base64 payload of a data URI or a bare base64 string
pub fn decode_base64_payload(input: &str) -> Option<Vec<u8>> {
    let payload = if input.starts_with("data:") {
        input.split_once(',').map(|(_, data)| data)?
    } else {
        input
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(&cleaned)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&cleaned))
        .ok()
}

/// Resolve a legacy item's `imagePath` into a bitmap
///
/// Data URIs and anything not starting with `/` are treated as base64;
/// everything else is a filesystem path. Every failure yields `None` and the
/// item renders without its image.
pub fn decode_source(image_path: &str) -> Option<DynamicImage> {
    if image_path.is_empty() {
        return None;
    }
    if image_path.starts_with("data:image") || !image_path.starts_with('/') {
        let Some(bytes) = decode_base64_payload(image_path) else {
            error!("Failed to decode base64 image payload");
            return None;
        };
        match image::load_from_memory(&bytes) {
            Ok(img) => {
                debug!("Successfully decoded base64 image ({}x{})", img.width(), img.height());
                Some(img)
            }
            Err(e) => {
                error!("Failed to decode base64 image: {}", e);
                None
            }
        }
    } else {
        let path = Path::new(image_path);
        if !path.exists() {
            warn!("Image file not found: {}", image_path);
            return None;
        }
        match image::open(path) {
            Ok(img) => {
                debug!("Successfully loaded image from file: {}", image_path);
                Some(img)
            }
            Err(e) => {
                error!("Failed to load image {}: {}", image_path, e);
                None
            }
        }
    }
}

/// Load an `<img src>`: data URI, http(s) URL (bounded by `timeout`) or
/// local path / `file://` URL
pub fn load_image_source(src: &str, timeout: Duration) -> Result<DynamicImage> {
    let src = src.trim();
    if src.is_empty() {
        return Err(Error::Decode("empty image source".into()));
    }
    if src.starts_with("data:") {
        let bytes = decode_base64_payload(src)
            .ok_or_else(|| Error::Decode("invalid data URI".into()))?;
        return image::load_from_memory(&bytes).map_err(|e| Error::Decode(e.to_string()));
    }
    if let Ok(url) = url::Url::parse(src) {
        match url.scheme() {
            "http" | "https" => return fetch_remote(url.as_str(), timeout),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| Error::Decode(format!("bad file URL: {}", src)))?;
                return image::open(path).map_err(|e| Error::Decode(e.to_string()));
            }
            other => return Err(Error::Decode(format!("unsupported image scheme: {}", other))),
        }
    }
    image::open(src).map_err(|e| Error::Decode(format!("Failed to load image {}: {}", src, e)))
}

fn fetch_remote(url: &str, timeout: Duration) -> Result<DynamicImage> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;
    let resp = client.get(url).send().map_err(|e| {
        if e.is_timeout() {
            Error::Timeout(timeout.as_millis() as u64)
        } else {
            Error::Decode(format!("Failed to load image: {}: {}", url, e))
        }
    })?;
    if !resp.status().is_success() {
        return Err(Error::Decode(format!("Failed to load image: {} ({})", url, resp.status())));
    }
    let bytes = resp.bytes().map_err(|e| {
        if e.is_timeout() {
            Error::Timeout(timeout.as_millis() as u64)
        } else {
            Error::Decode(e.to_string())
        }
    })?;
    image::load_from_memory(&bytes).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png_base64() -> String {
        let img = RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        let bytes = encode(&img, OutputFormat::Png, 90).unwrap();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn png_has_signature() {
        let img = RgbaImage::new(4, 4);
        let bytes = encode(&img, OutputFormat::Png, 90).unwrap();
        assert_eq!(&bytes[0..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn jpeg_has_soi_marker() {
        let img = RgbaImage::new(4, 4);
        let bytes = encode(&img, OutputFormat::Jpeg, 90).unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn data_uri_and_raw_base64_decode_identically() {
        let raw = tiny_png_base64();
        let uri = format!("data:image/png;base64,{}", raw);
        let a = decode_source(&uri).unwrap().to_rgba8();
        let b = decode_source(&raw).unwrap().to_rgba8();
        assert_eq!(a, b);
        assert_eq!(a.dimensions(), (2, 3));
    }

    #[test]
    fn missing_file_and_garbage_yield_none() {
        assert!(decode_source("").is_none());
        assert!(decode_source("/definitely/not/here.png").is_none());
        assert!(decode_source("not-base64-at-all!!").is_none());
    }
}
