//! Image transport codec: base64/binary payloads in, RGB pixel buffers out,
//! and quality-reduced JPEG re-encoding for stored references.

use crate::types::{ImagePayload, PixelBuffer};
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder, ImageError, ImageReader, Limits};
use std::io::Cursor;
use thiserror::Error;

/// Fixed aspect ratio of resized references (width : height).
const REFERENCE_ASPECT_W: f64 = 9.0;
const REFERENCE_ASPECT_H: f64 = 16.0;
const DEFAULT_MAX_DIMENSION: u32 = 8192;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64 image data: {0}")]
    InvalidBase64(String),
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("image exceeds {max}px limit")]
    TooLarge { max: u32 },
    #[error("target height must be > 0")]
    InvalidDimension,
    #[error("quality must be between 0 and 100, got {0}")]
    InvalidQuality(u8),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Upper bounds applied while decoding untrusted input.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_dimension: u32,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_dimension: DEFAULT_MAX_DIMENSION }
    }
}

/// Decode a transport payload into an RGB pixel buffer.
pub fn decode(payload: &ImagePayload, limits: &DecodeLimits) -> Result<PixelBuffer, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Empty);
    }
    match payload {
        ImagePayload::Base64(text) => {
            let bytes = decode_base64(text)?;
            decode_container(&bytes, limits)
        }
        ImagePayload::Binary(bytes) => {
            if image::guess_format(bytes).is_err() && looks_like_base64(bytes) {
                // Stored references are frequently kept as base64 text in a blob column.
                let text = String::from_utf8_lossy(bytes);
                let decoded = decode_base64(&text)?;
                return decode_container(&decoded, limits);
            }
            decode_container(bytes, limits)
        }
    }
}

/// Decode base64 text, tolerating whitespace, missing padding and a `data:` URL prefix.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    let trimmed = text.trim();
    let body = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| CodecError::InvalidBase64("data URL without payload".into()))?,
        None => trimmed,
    };
    let cleaned: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(CodecError::Empty);
    }

    general_purpose::STANDARD
        .decode(&cleaned)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(&cleaned))
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

fn looks_like_base64(bytes: &[u8]) -> bool {
    bytes.starts_with(b"data:")
        || bytes.iter().all(|&b| {
            b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_') || b.is_ascii_whitespace()
        })
}

fn decode_container(bytes: &[u8], limits: &DecodeLimits) -> Result<PixelBuffer, CodecError> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if reader.format().is_none() {
        return Err(CodecError::UnsupportedFormat);
    }

    let mut reader_limits = Limits::default();
    reader_limits.max_image_width = Some(limits.max_dimension);
    reader_limits.max_image_height = Some(limits.max_dimension);
    reader.limits(reader_limits);

    let image = reader.decode().map_err(|e| match e {
        ImageError::Limits(_) => CodecError::TooLarge { max: limits.max_dimension },
        ImageError::Unsupported(_) => CodecError::UnsupportedFormat,
        other => CodecError::Decode(other.to_string()),
    })?;

    if image.width() == 0 || image.height() == 0 {
        return Err(CodecError::ZeroDimensions);
    }

    Ok(image.to_rgb8())
}

/// Scale to `target_height`, with width fixed at `target_height × 9/16`.
pub fn resize(buffer: &PixelBuffer, target_height: u32) -> Result<PixelBuffer, CodecError> {
    if target_height == 0 {
        return Err(CodecError::InvalidDimension);
    }
    let width = ((target_height as f64) * REFERENCE_ASPECT_W / REFERENCE_ASPECT_H).round() as u32;
    Ok(image::imageops::resize(buffer, width.max(1), target_height, FilterType::Triangle))
}

/// Re-encode as JPEG at `quality` (0–100). Lower quality gives smaller output.
pub fn encode(buffer: &PixelBuffer, quality: u8) -> Result<Vec<u8>, CodecError> {
    if quality > 100 {
        return Err(CodecError::InvalidQuality(quality));
    }
    if buffer.width() == 0 || buffer.height() == 0 {
        return Err(CodecError::ZeroDimensions);
    }

    let mut out = Vec::new();
    // The JPEG encoder's floor is 1.
    JpegEncoder::new_with_quality(&mut out, quality.max(1))
        .write_image(buffer.as_raw(), buffer.width(), buffer.height(), ExtendedColorType::Rgb8)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Resize then encode: the form in which references are handed to a store.
pub fn compress_reference(
    buffer: &PixelBuffer,
    target_height: u32,
    quality: u8,
) -> Result<Vec<u8>, CodecError> {
    let resized = resize(buffer, target_height)?;
    let bytes = encode(&resized, quality)?;
    tracing::debug!(
        src_width = buffer.width(),
        src_height = buffer.height(),
        width = resized.width(),
        height = resized.height(),
        quality,
        bytes = bytes.len(),
        "compressed reference image"
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 31 + y * 17) ^ (x * y)) as u8;
            Rgb([v, v.wrapping_mul(3), 255 - v])
        })
    }

    fn png_bytes(image: &RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_decode_base64_png() {
        let img = textured(40, 30);
        let payload = ImagePayload::Base64(encode_base64(&png_bytes(&img)));
        let decoded = decode(&payload, &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_decode_binary_png() {
        let img = textured(12, 8);
        let decoded = decode(&ImagePayload::Binary(png_bytes(&img)), &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (12, 8));
    }

    #[test]
    fn test_decode_data_url_and_line_breaks() {
        let img = textured(16, 16);
        let b64 = encode_base64(&png_bytes(&img));
        let wrapped: String = b64
            .as_bytes()
            .chunks(20)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        let payload = ImagePayload::Base64(format!("data:image/png;base64,{wrapped}\n"));
        let decoded = decode(&payload, &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (16, 16));
    }

    #[test]
    fn test_decode_binary_holding_base64_text() {
        let img = textured(10, 20);
        let b64 = encode_base64(&png_bytes(&img));
        let decoded = decode(&ImagePayload::Binary(b64.into_bytes()), &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (10, 20));
    }

    #[test]
    fn test_decode_binary_holding_data_url() {
        let img = textured(14, 9);
        let url = format!("data:image/png;base64,{}", encode_base64(&png_bytes(&img)));
        let decoded = decode(&ImagePayload::Binary(url.into_bytes()), &DecodeLimits::default()).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        for bad in ["not base64!!", "%%%%", "abc$def"] {
            let result = decode(&ImagePayload::from(bad), &DecodeLimits::default());
            assert!(matches!(result, Err(CodecError::InvalidBase64(_))), "{bad}: {result:?}");
        }
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(matches!(
            decode(&ImagePayload::from(""), &DecodeLimits::default()),
            Err(CodecError::Empty)
        ));
        assert!(matches!(
            decode(&ImagePayload::Binary(Vec::new()), &DecodeLimits::default()),
            Err(CodecError::Empty)
        ));
    }

    #[test]
    fn test_decode_rejects_valid_base64_of_garbage() {
        let payload = ImagePayload::Base64(encode_base64(&[0x01, 0x02, 0x03, 0xff, 0x00, 0x7f]));
        let result = decode(&payload, &DecodeLimits::default());
        assert!(matches!(result, Err(CodecError::UnsupportedFormat)), "{result:?}");
    }

    #[test]
    fn test_decode_rejects_truncated_png() {
        let bytes = png_bytes(&textured(32, 32));
        let truncated = bytes[..bytes.len() / 2].to_vec();
        assert!(decode(&ImagePayload::Binary(truncated), &DecodeLimits::default()).is_err());
    }

    #[test]
    fn test_decode_arbitrary_bytes_never_panics() {
        let mut seed = 0x2545_f491u32;
        for len in [1usize, 7, 64, 513] {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    seed as u8
                })
                .collect();
            let _ = decode(&ImagePayload::Binary(bytes), &DecodeLimits::default());
        }
    }

    #[test]
    fn test_decode_enforces_dimension_limit() {
        let bytes = png_bytes(&textured(64, 16));
        let limits = DecodeLimits { max_dimension: 32 };
        let result = decode(&ImagePayload::Binary(bytes), &limits);
        assert!(matches!(result, Err(CodecError::TooLarge { max: 32 })), "{result:?}");
    }

    #[test]
    fn test_resize_fixed_aspect() {
        let resized = resize(&textured(100, 100), 640).unwrap();
        assert_eq!(resized.dimensions(), (360, 640));
        let resized = resize(&textured(100, 100), 100).unwrap();
        // 100 * 9 / 16 = 56.25
        assert_eq!(resized.dimensions(), (56, 100));
    }

    #[test]
    fn test_resize_tiny_height_keeps_one_column() {
        let resized = resize(&textured(50, 50), 1).unwrap();
        assert_eq!(resized.dimensions(), (1, 1));
    }

    #[test]
    fn test_resize_zero_height_rejected() {
        assert!(matches!(resize(&textured(8, 8), 0), Err(CodecError::InvalidDimension)));
    }

    #[test]
    fn test_resize_deterministic() {
        let img = textured(80, 60);
        assert_eq!(resize(&img, 64).unwrap(), resize(&img, 64).unwrap());
    }

    #[test]
    fn test_encode_decode_roundtrip_dimensions() {
        let img = textured(45, 33);
        let jpeg = encode(&img, 75).unwrap();
        let decoded = decode(&ImagePayload::Binary(jpeg), &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (45, 33));
        let again = encode(&decoded, 75).unwrap();
        let redecoded = decode(&ImagePayload::Base64(encode_base64(&again)), &DecodeLimits::default()).unwrap();
        assert_eq!(redecoded.dimensions(), (45, 33));
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        let img = textured(128, 128);
        let low = encode(&img, 10).unwrap();
        let high = encode(&img, 95).unwrap();
        assert!(low.len() < high.len(), "low={} high={}", low.len(), high.len());
    }

    #[test]
    fn test_encode_quality_bounds() {
        let img = textured(8, 8);
        assert!(encode(&img, 0).is_ok());
        assert!(encode(&img, 100).is_ok());
        assert!(matches!(encode(&img, 101), Err(CodecError::InvalidQuality(101))));
    }

    #[test]
    fn test_compress_reference_dimensions() {
        let bytes = compress_reference(&textured(300, 400), 160, 50).unwrap();
        let decoded = decode(&ImagePayload::Binary(bytes), &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (90, 160));
    }
}
