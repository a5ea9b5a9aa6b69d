//! Model-free stand-ins for the ONNX backends, used by unit tests here and,
//! through the `testing` feature, by dependent crates.
//!
//! `PatchDetector` treats any region that clearly differs from the background
//! (the top-left pixel) as a face, so JPEG-compressed frames still work; `MeanColorEmbedder` embeds a face as its mean
//! colour. Synthetic "people" are therefore distinguished by patch colour.

use crate::codec;
use crate::detector::{DetectorError, FaceDetect};
use crate::recognizer::{FaceEmbed, RecognizerError};
use crate::types::{BoundingBox, Embedding, PixelBuffer};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

pub const BACKGROUND: [u8; 3] = [40, 40, 40];

/// 160x200 frame with a 60x80 "face" patch of the given colour.
pub fn portrait_with_patch(color: [u8; 3]) -> RgbImage {
    let mut image = RgbImage::from_pixel(160, 200, Rgb(BACKGROUND));
    for y in 60..140 {
        for x in 50..110 {
            image.put_pixel(x, y, Rgb(color));
        }
    }
    image
}

/// Uniform frame: an empty room.
pub fn blank() -> RgbImage {
    RgbImage::from_pixel(160, 200, Rgb(BACKGROUND))
}

pub fn png_base64(image: &RgbImage) -> String {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encode");
    codec::encode_base64(&bytes)
}

/// Per-channel difference above which a pixel is not background.
const NOISE_TOLERANCE: u8 = 24;

fn patch_bounds(image: &PixelBuffer) -> Option<(u32, u32, u32, u32)> {
    let background = image.get_pixel(0, 0).0;
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel.0.iter().zip(background).any(|(&a, b)| a.abs_diff(b) > NOISE_TOLERANCE) {
            let (x0, y0, x1, y1) = bounds.unwrap_or((x, y, x, y));
            bounds = Some((x0.min(x), y0.min(y), x1.max(x), y1.max(y)));
        }
    }
    bounds
}

/// Emits `hits_per_level` slightly shifted windows around the patch on every pass.
pub struct PatchDetector {
    pub hits_per_level: usize,
}

impl Default for PatchDetector {
    fn default() -> Self {
        Self { hits_per_level: 2 }
    }
}

impl FaceDetect for PatchDetector {
    fn candidates(&mut self, image: &PixelBuffer, _input_size: usize) -> Result<Vec<BoundingBox>, DetectorError> {
        let Some((x0, y0, x1, y1)) = patch_bounds(image) else {
            return Ok(Vec::new());
        };
        let (x, y) = (x0 as f32, y0 as f32);
        let (w, h) = ((x1 - x0 + 1) as f32, (y1 - y0 + 1) as f32);

        Ok((0..self.hits_per_level)
            .map(|i| {
                let shift = i as f32;
                BoundingBox {
                    x: x + shift,
                    y: y + shift,
                    width: w,
                    height: h,
                    confidence: 0.9 - 0.01 * shift,
                    landmarks: Some([
                        (x + 0.3 * w, y + 0.4 * h),
                        (x + 0.7 * w, y + 0.4 * h),
                        (x + 0.5 * w, y + 0.6 * h),
                        (x + 0.35 * w, y + 0.8 * h),
                        (x + 0.65 * w, y + 0.8 * h),
                    ]),
                }
            })
            .collect())
    }
}

/// Embeds the face box as its centred mean colour.
pub struct MeanColorEmbedder;

impl FaceEmbed for MeanColorEmbedder {
    fn extract(&mut self, image: &PixelBuffer, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        if face.landmarks.is_none() {
            return Err(RecognizerError::NoLandmarks);
        }
        let mut sum = [0.0f32; 3];
        let mut count = 0.0f32;
        let x_end = ((face.x + face.width) as u32).min(image.width());
        let y_end = ((face.y + face.height) as u32).min(image.height());
        for y in face.y.max(0.0) as u32..y_end {
            for x in face.x.max(0.0) as u32..x_end {
                let p = image.get_pixel(x, y).0;
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
                count += 1.0;
            }
        }
        if count == 0.0 {
            return Err(RecognizerError::InferenceFailed("empty face box".into()));
        }
        Ok(Embedding {
            values: sum.iter().map(|s| s / count - 127.5).collect(),
            model_version: Some("mean-color".into()),
        }
        .normalized())
    }
}
