use serde::{Deserialize, Serialize};

/// Decoded RGB bitmap (height × width × 3).
pub type PixelBuffer = image::RgbImage;

/// A transport-encoded image as received from a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Base64 text, optionally wrapped in a `data:` URL.
    Base64(String),
    /// Raw container bytes (JPEG, PNG, ...), e.g. a multipart upload or a stored blob.
    Binary(Vec<u8>),
}

impl ImagePayload {
    pub fn is_empty(&self) -> bool {
        match self {
            ImagePayload::Base64(text) => text.trim().is_empty(),
            ImagePayload::Binary(bytes) => bytes.is_empty(),
        }
    }
}

impl From<String> for ImagePayload {
    fn from(text: String) -> Self {
        ImagePayload::Base64(text)
    }
}

impl From<&str> for ImagePayload {
    fn from(text: &str) -> Self {
        ImagePayload::Base64(text.to_string())
    }
}

impl From<Vec<u8>> for ImagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        ImagePayload::Binary(bytes)
    }
}

/// Opaque subject identifier (student or teacher id) that an external store
/// resolves to a reference image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceKey(pub String);

impl ReferenceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReferenceKey {
    fn from(key: &str) -> Self {
        ReferenceKey(key.to_string())
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between the raw vectors.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Return an L2-normalised copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// Result of a presence check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacePresence {
    pub face_exists: bool,
    /// Accepted regions, for diagnostics.
    pub regions: Vec<BoundingBox>,
}

impl FacePresence {
    pub fn from_regions(regions: Vec<BoundingBox>) -> Self {
        Self {
            face_exists: !regions.is_empty(),
            regions,
        }
    }
}
