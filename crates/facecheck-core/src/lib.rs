//! facecheck-core: face presence detection and identity verification.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime for CPU inference. Images arrive as base64 text
//! or raw container bytes and leave as a JSON response envelope.

pub mod alignment;
pub mod codec;
pub mod detector;
pub mod outcome;
pub mod presence;
pub mod recognizer;
pub mod response;
pub mod service;
pub mod types;
pub mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use detector::{FaceDetect, FaceDetector};
pub use outcome::{DistanceMetric, Failure, FailureKind, Verification, VerificationOutcome};
pub use presence::{PresenceDetector, PresenceParams};
pub use recognizer::{FaceEmbed, FaceRecognizer};
pub use response::Envelope;
pub use service::{ReferenceResolver, ResolveError, ServiceSettings, VerificationService};
pub use types::{BoundingBox, Embedding, FacePresence, ImagePayload, PixelBuffer, ReferenceKey};
pub use verifier::FaceVerifier;

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
