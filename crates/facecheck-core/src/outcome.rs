//! Verification outcomes and the failure taxonomy shared by every operation.

use crate::codec::CodecError;
use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message reported for any verification where a face could not be located.
pub const NO_FACE_DETECTED: &str = "no face detected";

/// Category of a failed operation. Each maps to exactly one status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing, malformed or unsupported image input.
    MalformedInput,
    /// No face could be found in one of the inputs.
    NoFaceDetected,
    /// The reference key did not resolve to a stored image.
    NotFound,
    /// Model, inference or I/O failure inside the backend.
    Backend,
}

impl FailureKind {
    pub fn status_code(self) -> u16 {
        match self {
            FailureKind::MalformedInput | FailureKind::NoFaceDetected => 400,
            FailureKind::NotFound => 404,
            FailureKind::Backend => 500,
        }
    }
}

/// A typed failure with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedInput, reason)
    }

    pub fn no_face() -> Self {
        Self::new(FailureKind::NoFaceDetected, NO_FACE_DETECTED)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, reason)
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Backend, reason)
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for Failure {}

impl From<CodecError> for Failure {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(_) => Failure::backend(err.to_string()),
            _ => Failure::malformed(err.to_string()),
        }
    }
}

impl From<DetectorError> for Failure {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::NoFaceDetected => Failure::no_face(),
            other => Failure::backend(other.to_string()),
        }
    }
}

impl From<RecognizerError> for Failure {
    fn from(err: RecognizerError) -> Self {
        match err {
            RecognizerError::NoLandmarks => Failure::no_face(),
            other => Failure::backend(other.to_string()),
        }
    }
}

/// How two embeddings are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// Euclidean distance between L2-normalised embeddings, in [0, 2].
    EuclideanL2,
}

impl DistanceMetric {
    /// Decision boundary for ArcFace embeddings under this metric.
    pub fn default_threshold(self) -> f32 {
        match self {
            DistanceMetric::Cosine => 0.68,
            DistanceMetric::EuclideanL2 => 1.13,
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean_l2" | "euclidean-l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric '{other}'")),
        }
    }
}

/// Score of a completed comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub distance: f32,
    pub threshold: f32,
    pub metric: DistanceMetric,
}

/// Ternary verification result: exactly one state holds.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Match(Verification),
    NoMatch(Verification),
    Error(Failure),
}

impl VerificationOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, VerificationOutcome::Match(_))
    }

    pub fn verification(&self) -> Option<&Verification> {
        match self {
            VerificationOutcome::Match(v) | VerificationOutcome::NoMatch(v) => Some(v),
            VerificationOutcome::Error(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            VerificationOutcome::Error(f) => Some(f),
            _ => None,
        }
    }
}

impl From<Failure> for VerificationOutcome {
    fn from(failure: Failure) -> Self {
        VerificationOutcome::Error(failure)
    }
}
