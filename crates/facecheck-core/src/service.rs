//! Request-level orchestration: decode payloads, run presence or verification,
//! and normalise every failure into a typed outcome.

use crate::codec::{self, DecodeLimits};
use crate::detector::FaceDetect;
use crate::outcome::{Failure, FailureKind, VerificationOutcome};
use crate::presence::{PresenceDetector, PresenceParams};
use crate::recognizer::FaceEmbed;
use crate::types::{FacePresence, ImagePayload, PixelBuffer, ReferenceKey};
use crate::verifier::FaceVerifier;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("reference lookup failed: {0}")]
pub struct ResolveError(pub String);

/// Lookup capability supplied by the record store that owns reference images.
///
/// `Ok(None)` means the key is unknown.
pub trait ReferenceResolver {
    fn resolve(&self, key: &ReferenceKey) -> Result<Option<ImagePayload>, ResolveError>;
}

impl<F> ReferenceResolver for F
where
    F: Fn(&ReferenceKey) -> Result<Option<ImagePayload>, ResolveError>,
{
    fn resolve(&self, key: &ReferenceKey) -> Result<Option<ImagePayload>, ResolveError> {
        self(key)
    }
}

/// Tunables of the service that do not belong to a single component.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub decode_limits: DecodeLimits,
    pub presence: PresenceParams,
    /// Height of stored references; width follows the fixed 9:16 aspect.
    pub reference_height: u32,
    /// JPEG quality of stored references (0–100).
    pub reference_quality: u8,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            decode_limits: DecodeLimits::default(),
            presence: PresenceParams::default(),
            reference_height: 640,
            reference_quality: 60,
        }
    }
}

/// Stateless per call; owns the model backends for the life of the process.
pub struct VerificationService<D, E> {
    detector: D,
    embedder: E,
    presence: PresenceDetector,
    verifier: FaceVerifier,
    settings: ServiceSettings,
}

impl<D: FaceDetect, E: FaceEmbed> VerificationService<D, E> {
    pub fn new(detector: D, embedder: E, verifier: FaceVerifier, settings: ServiceSettings) -> Self {
        Self {
            detector,
            embedder,
            presence: PresenceDetector::new(settings.presence),
            verifier,
            settings,
        }
    }

    /// Compare two directly supplied frames.
    pub fn verify_by_frames(&mut self, captured: &ImagePayload, reference: &ImagePayload) -> VerificationOutcome {
        let outcome = match self.decode_pair(captured, reference) {
            Ok((cap, reference)) => self.verifier.verify(&mut self.detector, &mut self.embedder, &cap, &reference),
            Err(failure) => VerificationOutcome::Error(failure),
        };
        log_outcome("verify_by_frames", &outcome);
        outcome
    }

    /// Compare a captured frame against the reference stored under `key`.
    ///
    /// The key is resolved before anything is decoded, so an unknown subject is
    /// reported as `NotFound` regardless of the captured payload. A stored
    /// reference that cannot be decoded is a `Backend` failure, not the caller's.
    pub fn verify_by_identity<R>(
        &mut self,
        captured: &ImagePayload,
        key: &ReferenceKey,
        resolver: &R,
    ) -> VerificationOutcome
    where
        R: ReferenceResolver + ?Sized,
    {
        let outcome = match resolver.resolve(key) {
            Ok(Some(reference)) => match self.decode_with_stored(captured, &reference, key) {
                Ok((cap, reference)) => self.verifier.verify(&mut self.detector, &mut self.embedder, &cap, &reference),
                Err(failure) => VerificationOutcome::Error(failure),
            },
            Ok(None) => VerificationOutcome::Error(Failure::not_found(format!("no reference face stored for '{key}'"))),
            Err(e) => VerificationOutcome::Error(Failure::backend(e.to_string())),
        };
        log_outcome("verify_by_identity", &outcome);
        outcome
    }

    /// Decide whether any face is present in `image`.
    pub fn check_presence(&mut self, image: &ImagePayload) -> Result<FacePresence, Failure> {
        let result = self.decode_one(image, "image").and_then(|buffer| {
            self.presence
                .detect(&mut self.detector, &buffer)
                .map_err(Failure::from)
        });
        match &result {
            Ok(presence) => tracing::info!(
                face_exists = presence.face_exists,
                regions = presence.regions.len(),
                "check_presence"
            ),
            Err(failure) => log_failure("check_presence", failure),
        }
        result
    }

    /// Turn an enrollment photo into the compressed bytes a store keeps as the
    /// reference. The photo must contain a face.
    pub fn prepare_reference(&mut self, image: &ImagePayload) -> Result<Vec<u8>, Failure> {
        let result = self.decode_one(image, "image").and_then(|buffer| {
            let presence = self.presence.detect(&mut self.detector, &buffer)?;
            if !presence.face_exists {
                return Err(Failure::no_face());
            }
            Ok(codec::compress_reference(
                &buffer,
                self.settings.reference_height,
                self.settings.reference_quality,
            )?)
        });
        if let Err(failure) = &result {
            log_failure("prepare_reference", failure);
        }
        result
    }

    fn decode_one(&self, payload: &ImagePayload, field: &str) -> Result<PixelBuffer, Failure> {
        if payload.is_empty() {
            return Err(Failure::malformed(format!("missing {field} data")));
        }
        codec::decode(payload, &self.settings.decode_limits)
            .map_err(|e| Failure::malformed(format!("{field}: {e}")))
    }

    fn decode_pair(
        &self,
        captured: &ImagePayload,
        reference: &ImagePayload,
    ) -> Result<(PixelBuffer, PixelBuffer), Failure> {
        let captured = self.decode_one(captured, "captured frame")?;
        let reference = self.decode_one(reference, "reference frame")?;
        Ok((captured, reference))
    }

    fn decode_with_stored(
        &self,
        captured: &ImagePayload,
        stored: &ImagePayload,
        key: &ReferenceKey,
    ) -> Result<(PixelBuffer, PixelBuffer), Failure> {
        let captured = self.decode_one(captured, "captured frame")?;
        let reference = codec::decode(stored, &self.settings.decode_limits)
            .map_err(|e| Failure::backend(format!("stored reference for '{key}' is unreadable: {e}")))?;
        Ok((captured, reference))
    }
}

fn log_outcome(op: &'static str, outcome: &VerificationOutcome) {
    match outcome {
        VerificationOutcome::Match(v) | VerificationOutcome::NoMatch(v) => tracing::info!(
            op,
            matched = outcome.is_match(),
            distance = v.distance,
            threshold = v.threshold,
            "verification complete"
        ),
        VerificationOutcome::Error(failure) => log_failure(op, failure),
    }
}

fn log_failure(op: &'static str, failure: &Failure) {
    match failure.kind {
        FailureKind::Backend => tracing::error!(op, reason = %failure.reason, "backend failure"),
        kind => tracing::info!(op, ?kind, reason = %failure.reason, "request rejected"),
    }
}
