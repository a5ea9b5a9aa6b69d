//! Identity verification: do two frames show the same person?

use crate::detector::FaceDetect;
use crate::outcome::{DistanceMetric, Failure, Verification, VerificationOutcome};
use crate::recognizer::FaceEmbed;
use crate::types::{Embedding, PixelBuffer};

/// Compares the primary face of two frames against a decision threshold.
#[derive(Debug, Clone, Copy)]
pub struct FaceVerifier {
    metric: DistanceMetric,
    threshold: f32,
}

impl Default for FaceVerifier {
    fn default() -> Self {
        Self::with_metric(DistanceMetric::default())
    }
}

impl FaceVerifier {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Verifier using the model's default decision boundary for `metric`.
    pub fn with_metric(metric: DistanceMetric) -> Self {
        Self::new(metric, metric.default_threshold())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Distance between two embeddings under the configured metric.
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
            DistanceMetric::EuclideanL2 => a.normalized().euclidean_distance(&b.normalized()),
        }
    }

    /// A frame without a detectable face yields `Error(NoFaceDetected)`, never `NoMatch`.
    pub fn verify<D, E>(
        &self,
        detector: &mut D,
        embedder: &mut E,
        captured: &PixelBuffer,
        reference: &PixelBuffer,
    ) -> VerificationOutcome
    where
        D: FaceDetect + ?Sized,
        E: FaceEmbed + ?Sized,
    {
        let scored = embed_primary(detector, embedder, captured, "captured").and_then(|live| {
            let enrolled = embed_primary(detector, embedder, reference, "reference")?;
            Ok(self.score(&live, &enrolled))
        });

        match scored {
            Ok(verification) if verification.distance <= verification.threshold => {
                VerificationOutcome::Match(verification)
            }
            Ok(verification) => VerificationOutcome::NoMatch(verification),
            Err(failure) => VerificationOutcome::Error(failure),
        }
    }

    fn score(&self, live: &Embedding, enrolled: &Embedding) -> Verification {
        let distance = self.distance(live, enrolled);
        tracing::debug!(
            distance,
            threshold = self.threshold,
            metric = ?self.metric,
            "compared embeddings"
        );
        Verification {
            distance,
            threshold: self.threshold,
            metric: self.metric,
        }
    }
}

/// Embed the highest-confidence face in `image`.
fn embed_primary<D, E>(
    detector: &mut D,
    embedder: &mut E,
    image: &PixelBuffer,
    role: &'static str,
) -> Result<Embedding, Failure>
where
    D: FaceDetect + ?Sized,
    E: FaceEmbed + ?Sized,
{
    let faces = detector.detect(image)?;
    let Some(face) = faces.first() else {
        tracing::debug!(role, width = image.width(), height = image.height(), "no face in frame");
        return Err(Failure::no_face());
    };
    tracing::trace!(role, confidence = face.confidence, faces = faces.len(), "primary face selected");
    Ok(embedder.extract(image, face)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FailureKind;
    use crate::testing::{blank, portrait_with_patch, MeanColorEmbedder, PatchDetector};

    const PERSON_X: [u8; 3] = [200, 160, 140];
    const PERSON_Y: [u8; 3] = [60, 90, 200];

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    fn run(verifier: &FaceVerifier, a: &PixelBuffer, b: &PixelBuffer) -> VerificationOutcome {
        verifier.verify(&mut PatchDetector::default(), &mut MeanColorEmbedder, a, b)
    }

    #[test]
    fn test_identical_frames_match() {
        let a = portrait_with_patch(PERSON_X);
        let outcome = run(&FaceVerifier::default(), &a, &a);
        assert!(outcome.is_match(), "{outcome:?}");
        assert!(outcome.verification().unwrap().distance.abs() < 1e-5);
    }

    #[test]
    fn test_different_people_do_not_match() {
        let outcome = run(
            &FaceVerifier::default(),
            &portrait_with_patch(PERSON_X),
            &portrait_with_patch(PERSON_Y),
        );
        assert!(matches!(outcome, VerificationOutcome::NoMatch(_)), "{outcome:?}");
    }

    #[test]
    fn test_blank_reference_is_error_not_mismatch() {
        let outcome = run(&FaceVerifier::default(), &portrait_with_patch(PERSON_X), &blank());
        let failure = outcome.failure().expect("error outcome");
        assert_eq!(failure.kind, FailureKind::NoFaceDetected);
        assert_eq!(failure.reason, "no face detected");
    }

    #[test]
    fn test_blank_captured_is_error() {
        let outcome = run(&FaceVerifier::default(), &blank(), &portrait_with_patch(PERSON_X));
        assert_eq!(outcome.failure().map(|f| f.kind), Some(FailureKind::NoFaceDetected));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let a = portrait_with_patch(PERSON_X);
        let b = portrait_with_patch(PERSON_Y);
        let measured = run(&FaceVerifier::default(), &a, &b);
        let distance = measured.verification().unwrap().distance;

        let outcome = run(&FaceVerifier::new(DistanceMetric::Cosine, distance), &a, &b);
        assert!(outcome.is_match(), "distance equal to threshold must match: {outcome:?}");
    }

    #[test]
    fn test_euclidean_l2_verify() {
        let verifier = FaceVerifier::with_metric(DistanceMetric::EuclideanL2);
        let a = portrait_with_patch(PERSON_X);
        let same = run(&verifier, &a, &a);
        assert!(same.is_match(), "{same:?}");
        assert_eq!(same.verification().unwrap().metric, DistanceMetric::EuclideanL2);

        // Centred mean colours of X and Y point apart: distance ~1.8 > 1.13.
        let different = run(&verifier, &a, &portrait_with_patch(PERSON_Y));
        let VerificationOutcome::NoMatch(v) = &different else {
            panic!("expected NoMatch, got {different:?}");
        };
        assert!((v.threshold - 1.13).abs() < 1e-6);
        assert!(v.distance > v.threshold);
    }

    #[test]
    fn test_backend_failure_is_reported() {
        struct Broken;
        impl FaceEmbed for Broken {
            fn extract(&mut self, _: &PixelBuffer, _: &crate::types::BoundingBox) -> Result<Embedding, crate::recognizer::RecognizerError> {
                Err(crate::recognizer::RecognizerError::InferenceFailed("session poisoned".into()))
            }
        }
        let a = portrait_with_patch(PERSON_X);
        let outcome = FaceVerifier::default().verify(&mut PatchDetector::default(), &mut Broken, &a, &a);
        let failure = outcome.failure().expect("error outcome");
        assert_eq!(failure.kind, FailureKind::Backend);
        assert!(failure.reason.contains("session poisoned"));
    }

    #[test]
    fn test_cosine_distance() {
        let v = FaceVerifier::with_metric(DistanceMetric::Cosine);
        assert!(v.distance(&emb(vec![1.0, 0.0]), &emb(vec![1.0, 0.0])).abs() < 1e-6);
        assert!((v.distance(&emb(vec![1.0, 0.0]), &emb(vec![0.0, 1.0])) - 1.0).abs() < 1e-6);
        assert!((v.threshold() - 0.68).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_distance_normalizes() {
        let v = FaceVerifier::with_metric(DistanceMetric::EuclideanL2);
        // Same direction, different magnitude: distance 0 after normalisation.
        assert!(v.distance(&emb(vec![3.0, 4.0]), &emb(vec![6.0, 8.0])).abs() < 1e-6);
        assert!((v.distance(&emb(vec![1.0, 0.0]), &emb(vec![0.0, 1.0])) - 2f32.sqrt()).abs() < 1e-6);
        assert!((v.threshold() - 1.13).abs() < 1e-6);
    }
}
