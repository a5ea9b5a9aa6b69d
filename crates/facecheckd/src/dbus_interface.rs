use crate::config::Config;
use crate::engine::EngineHandle;
use facecheck_core::presence::pyramid_sizes;
use facecheck_core::{Envelope, Failure, ImagePayload, ReferenceKey, VerificationOutcome};
use zbus::interface;

/// Well-known bus name and object path of the daemon.
pub const BUS_NAME: &str = "org.facecheck.FaceCheck1";
pub const OBJECT_PATH: &str = "/org/facecheck/FaceCheck1";

/// D-Bus interface for the facecheck verification daemon.
///
/// Every method answers with a JSON response envelope.
pub struct FaceCheckService {
    engine: EngineHandle,
    config: Config,
}

impl FaceCheckService {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self { engine, config }
    }
}

#[interface(name = "org.facecheck.FaceCheck1")]
impl FaceCheckService {
    /// Compare a captured frame against a caller-supplied reference frame.
    async fn verify_frames(&self, captured: String, reference: String) -> zbus::fdo::Result<String> {
        tracing::info!(captured_len = captured.len(), reference_len = reference.len(), "verify_frames requested");
        let envelope = match require("captured", &captured).and_then(|_| require("reference", &reference)) {
            Ok(()) => verification(self.engine.verify_frames(captured.into(), reference.into()).await),
            Err(failure) => Envelope::verification(&failure.into()),
        };
        Ok(envelope.to_json())
    }

    /// Compare a captured frame against the stored reference of `subject`.
    async fn verify_identity(&self, captured: String, subject: String) -> zbus::fdo::Result<String> {
        tracing::info!(subject = %subject, captured_len = captured.len(), "verify_identity requested");
        let envelope = match require("subject", &subject).and_then(|_| require("captured", &captured)) {
            Ok(()) => verification(
                self.engine
                    .verify_identity(captured.into(), ReferenceKey(subject))
                    .await,
            ),
            Err(failure) => Envelope::verification(&failure.into()),
        };
        Ok(envelope.to_json())
    }

    /// Report whether any face is present in `image`.
    async fn check_presence(&self, image: String) -> zbus::fdo::Result<String> {
        tracing::info!(image_len = image.len(), "check_presence requested");
        let result = match require("image", &image) {
            Ok(()) => self
                .engine
                .check_presence(image.into())
                .await
                .unwrap_or_else(|e| Err(engine_failure(e))),
            Err(failure) => Err(failure),
        };
        Ok(Envelope::presence(&result).to_json())
    }

    /// Store `image` as the reference face of `subject`.
    async fn enroll(&self, subject: String, image: String) -> zbus::fdo::Result<String> {
        tracing::info!(subject = %subject, image_len = image.len(), "enroll requested");
        let result = match require("subject", &subject).and_then(|_| require("image", &image)) {
            Ok(()) => self
                .engine
                .enroll(ReferenceKey(subject.clone()), ImagePayload::from(image))
                .await
                .unwrap_or_else(|e| Err(engine_failure(e))),
            Err(failure) => Err(failure),
        };
        Ok(Envelope::enrollment(&subject, &result).to_json())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let c = &self.config;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "scrfd_model": c.scrfd_model_path(),
            "arcface_model": c.arcface_model_path(),
            "reference_dir": c.reference_dir.display().to_string(),
            "distance_metric": c.distance_metric,
            "match_threshold": c.match_threshold,
            "detector_confidence": c.detector_confidence,
            "presence": {
                "scale_factor": c.presence_scale_factor,
                "min_neighbors": c.presence_min_neighbors,
                "min_size": c.presence_min_size,
                "levels": pyramid_sizes(c.presence_scale_factor),
            },
            "request_timeout_secs": c.request_timeout_secs,
        })
        .to_string())
    }
}

fn require(field: &str, value: &str) -> Result<(), Failure> {
    if value.trim().is_empty() {
        Err(Failure::malformed(format!("missing {field}")))
    } else {
        Ok(())
    }
}

fn engine_failure(err: crate::engine::EngineError) -> Failure {
    tracing::error!(error = %err, "engine request failed");
    err.into()
}

fn verification(result: Result<VerificationOutcome, crate::engine::EngineError>) -> Envelope {
    let outcome = result.unwrap_or_else(|e| VerificationOutcome::Error(engine_failure(e)));
    Envelope::verification(&outcome)
}
