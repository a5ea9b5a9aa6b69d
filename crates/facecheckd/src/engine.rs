use crate::config::Config;
use crate::store::{self, DirectoryStore, StoreError};
use facecheck_core::detector::DetectorError;
use facecheck_core::recognizer::RecognizerError;
use facecheck_core::{
    FaceDetect, FaceDetector, FaceEmbed, FacePresence, FaceRecognizer, Failure, ImagePayload, ReferenceKey,
    VerificationOutcome, VerificationService,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests the engine accepts before callers wait on send.
const QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("reference store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EngineError> for Failure {
    fn from(err: EngineError) -> Self {
        Failure::backend(err.to_string())
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    VerifyFrames {
        captured: ImagePayload,
        reference: ImagePayload,
        reply: oneshot::Sender<VerificationOutcome>,
    },
    VerifyIdentity {
        captured: ImagePayload,
        subject: ReferenceKey,
        reply: oneshot::Sender<VerificationOutcome>,
    },
    CheckPresence {
        image: ImagePayload,
        reply: oneshot::Sender<Result<FacePresence, Failure>>,
    },
    Enroll {
        subject: ReferenceKey,
        image: ImagePayload,
        reply: oneshot::Sender<Result<usize, Failure>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Compare two caller-supplied frames.
    pub async fn verify_frames(
        &self,
        captured: ImagePayload,
        reference: ImagePayload,
    ) -> Result<VerificationOutcome, EngineError> {
        self.call(|reply| EngineRequest::VerifyFrames {
            captured,
            reference,
            reply,
        })
        .await
    }

    /// Compare a captured frame against the stored reference of `subject`.
    pub async fn verify_identity(
        &self,
        captured: ImagePayload,
        subject: ReferenceKey,
    ) -> Result<VerificationOutcome, EngineError> {
        self.call(|reply| EngineRequest::VerifyIdentity {
            captured,
            subject,
            reply,
        })
        .await
    }

    pub async fn check_presence(&self, image: ImagePayload) -> Result<Result<FacePresence, Failure>, EngineError> {
        self.call(|reply| EngineRequest::CheckPresence { image, reply }).await
    }

    /// Validate and compress `image`, then store it as the reference of
    /// `subject`. Returns the stored size in bytes.
    pub async fn enroll(
        &self,
        subject: ReferenceKey,
        image: ImagePayload,
    ) -> Result<Result<usize, Failure>, EngineError> {
        self.call(|reply| EngineRequest::Enroll { subject, image, reply }).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(request(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };
        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Load both ONNX models and the reference store, then start the engine.
///
/// Fails fast at startup if any resource is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&scrfd_path, config.detector_confidence)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    let store = DirectoryStore::open(&config.reference_dir)?;

    let service = VerificationService::new(detector, recognizer, config.verifier(), config.service_settings());
    spawn_with(service, store, config.request_timeout())
}

/// Run `service` on a dedicated OS thread that owns it for the life of the process.
pub fn spawn_with<D, E>(
    mut service: VerificationService<D, E>,
    store: DirectoryStore,
    timeout: Duration,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetect + Send + 'static,
    E: FaceEmbed + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facecheck-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut service, &store, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

fn handle<D: FaceDetect, E: FaceEmbed>(
    service: &mut VerificationService<D, E>,
    store: &DirectoryStore,
    req: EngineRequest,
) {
    // A dropped receiver means the caller timed out; the reply is discarded.
    match req {
        EngineRequest::VerifyFrames {
            captured,
            reference,
            reply,
        } => {
            let _ = reply.send(service.verify_by_frames(&captured, &reference));
        }
        EngineRequest::VerifyIdentity {
            captured,
            subject,
            reply,
        } => {
            let outcome = match store::validate_key(&subject) {
                Ok(()) => service.verify_by_identity(&captured, &subject, store),
                Err(e) => VerificationOutcome::Error(Failure::malformed(e.to_string())),
            };
            let _ = reply.send(outcome);
        }
        EngineRequest::CheckPresence { image, reply } => {
            let _ = reply.send(service.check_presence(&image));
        }
        EngineRequest::Enroll { subject, image, reply } => {
            let _ = reply.send(run_enroll(service, store, &subject, &image));
        }
    }
}

fn run_enroll<D: FaceDetect, E: FaceEmbed>(
    service: &mut VerificationService<D, E>,
    store: &DirectoryStore,
    subject: &ReferenceKey,
    image: &ImagePayload,
) -> Result<usize, Failure> {
    store::validate_key(subject).map_err(|e| Failure::malformed(e.to_string()))?;
    let jpeg = service.prepare_reference(image)?;
    store.store(subject, &jpeg).map_err(|e| {
        tracing::error!(subject = %subject, error = %e, "failed to store reference");
        Failure::backend(e.to_string())
    })?;
    Ok(jpeg.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facecheck_core::testing::{blank, png_base64, portrait_with_patch, MeanColorEmbedder, PatchDetector};
    use facecheck_core::{BoundingBox, FaceVerifier, FailureKind, PixelBuffer, ServiceSettings};
    use tempfile::TempDir;

    pub(crate) const PERSON_X: [u8; 3] = [200, 160, 140];
    pub(crate) const PERSON_Y: [u8; 3] = [60, 90, 200];

    pub(crate) fn portrait(color: [u8; 3]) -> String {
        png_base64(&portrait_with_patch(color))
    }

    pub(crate) fn empty_room() -> String {
        png_base64(&blank())
    }

    /// Engine over fake backends and a temporary reference store.
    pub(crate) fn fake_engine(timeout: Duration) -> (TempDir, EngineHandle) {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let service = VerificationService::new(
            PatchDetector::default(),
            MeanColorEmbedder,
            FaceVerifier::default(),
            ServiceSettings::default(),
        );
        let handle = spawn_with(service, store, timeout).unwrap();
        (dir, handle)
    }

    #[tokio::test]
    async fn test_verify_frames_round_trip() {
        let (_dir, engine) = fake_engine(Duration::from_secs(10));
        let same = engine
            .verify_frames(portrait(PERSON_X).into(), portrait(PERSON_X).into())
            .await
            .unwrap();
        assert!(same.is_match());
        let different = engine
            .verify_frames(portrait(PERSON_X).into(), portrait(PERSON_Y).into())
            .await
            .unwrap();
        assert!(matches!(different, VerificationOutcome::NoMatch(_)));
    }

    #[tokio::test]
    async fn test_enroll_then_verify_identity() {
        let (dir, engine) = fake_engine(Duration::from_secs(10));
        let bytes = engine
            .enroll(ReferenceKey::from("s-001"), portrait(PERSON_X).into())
            .await
            .unwrap()
            .unwrap();
        assert!(bytes > 0);
        assert!(dir.path().join("s-001.jpg").exists());

        let outcome = engine
            .verify_identity(portrait(PERSON_X).into(), ReferenceKey::from("s-001"))
            .await
            .unwrap();
        assert!(outcome.is_match(), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_enroll_rejects_empty_room() {
        let (dir, engine) = fake_engine(Duration::from_secs(10));
        let failure = engine
            .enroll(ReferenceKey::from("s-002"), empty_room().into())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::NoFaceDetected);
        assert!(!dir.path().join("s-002.jpg").exists());
    }

    #[tokio::test]
    async fn test_verify_identity_unknown_and_invalid_keys() {
        let (_dir, engine) = fake_engine(Duration::from_secs(10));
        let outcome = engine
            .verify_identity(portrait(PERSON_X).into(), ReferenceKey::from("nobody"))
            .await
            .unwrap();
        assert_eq!(outcome.failure().map(|f| f.kind), Some(FailureKind::NotFound));

        let outcome = engine
            .verify_identity(portrait(PERSON_X).into(), ReferenceKey::from("../etc/passwd"))
            .await
            .unwrap();
        assert_eq!(outcome.failure().map(|f| f.kind), Some(FailureKind::MalformedInput));
    }

    #[tokio::test]
    async fn test_check_presence() {
        let (_dir, engine) = fake_engine(Duration::from_secs(10));
        let present = engine.check_presence(portrait(PERSON_Y).into()).await.unwrap().unwrap();
        assert!(present.face_exists);
        let absent = engine.check_presence(empty_room().into()).await.unwrap().unwrap();
        assert!(!absent.face_exists);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        struct Slow;
        impl FaceDetect for Slow {
            fn candidates(&mut self, _: &PixelBuffer, _: usize) -> Result<Vec<BoundingBox>, DetectorError> {
                std::thread::sleep(Duration::from_millis(100));
                Ok(Vec::new())
            }
        }
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let service = VerificationService::new(Slow, MeanColorEmbedder, FaceVerifier::default(), ServiceSettings::default());
        let engine = spawn_with(service, store, Duration::from_millis(50)).unwrap();

        let err = engine.check_presence(portrait(PERSON_X).into()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(Failure::from(err).kind, FailureKind::Backend);
    }
}
