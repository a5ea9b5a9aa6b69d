//! JSON response envelope returned to callers.

use crate::outcome::{Failure, FailureKind, VerificationOutcome};
use crate::types::FacePresence;
use serde::{Deserialize, Serialize};

/// Message exposed to callers for backend failures; details stay in the log.
pub const INTERNAL_ERROR: &str = "internal error";

/// `{success, data, error, status_code}` as serialised on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub data: Option<ResponseData>,
    pub error: Option<String>,
    pub status_code: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Match(MatchData),
    Presence(PresenceData),
    Enrollment(EnrollmentData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchData {
    #[serde(rename = "match")]
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub face_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentData {
    pub subject: String,
    pub bytes: usize,
}

impl Envelope {
    fn ok(data: ResponseData) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            status_code: 200,
        }
    }

    /// Error envelope without data.
    pub fn failure(failure: &Failure) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(public_reason(failure)),
            status_code: failure.status_code(),
        }
    }

    /// Verification envelope. An error outcome still reports `match: false`.
    pub fn verification(outcome: &VerificationOutcome) -> Self {
        match outcome {
            VerificationOutcome::Match(v) | VerificationOutcome::NoMatch(v) => Self::ok(ResponseData::Match(MatchData {
                matched: outcome.is_match(),
                distance: Some(v.distance),
                threshold: Some(v.threshold),
            })),
            VerificationOutcome::Error(failure) => Self {
                data: Some(ResponseData::Match(MatchData {
                    matched: false,
                    distance: None,
                    threshold: None,
                })),
                ..Self::failure(failure)
            },
        }
    }

    pub fn presence(result: &Result<FacePresence, Failure>) -> Self {
        match result {
            Ok(presence) => Self::ok(ResponseData::Presence(PresenceData {
                face_exists: presence.face_exists,
            })),
            Err(failure) => Self::failure(failure),
        }
    }

    pub fn enrollment(subject: &str, result: &Result<usize, Failure>) -> Self {
        match result {
            Ok(bytes) => Self::ok(ResponseData::Enrollment(EnrollmentData {
                subject: subject.to_string(),
                bytes: *bytes,
            })),
            Err(failure) => Self::failure(failure),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "envelope serialization failed");
            format!(
                r#"{{"success":false,"data":null,"error":"{INTERNAL_ERROR}","status_code":500}}"#
            )
        })
    }
}

fn public_reason(failure: &Failure) -> String {
    match failure.kind {
        FailureKind::Backend => INTERNAL_ERROR.to_string(),
        _ => failure.reason.clone(),
    }
}
