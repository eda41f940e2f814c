//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **VoiceError**: the domain taxonomy used by the orchestrator core. Every
//!   per-turn failure has a variant so the session runtime can decide whether to
//!   recover locally or tear the session down.
//! - **AppError**: what the HTTP control plane returns to clients. It wraps domain
//!   errors and maps them onto status codes with a consistent JSON body.
//!
//! ## Recovery policy at a glance:
//! - `BufferOverflow`, `DetectorFailure`: logged, session continues
//! - `RecognitionFailure`, `DialogueFailure`, `SynthesisFailure`,
//!   `CancellationTimeout`: turn abandoned, session back to listening
//! - `TransportDisconnected`, `InvalidTransition`, `InvariantViolation`: session terminated

use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::adapters::AdapterKind;
use crate::session::machine::SessionState;

/// Result alias for orchestrator operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors raised inside a voice session.
///
/// ## Rust Concepts:
/// - **thiserror**: `#[error(...)]` generates the `Display` impl for each variant
/// - **Clone**: errors travel between worker tasks and the session loop over channels
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("buffer overflow: open utterance exceeded {max_ms}ms")]
    BufferOverflow { max_ms: u64 },

    #[error("voice activity detector failed: {0}")]
    DetectorFailure(String),

    #[error("recognition failed: {0}")]
    RecognitionFailure(String),

    #[error("dialogue engine failed: {0}")]
    DialogueFailure(String),

    #[error("synthesis failed: {0}")]
    SynthesisFailure(String),

    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("{adapter} did not acknowledge cancellation within {timeout_ms}ms")]
    CancellationTimeout { adapter: AdapterKind, timeout_ms: u64 },

    #[error("invalid transition: {trigger} is not valid in state {state}")]
    InvalidTransition { state: SessionState, trigger: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimitReached(usize),

    #[error("inbound queue full for session {0}")]
    InboundQueueFull(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl VoiceError {
    /// The soft-error bucket this error is counted under, if it is recoverable.
    pub fn soft_kind(&self) -> Option<SoftErrorKind> {
        match self {
            VoiceError::BufferOverflow { .. } => Some(SoftErrorKind::BufferOverflow),
            VoiceError::DetectorFailure(_) => Some(SoftErrorKind::DetectorFailure),
            VoiceError::RecognitionFailure(_) => Some(SoftErrorKind::RecognitionFailure),
            VoiceError::DialogueFailure(_) => Some(SoftErrorKind::DialogueFailure),
            VoiceError::SynthesisFailure(_) => Some(SoftErrorKind::SynthesisFailure),
            VoiceError::CancellationTimeout { .. } => Some(SoftErrorKind::CancellationTimeout),
            _ => None,
        }
    }

    /// Whether this error must end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::TransportDisconnected(_)
                | VoiceError::InvalidTransition { .. }
                | VoiceError::InvariantViolation(_)
        )
    }
}

/// Buckets for recoverable failures surfaced through session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftErrorKind {
    BufferOverflow,
    DetectorFailure,
    RecognitionFailure,
    DialogueFailure,
    SynthesisFailure,
    CancellationTimeout,
}

/// Per-kind soft error counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoftErrorCounts {
    pub buffer_overflow: u32,
    pub detector_failure: u32,
    pub recognition_failure: u32,
    pub dialogue_failure: u32,
    pub synthesis_failure: u32,
    pub cancellation_timeout: u32,
}

impl SoftErrorCounts {
    pub fn record(&mut self, kind: SoftErrorKind) {
        let counter = match kind {
            SoftErrorKind::BufferOverflow => &mut self.buffer_overflow,
            SoftErrorKind::DetectorFailure => &mut self.detector_failure,
            SoftErrorKind::RecognitionFailure => &mut self.recognition_failure,
            SoftErrorKind::DialogueFailure => &mut self.dialogue_failure,
            SoftErrorKind::SynthesisFailure => &mut self.synthesis_failure,
            SoftErrorKind::CancellationTimeout => &mut self.cancellation_timeout,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u32 {
        self.buffer_overflow
            + self.detector_failure
            + self.recognition_failure
            + self.dialogue_failure
            + self.synthesis_failure
            + self.cancellation_timeout
    }
}

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested session or resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: Capacity exhausted, try again later (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON responses:
/// ```json
/// { "error": { "type": "not_found", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            VoiceError::SessionLimitReached(_) | VoiceError::InboundQueueFull(_) => {
                AppError::Unavailable(err.to_string())
            }
            VoiceError::Config(_) => AppError::ValidationError(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// `?` on an anyhow error inside a handler becomes a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_error_classification() {
        assert_eq!(
            VoiceError::RecognitionFailure("boom".into()).soft_kind(),
            Some(SoftErrorKind::RecognitionFailure)
        );
        assert_eq!(VoiceError::TransportDisconnected("gone".into()).soft_kind(), None);
        assert!(VoiceError::TransportDisconnected("gone".into()).is_fatal());
        assert!(!VoiceError::SynthesisFailure("x".into()).is_fatal());
    }

    #[test]
    fn test_soft_error_counts() {
        let mut counts = SoftErrorCounts::default();
        counts.record(SoftErrorKind::DialogueFailure);
        counts.record(SoftErrorKind::DialogueFailure);
        counts.record(SoftErrorKind::CancellationTimeout);
        assert_eq!(counts.dialogue_failure, 2);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_voice_error_maps_to_http() {
        let not_found: AppError = VoiceError::SessionNotFound("abc".into()).into();
        assert!(matches!(not_found, AppError::NotFound(_)));
        let full: AppError = VoiceError::SessionLimitReached(3).into();
        assert!(matches!(full, AppError::Unavailable(_)));
    }
}
