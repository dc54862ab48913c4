//! Error taxonomy shared by hardware, recognition, bus and correlator
//!
//! Every failure that reaches a user surfaces as a `SYSTEM_ERROR` event
//! carrying an [`ErrorCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error code carried in `SYSTEM_ERROR` payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    HardwareUnavailable,
    CameraBusy,
    RecognitionTransient,
    RecognitionPermanent,
    SessionTimeout,
    MalformedEvent,
    HandlerFailed,
    Cancelled,
    NothingToTake,
    FridgeFull,
    StoreUnavailable,
    Shutdown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::HardwareUnavailable => "hardware_unavailable",
            ErrorCode::CameraBusy => "camera_busy",
            ErrorCode::RecognitionTransient => "recognition_transient",
            ErrorCode::RecognitionPermanent => "recognition_permanent",
            ErrorCode::SessionTimeout => "session_timeout",
            ErrorCode::MalformedEvent => "malformed_event",
            ErrorCode::HandlerFailed => "handler_failed",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::NothingToTake => "nothing_to_take",
            ErrorCode::FridgeFull => "fridge_full",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::Shutdown => "shutdown",
        }
    }
}

/// Failures of the physical or simulated driver layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    #[error("hardware unavailable: {0}")]
    Unavailable(String),

    #[error("camera busy: another capture is in flight")]
    CameraBusy,
}

impl HardwareError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HardwareError::Unavailable(_) => ErrorCode::HardwareUnavailable,
            HardwareError::CameraBusy => ErrorCode::CameraBusy,
        }
    }
}

/// Classifier failures, split by whether a retry can help
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecognitionError {
    /// Network failure, timeout, rate limit or server error
    #[error("transient recognition failure: {0}")]
    Transient(String),

    /// Malformed response, empty image or rejected request
    #[error("permanent recognition failure: {0}")]
    Permanent(String),
}

impl RecognitionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RecognitionError::Transient(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RecognitionError::Transient(_) => ErrorCode::RecognitionTransient,
            RecognitionError::Permanent(_) => ErrorCode::RecognitionPermanent,
        }
    }
}

/// An event rejected at the bus boundary
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed event: {0}")]
pub struct MalformedEvent(pub String);

/// Errors returned to bus publishers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    #[error("event queue full")]
    QueueFull,

    #[error("event bus closed")]
    Closed,

    #[error(transparent)]
    Malformed(#[from] MalformedEvent),
}

/// Errors from the inventory writer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("inventory writer stopped")]
    WriterStopped,

    #[error("fridge is full: all {capacity} sections occupied")]
    Full { capacity: usize },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::WriterStopped => ErrorCode::StoreUnavailable,
            StoreError::Full { .. } => ErrorCode::FridgeFull,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognition_error_classification() {
        assert!(RecognitionError::Transient("timeout".into()).is_transient());
        assert!(!RecognitionError::Permanent("bad json".into()).is_transient());
        assert_eq!(
            RecognitionError::Permanent("x".into()).code(),
            ErrorCode::RecognitionPermanent
        );
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::SessionTimeout).unwrap();
        assert_eq!(json, "\"SESSION_TIMEOUT\"");
        assert_eq!(HardwareError::CameraBusy.code(), ErrorCode::CameraBusy);
    }

    #[test]
    fn test_store_error_codes() {
        assert_eq!(StoreError::WriterStopped.code(), ErrorCode::StoreUnavailable);
        assert_eq!(StoreError::Full { capacity: 20 }.code(), ErrorCode::FridgeFull);
        let json = serde_json::to_string(&ErrorCode::StoreUnavailable).unwrap();
        assert_eq!(json, "\"STORE_UNAVAILABLE\"");
    }
}
