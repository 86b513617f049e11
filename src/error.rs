#![forbid(unsafe_code)]

// Error taxonomy for signaling operations

use crate::media::MediaError;
use thiserror::Error;

/// Every signaling operation fails with one of these.
/// The `Display` text is what the client sees in `error.message`.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("cannot consume producer {0} with the negotiated capabilities")]
    CapabilityMismatch(String),

    #[error("invalid request: {0}")]
    ValidationError(String),

    #[error("media engine error: {0}")]
    MediaEngineError(#[from] MediaError),
}

impl SignalingError {
    pub fn room_not_found(room_id: &str) -> Self {
        Self::NotFound(format!("room {room_id}"))
    }

    pub fn peer_not_found(peer_id: &str) -> Self {
        Self::NotFound(format!("peer {peer_id}"))
    }

    /// Short machine-readable tag, used in logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::CapabilityMismatch(_) => "capability_mismatch",
            Self::ValidationError(_) => "validation_error",
            Self::MediaEngineError(_) => "media_engine_error",
        }
    }
}

pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_client_readable() {
        assert_eq!(SignalingError::room_not_found("r1").to_string(), "room r1 not found");
        assert_eq!(
            SignalingError::PreconditionFailed("transport not found".into()).to_string(),
            "transport not found"
        );
        let err: SignalingError = MediaError::TransportError("dtls failed".into()).into();
        assert_eq!(err.code(), "media_engine_error");
        assert_eq!(err.to_string(), "media engine error: Transport error: dtls failed");
    }
}
