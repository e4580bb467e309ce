use thiserror::Error;

use crate::config::ConfigError;
use crate::media::MediaError;
use crate::signaling::SignalingError;
use crate::transport::TransportError;

/// Why the relay refused a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    RoomFull,
    RoomNotFound,
    DuplicateJoin,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::RoomFull => write!(f, "Room is full"),
            RejectReason::RoomNotFound => write!(f, "Room not found or expired"),
            RejectReason::DuplicateJoin => write!(f, "You are already in this room"),
        }
    }
}

/// Coarse classification used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Required runtime support is missing; reported once, never retried.
    CapabilityAbsent,
    /// Camera, microphone or display capture was denied or unavailable.
    DeviceAccess,
    /// A description or candidate was rejected by a transport.
    Negotiation,
    /// The relay refused the join attempt.
    RoomRejected,
    /// Anything else.
    Unexpected,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not supported: {0}")]
    Capability(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Negotiation with {participant_id} failed: {reason}")]
    Negotiation {
        participant_id: String,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Join rejected: {0}")]
    RoomRejected(RejectReason),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No local media stream")]
    NoLocalStream,

    #[error("Session is closed")]
    SessionClosed,
}

impl Error {
    pub fn negotiation(participant_id: &str, err: impl std::fmt::Display) -> Self {
        Error::Negotiation {
            participant_id: participant_id.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Capability(_) => ErrorCategory::CapabilityAbsent,
            Error::Media(MediaError::Unsupported(_)) => ErrorCategory::CapabilityAbsent,
            Error::Media(_) => ErrorCategory::DeviceAccess,
            Error::Negotiation { .. } | Error::Transport(_) => ErrorCategory::Negotiation,
            Error::RoomRejected(_) => ErrorCategory::RoomRejected,
            _ => ErrorCategory::Unexpected,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
