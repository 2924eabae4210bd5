use thiserror::Error;

use crate::call::InvalidTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinBlock {
    NotLeft,
    MissingAnnouncement,
    WindowElapsed,
    NotEligible,
}

impl std::fmt::Display for RejoinBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejoinBlock::NotLeft => "call is not in the left state",
            RejoinBlock::MissingAnnouncement => "no announcement available for this call",
            RejoinBlock::WindowElapsed => "rejoin window has elapsed",
            RejoinBlock::NotEligible => "server reports the call is not rejoinable",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected to the signaling server")]
    NotConnected,

    #[error("Gave up reconnecting after {attempts} attempts")]
    MaxReconnects { attempts: u32 },

    #[error("Signaling server rejected authentication (close code {code})")]
    AuthRejected { code: u16 },

    #[error("User is busy")]
    Busy,

    #[error("A call is already in progress")]
    AlreadyInCall,

    #[error("Peer identity key was not cached for call {0}")]
    MissingPeerIdentityKey(String),

    #[error("Native engine error: {0}")]
    Engine(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Cannot rejoin: {0}")]
    RejoinUnavailable(RejoinBlock),

    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Server assigned call id {assigned} to offer {offered}")]
    CallIdMismatch { offered: String, assigned: String },

    #[error("No such call")]
    NoSuchCall,

    #[error("Call changed while the operation was in flight")]
    Stale,
}

impl CallError {
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            CallError::MaxReconnects { .. }
                | CallError::AuthRejected { .. }
                | CallError::PermissionDenied(_)
                | CallError::MissingPeerIdentityKey(_)
                | CallError::Busy
                | CallError::AlreadyInCall
        )
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
