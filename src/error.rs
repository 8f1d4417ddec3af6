//! Типы ошибок signaling-ядра.

use crate::session::NegotiationState;
use crate::signaling::SignalKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Ошибки устройства захвата. Звонок без них не стартует.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("no capture device available")]
    NotFound,

    #[error("invalid media constraints: {0}")]
    InvalidConstraints(String),

    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Сообщение потеряно или сессия не найдена.
    #[error("signaling dropped for peer {peer_id}: {reason}")]
    SignalingDropped { peer_id: String, reason: String },

    /// answer/candidate пришёл в состоянии, которое его не ожидает.
    #[error("negotiation mismatch for peer {peer_id}: {kind} received in state {state:?}")]
    NegotiationMismatch {
        peer_id: String,
        kind: SignalKind,
        state: NegotiationState,
    },

    #[error("session already exists for peer {0}")]
    SessionExists(String),

    #[error("no session for peer {0}")]
    SessionNotFound(String),

    #[error("invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("invalid call state: {0}")]
    InvalidState(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("recording error: {0}")]
    Recording(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_message(msg: impl std::fmt::Display) -> Self {
        Self::InvalidMessage(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }
}
