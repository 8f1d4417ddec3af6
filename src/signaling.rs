//! Signaling-транспорт: сообщения offer/answer/candidate через relay.

mod memory;
mod ws;

pub use memory::{MemoryRelay, MemoryTransport};
pub use ws::WsTransport;

use crate::error::{Error, Result};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
            SignalKind::Candidate => f.write_str("candidate"),
        }
    }
}

/// Сообщение протокола. На исходящем `peer_id` - адресат, на входящем - отправитель.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        #[serde(rename = "peerId")]
        peer_id: String,
        payload: SessionDescription,
    },
    Answer {
        #[serde(rename = "peerId")]
        peer_id: String,
        payload: SessionDescription,
    },
    Candidate {
        #[serde(rename = "peerId")]
        peer_id: String,
        payload: IceCandidate,
    },
}

impl SignalMessage {
    pub fn offer(peer_id: impl Into<String>, payload: SessionDescription) -> Self {
        SignalMessage::Offer {
            peer_id: peer_id.into(),
            payload,
        }
    }

    pub fn answer(peer_id: impl Into<String>, payload: SessionDescription) -> Self {
        SignalMessage::Answer {
            peer_id: peer_id.into(),
            payload,
        }
    }

    pub fn candidate(peer_id: impl Into<String>, payload: IceCandidate) -> Self {
        SignalMessage::Candidate {
            peer_id: peer_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::Offer { .. } => SignalKind::Offer,
            SignalMessage::Answer { .. } => SignalKind::Answer,
            SignalMessage::Candidate { .. } => SignalKind::Candidate,
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            SignalMessage::Offer { peer_id, .. }
            | SignalMessage::Answer { peer_id, .. }
            | SignalMessage::Candidate { peer_id, .. } => peer_id,
        }
    }

    /// Relay подменяет адресата на отправителя
    pub fn with_peer_id(mut self, id: impl Into<String>) -> Self {
        match &mut self {
            SignalMessage::Offer { peer_id, .. }
            | SignalMessage::Answer { peer_id, .. }
            | SignalMessage::Candidate { peer_id, .. } => *peer_id = id.into(),
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_id().trim().is_empty() {
            return Err(Error::invalid_message(format!(
                "{} without peerId",
                self.kind()
            )));
        }
        match self {
            SignalMessage::Offer { payload, .. } => check_description(payload, SdpKind::Offer),
            SignalMessage::Answer { payload, .. } => check_description(payload, SdpKind::Answer),
            SignalMessage::Candidate { payload, .. } => {
                if payload.candidate.trim().is_empty() {
                    // end-of-candidates нам не нужен
                    return Err(Error::invalid_message("empty candidate"));
                }
                Ok(())
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Разбор и проверка на границе транспорта
    pub fn from_json(raw: &str) -> Result<Self> {
        let msg: SignalMessage = serde_json::from_str(raw)?;
        msg.validate()?;
        Ok(msg)
    }
}

fn check_description(desc: &SessionDescription, expected: SdpKind) -> Result<()> {
    if desc.kind != expected {
        return Err(Error::invalid_message(format!(
            "{expected} message carries a {} description",
            desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(Error::invalid_message(format!("{expected} with empty sdp")));
    }
    Ok(())
}

pub type ReceiveHandler = Box<dyn Fn(SignalMessage) + Send + Sync>;

/// Канал до relay-сервера. Доставка best-effort, без подтверждений.
pub trait SignalingTransport: Send + Sync {
    /// Ставит сообщение в очередь и сразу возвращается
    fn send(&self, message: SignalMessage);

    /// Колбэк вызывается по одному разу на каждое входящее сообщение
    fn on_receive(&self, handler: ReceiveHandler);
}
