//! События для UI-оболочки.

use crate::call::{CallState, TerminateReason};
use crate::session::Role;
use crate::signaling::SignalKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CallEvent {
    StateChanged { state: CallState },
    SessionOpened { peer_id: String, role: Role },
    SessionEstablished { peer_id: String },
    SessionClosed { peer_id: String, reason: String },
    ConnectionProblem { peer_id: String },
    ConnectionRecovered { peer_id: String },
    SignalingDropped {
        peer_id: String,
        kind: SignalKind,
        reason: String,
    },
    NegotiationRejected { peer_id: String, detail: String },
    RemoteStream { peer_id: String, stream_id: String },
    DeviceFailed { message: String },
    SpeakerToggled { on: bool },
    RecordingStarted,
    RecordingStopped { fragments: usize },
    CallEnded { reason: TerminateReason },
}

impl CallEvent {
    /// Имя события в духе `duocall-connected`
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::StateChanged { .. } => "duocall-state",
            CallEvent::SessionOpened { .. } => "duocall-session-opened",
            CallEvent::SessionEstablished { .. } => "duocall-connected",
            CallEvent::SessionClosed { .. } => "duocall-disconnected",
            CallEvent::ConnectionProblem { .. } => "duocall-connection-problem",
            CallEvent::ConnectionRecovered { .. } => "duocall-connection-recovered",
            CallEvent::SignalingDropped { .. } => "duocall-signaling-dropped",
            CallEvent::NegotiationRejected { .. } => "duocall-negotiation-rejected",
            CallEvent::RemoteStream { .. } => "duocall-remote-stream",
            CallEvent::DeviceFailed { .. } => "duocall-device-failed",
            CallEvent::SpeakerToggled { .. } => "duocall-speaker",
            CallEvent::RecordingStarted => "duocall-recording-started",
            CallEvent::RecordingStopped { .. } => "duocall-recording-stopped",
            CallEvent::CallEnded { .. } => "duocall-call-ended",
        }
    }
}

#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: CallEvent) {
        trace!(event = event.name(), "emit");
        // Нет подписчиков - не ошибка
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }
}
