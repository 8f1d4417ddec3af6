use crate::error::Result;
use crate::media::{LocalTrack, RemoteStream};
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Состояние транспорта соединения (ICE/DTLS), не путать с состоянием согласования
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(st: RTCPeerConnectionState) -> Self {
        match st {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Негоциируемое соединение с одним пиром
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn OutboundSender>>;
    async fn senders(&self) -> Vec<Arc<dyn OutboundSender>>;
    async fn close(&self) -> Result<()>;
}

/// Исходящий sender одного трека. `enabled` относится только к этому соединению.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    fn track_id(&self) -> String;
    fn is_enabled(&self) -> bool;
    async fn set_enabled(&self, enabled: bool) -> Result<()>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, ctx: ConnectionContext) -> Result<Arc<dyn PeerConnection>>;
}

/// То, что фабрика получает при создании соединения для конкретной сессии
#[derive(Clone)]
pub struct ConnectionContext {
    pub peer_id: String,
    pub generation: u64,
    pub events: ConnectionEvents,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    LocalCandidate {
        peer_id: String,
        generation: u64,
        candidate: IceCandidate,
    },
    GatheringComplete {
        peer_id: String,
        generation: u64,
    },
    RemoteTrack {
        peer_id: String,
        generation: u64,
        stream: RemoteStream,
    },
    StateChanged {
        peer_id: String,
        generation: u64,
        state: ConnectionState,
    },
    GraceExpired {
        peer_id: String,
        generation: u64,
    },
    NegotiationDeadline {
        peer_id: String,
        generation: u64,
    },
}

/// Колбэки соединения, привязанные к (peer_id, generation).
/// Они только публикуют события и не трогают таблицу сессий.
#[derive(Clone)]
pub struct ConnectionEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    pub fn new(
        peer_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.post(ConnectionEvent::LocalCandidate {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            candidate,
        });
    }

    pub fn gathering_complete(&self) {
        self.post(ConnectionEvent::GatheringComplete {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
        });
    }

    pub fn remote_track(&self, stream: RemoteStream) {
        self.post(ConnectionEvent::RemoteTrack {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            stream,
        });
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.post(ConnectionEvent::StateChanged {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            state,
        });
    }

    pub(crate) fn grace_expired(&self) {
        self.post(ConnectionEvent::GraceExpired {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
        });
    }

    pub(crate) fn negotiation_deadline(&self) {
        self.post(ConnectionEvent::NegotiationDeadline {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
        });
    }

    fn post(&self, event: ConnectionEvent) {
        // negotiator уже удалён - событие никому не нужно
        let _ = self.tx.send(event);
    }
}
