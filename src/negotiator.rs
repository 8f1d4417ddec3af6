//! Согласование сессий: offer/answer/candidate для каждого пира.
//!
//! Все продолжения после await проверяют, что (peer_id, generation)
//! всё ещё живая сессия. Иначе результат - `Outcome::Stale`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CallEvent, EventEmitter};
use crate::media::MediaPipeline;
use crate::peer::connection::{
    ConnectionContext, ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState,
    PeerConnection,
};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::session::{NegotiationState, PeerSession, Role, SessionTable};
use crate::signaling::{SignalKind, SignalMessage, SignalingTransport};
use crate::utils::lock;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NegotiatorSettings {
    pub local_id: String,
    pub negotiation_timeout: Duration,
    pub grace_period: Duration,
    pub max_pending_candidates: usize,
}

impl NegotiatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local_id: config.local_id.clone(),
            negotiation_timeout: config.negotiation_timeout(),
            grace_period: config.grace_period(),
            max_pending_candidates: config.max_pending_candidates,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownPeer,
    NotAccepting,
    OfferCollision,
    QueueFull,
}

/// Чем закончилась обработка одного сигнального сообщения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Answered,
    OfferSent,
    AnswerApplied,
    CandidateApplied,
    CandidateQueued,
    Dropped(DropReason),
    /// Сессию закрыли или заменили, пока шла обработка
    Stale,
}

pub struct Negotiator {
    settings: NegotiatorSettings,
    transport: Arc<dyn SignalingTransport>,
    factory: Arc<dyn ConnectionFactory>,
    media: Arc<MediaPipeline>,
    events: EventEmitter,
    sessions: Mutex<SessionTable>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Negotiator {
    /// Запускает цикл событий соединений, поэтому нужен рантайм tokio
    pub fn new(
        settings: NegotiatorSettings,
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn ConnectionFactory>,
        media: Arc<MediaPipeline>,
        events: EventEmitter,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidState(format!("no tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(Self {
            sessions: Mutex::new(SessionTable::new(settings.max_pending_candidates)),
            settings,
            transport,
            factory,
            media,
            events,
            connection_events: tx,
        });
        runtime.spawn(Self::run_connection_events(Arc::downgrade(&negotiator), rx));
        Ok(negotiator)
    }

    async fn run_connection_events(
        negotiator: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(negotiator) = negotiator.upgrade() else {
                break;
            };
            negotiator.on_connection_event(event).await;
        }
        debug!("connection event loop finished");
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        lock(&self.sessions)
    }

    pub fn local_id(&self) -> &str {
        &self.settings.local_id
    }

    /// Выключенный negotiator отклоняет входящие offer'ы и не открывает сессии
    pub fn set_accepting(&self, accepting: bool) {
        self.table().set_open(accepting);
    }

    pub fn is_accepting(&self) -> bool {
        self.table().is_open()
    }

    pub fn session_count(&self) -> usize {
        self.table().len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.table().peer_ids()
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.table().get(peer_id).is_some()
    }

    pub fn state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.table().get(peer_id).map(PeerSession::state)
    }

    pub fn pending_candidates(&self, peer_id: &str) -> Option<usize> {
        self.table().get(peer_id).map(PeerSession::pending_candidates)
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<dyn PeerConnection>> {
        self.table().get(peer_id).map(|s| s.connection.clone())
    }

    fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.table().is_current(peer_id, generation)
    }

    pub async fn handle(&self, message: SignalMessage) -> Result<Outcome> {
        message.validate()?;
        match message {
            SignalMessage::Offer { peer_id, payload } => self.on_offer(&peer_id, payload).await,
            SignalMessage::Answer { peer_id, payload } => self.on_answer(&peer_id, payload).await,
            SignalMessage::Candidate { peer_id, payload } => {
                self.on_candidate(&peer_id, payload).await
            }
        }
    }

    pub async fn on_offer(&self, peer_id: &str, offer: SessionDescription) -> Result<Outcome> {
        if offer.kind != SdpKind::Offer {
            return Err(Error::invalid_message(format!(
                "expected offer, got {}",
                offer.kind
            )));
        }
        if !self.is_accepting() {
            warn!(peer_id, "not accepting calls, offer dropped");
            self.report_dropped(peer_id, SignalKind::Offer, "not accepting calls");
            return Ok(Outcome::Dropped(DropReason::NotAccepting));
        }

        let existing = self
            .table()
            .get(peer_id)
            .map(|s| (s.state(), s.generation));
        if let Some((state, generation)) = existing {
            if state == NegotiationState::HaveLocalOffer {
                if self.settings.local_id.as_str() > peer_id {
                    info!(peer_id, "offer collision, keeping local offer");
                    return Ok(Outcome::Dropped(DropReason::OfferCollision));
                }
                info!(peer_id, "offer collision, answering remote offer");
                self.teardown(peer_id, generation, "offer collision").await;
            } else {
                info!(peer_id, ?state, "new offer replaces live session");
                self.teardown(peer_id, generation, "replaced by new offer")
                    .await;
            }
        }

        let (generation, connection) = self.open_session(peer_id, Role::Responder).await?;

        if let Err(e) = connection.set_remote_description(offer).await {
            return Err(self.fail(peer_id, generation, e).await);
        }
        if !self
            .on_remote_description_set(
                peer_id,
                generation,
                NegotiationState::HaveRemoteOffer,
                &connection,
            )
            .await
        {
            return Ok(Outcome::Stale);
        }

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(peer_id, generation, e).await),
        };
        if !self.is_current(peer_id, generation) {
            return Ok(Outcome::Stale);
        }
        if let Err(e) = connection.set_local_description(answer.clone()).await {
            return Err(self.fail(peer_id, generation, e).await);
        }

        match self
            .table()
            .current_mut(peer_id, generation)
            .map(|s| s.advance_established(NegotiationState::Answered))
        {
            None => return Ok(Outcome::Stale),
            Some(false) => warn!(peer_id, generation, "unexpected state after answer"),
            Some(true) => {}
        }
        self.transport.send(SignalMessage::answer(peer_id, answer));
        info!(peer_id, generation, "answer sent");
        Ok(Outcome::Answered)
    }

    pub async fn on_answer(&self, peer_id: &str, answer: SessionDescription) -> Result<Outcome> {
        if answer.kind != SdpKind::Answer {
            return Err(Error::invalid_message(format!(
                "expected answer, got {}",
                answer.kind
            )));
        }
        let found = self
            .table()
            .get(peer_id)
            .map(|s| (s.state(), s.generation, s.connection.clone()));
        let Some((state, generation, connection)) = found else {
            warn!(peer_id, "answer for unknown peer dropped");
            self.report_dropped(peer_id, SignalKind::Answer, "no session for peer");
            return Ok(Outcome::Dropped(DropReason::UnknownPeer));
        };

        if state != NegotiationState::HaveLocalOffer {
            let err = Error::NegotiationMismatch {
                peer_id: peer_id.to_string(),
                kind: SignalKind::Answer,
                state,
            };
            warn!(peer_id, generation, ?state, "unexpected answer rejected");
            if !state.is_established() {
                self.teardown(peer_id, generation, "unexpected answer").await;
            }
            self.events.emit(CallEvent::NegotiationRejected {
                peer_id: peer_id.to_string(),
                detail: err.to_string(),
            });
            return Err(err);
        }

        if let Err(e) = connection.set_remote_description(answer).await {
            return Err(self.fail(peer_id, generation, e).await);
        }
        if !self
            .on_remote_description_set(
                peer_id,
                generation,
                NegotiationState::HaveRemoteAnswer,
                &connection,
            )
            .await
        {
            return Ok(Outcome::Stale);
        }
        info!(peer_id, generation, "answer applied");
        Ok(Outcome::AnswerApplied)
    }

    pub async fn on_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<Outcome> {
        enum Step {
            Apply(Arc<dyn PeerConnection>),
            Queued(usize),
            Full,
        }

        let step = self.table().get_mut(peer_id).map(|s| {
            if s.remote_description_set() {
                Step::Apply(s.connection.clone())
            } else if s.queue_candidate(candidate.clone()) {
                Step::Queued(s.pending_candidates())
            } else {
                Step::Full
            }
        });

        match step {
            None => {
                debug!(peer_id, "candidate for unknown peer ignored");
                Ok(Outcome::Dropped(DropReason::UnknownPeer))
            }
            Some(Step::Queued(pending)) => {
                debug!(peer_id, pending, "remote description not set yet, candidate queued");
                Ok(Outcome::CandidateQueued)
            }
            Some(Step::Full) => {
                warn!(peer_id, limit = self.settings.max_pending_candidates, "pending candidate queue full, candidate dropped");
                Ok(Outcome::Dropped(DropReason::QueueFull))
            }
            Some(Step::Apply(connection)) => match connection.add_ice_candidate(candidate).await {
                Ok(()) => Ok(Outcome::CandidateApplied),
                Err(e) => {
                    warn!(peer_id, error = %e, "failed to add remote candidate");
                    Err(e)
                }
            },
        }
    }

    pub async fn start_outbound(&self, peer_id: &str) -> Result<Outcome> {
        if peer_id.is_empty() {
            return Err(Error::invalid_message("empty peer id"));
        }
        if self.has_session(peer_id) {
            return Err(Error::SessionExists(peer_id.to_string()));
        }

        let (generation, connection) = self.open_session(peer_id, Role::Initiator).await?;

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(peer_id, generation, e).await),
        };
        if !self.is_current(peer_id, generation) {
            return Ok(Outcome::Stale);
        }
        if let Err(e) = connection.set_local_description(offer.clone()).await {
            return Err(self.fail(peer_id, generation, e).await);
        }

        match self
            .table()
            .current_mut(peer_id, generation)
            .map(|s| s.advance(NegotiationState::HaveLocalOffer))
        {
            None => return Ok(Outcome::Stale),
            Some(false) => warn!(peer_id, generation, "unexpected state after offer"),
            Some(true) => {}
        }
        self.transport.send(SignalMessage::offer(peer_id, offer));
        info!(peer_id, generation, "offer sent");
        Ok(Outcome::OfferSent)
    }

    /// Подключает локальные треки ко всем сессиям, у которых их ещё нет.
    /// Возвращает число затронутых сессий.
    pub async fn attach_local_tracks(&self) -> usize {
        let Some(stream) = self.media.local_stream() else {
            return 0;
        };
        let claimed = self.table().claim_unattached();
        let mut attached = 0;
        for (peer_id, generation, connection) in claimed {
            match MediaPipeline::attach_stream(&stream, connection.as_ref()).await {
                Ok(tracks) => {
                    debug!(peer_id, generation, tracks, "local tracks attached to live session");
                    attached += 1;
                }
                Err(e) => warn!(peer_id, generation, error = %e, "failed to attach local tracks"),
            }
        }
        attached
    }

    /// Закрывает все соединения и очищает таблицу. Локальные треки не трогает.
    pub async fn close_all(&self) -> usize {
        let drained = self.table().drain();
        let closed = drained.len();
        for session in drained {
            self.dispose(session, "call terminated").await;
        }
        if closed > 0 {
            info!(closed, "all sessions closed");
        }
        closed
    }

    async fn open_session(
        &self,
        peer_id: &str,
        role: Role,
    ) -> Result<(u64, Arc<dyn PeerConnection>)> {
        let generation = self.table().allocate_generation();
        let events = ConnectionEvents::new(peer_id, generation, self.connection_events.clone());
        let connection = self
            .factory
            .create(ConnectionContext {
                peer_id: peer_id.to_string(),
                generation,
                events: events.clone(),
            })
            .await?;

        // Проверка и вставка под одной блокировкой: terminate либо увидит
        // сессию при close_all, либо она сюда не попадёт.
        let inserted = {
            let mut table = self.table();
            if table.is_open() {
                Some(table.insert(peer_id, generation, role, connection.clone()))
            } else {
                None
            }
        };
        let Some(replaced) = inserted else {
            if let Err(e) = connection.close().await {
                debug!(peer_id, error = %e, "close of discarded connection failed");
            }
            return Err(Error::Cancelled(format!(
                "negotiator closed while opening session for {peer_id}"
            )));
        };
        if let Some(old) = replaced {
            self.dispose(old, "replaced").await;
        }

        let timeout = self.settings.negotiation_timeout;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            events.negotiation_deadline();
        });
        match self.table().current_mut(peer_id, generation) {
            Some(session) => session.set_deadline_task(deadline),
            None => deadline.abort(),
        }

        info!(peer_id, generation, ?role, "session opened");
        self.events.emit(CallEvent::SessionOpened {
            peer_id: peer_id.to_string(),
            role,
        });

        // Треки должны попасть в соединение до генерации offer/answer
        if let Some(stream) = self.media.local_stream() {
            let claimed = self
                .table()
                .current_mut(peer_id, generation)
                .is_some_and(|s| s.mark_tracks_attached());
            if claimed {
                match MediaPipeline::attach_stream(&stream, connection.as_ref()).await {
                    Ok(tracks) => debug!(peer_id, generation, tracks, "local tracks attached"),
                    Err(e) => warn!(peer_id, generation, error = %e, "failed to attach local tracks"),
                }
            }
        }

        Ok((generation, connection))
    }

    /// Переводит сессию в `next` и применяет отложенные кандидаты по порядку.
    /// Кандидаты, пришедшие во время применения, встают в ту же очередь и
    /// применяются следующей пачкой. false, если сессия уже не текущая.
    async fn on_remote_description_set(
        &self,
        peer_id: &str,
        generation: u64,
        next: NegotiationState,
        connection: &Arc<dyn PeerConnection>,
    ) -> bool {
        {
            let mut table = self.table();
            let Some(session) = table.current_mut(peer_id, generation) else {
                return false;
            };
            let advanced = if next.is_established() {
                session.advance_established(next)
            } else {
                session.advance(next)
            };
            if !advanced {
                warn!(peer_id, generation, from = ?session.state(), to = ?next, "illegal negotiation transition");
            }
        }

        loop {
            let batch = match self.table().current_mut(peer_id, generation) {
                Some(session) => session.next_pending_batch(),
                None => return false,
            };
            if batch.is_empty() {
                return true;
            }
            debug!(peer_id, generation, count = batch.len(), "applying queued candidates");
            for candidate in batch {
                if !self.is_current(peer_id, generation) {
                    return false;
                }
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    warn!(peer_id, generation, error = %e, "failed to add queued candidate");
                }
            }
        }
    }

    async fn fail(&self, peer_id: &str, generation: u64, err: Error) -> Error {
        if !self.is_current(peer_id, generation) {
            debug!(peer_id, generation, error = %err, "stale session failed");
            return err;
        }
        warn!(peer_id, generation, error = %err, "negotiation failed, closing session");
        self.teardown(peer_id, generation, "negotiation failed").await;
        self.events.emit(CallEvent::NegotiationRejected {
            peer_id: peer_id.to_string(),
            detail: err.to_string(),
        });
        err
    }

    fn report_dropped(&self, peer_id: &str, kind: SignalKind, reason: &str) {
        self.events.emit(CallEvent::SignalingDropped {
            peer_id: peer_id.to_string(),
            kind,
            reason: reason.to_string(),
        });
    }

    /// Закрывает сессию, если это всё ещё то же воплощение
    pub async fn teardown(&self, peer_id: &str, generation: u64, reason: &str) -> bool {
        let removed = self.table().remove_if_current(peer_id, generation);
        match removed {
            Some(session) => {
                self.dispose(session, reason).await;
                true
            }
            None => false,
        }
    }

    async fn dispose(&self, session: PeerSession, reason: &str) {
        if let Err(e) = session.connection.close().await {
            warn!(peer_id = %session.peer_id, error = %e, "failed to close connection");
        }
        // Вытесненная сессия уступила место новой с тем же пиром
        if !self.has_session(&session.peer_id) {
            self.media.forget_peer(&session.peer_id);
        }
        info!(peer_id = %session.peer_id, generation = session.generation, reason, "session closed");
        self.events.emit(CallEvent::SessionClosed {
            peer_id: session.peer_id,
            reason: reason.to_string(),
        });
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate {
                peer_id,
                generation,
                candidate,
            } => {
                let live = self
                    .table()
                    .current_mut(&peer_id, generation)
                    .map(|s| s.record_local_candidate(&candidate))
                    .is_some();
                if live {
                    self.transport
                        .send(SignalMessage::candidate(peer_id, candidate));
                } else {
                    debug!(%peer_id, generation, "late local candidate ignored");
                }
            }
            ConnectionEvent::GatheringComplete {
                peer_id,
                generation,
            } => {
                let summary = self
                    .table()
                    .current_mut(&peer_id, generation)
                    .map(|s| s.local_candidates());
                if let Some(summary) = summary {
                    debug!(
                        %peer_id,
                        generation,
                        host = summary.host,
                        srflx = summary.srflx,
                        relay = summary.relay,
                        "local candidate gathering complete"
                    );
                }
            }
            ConnectionEvent::RemoteTrack {
                peer_id,
                generation,
                stream,
            } => {
                if !self.is_current(&peer_id, generation) {
                    debug!(%peer_id, generation, "remote track for closed session ignored");
                    return;
                }
                let stream_id = stream.stream_id();
                let route = self.media.on_remote_track(&peer_id, stream);
                debug!(%peer_id, generation, %stream_id, ?route, "remote track received");
                self.events.emit(CallEvent::RemoteStream { peer_id, stream_id });
            }
            ConnectionEvent::StateChanged {
                peer_id,
                generation,
                state,
            } => self.on_connection_state(peer_id, generation, state),
            ConnectionEvent::GraceExpired {
                peer_id,
                generation,
            } => {
                let expired = self
                    .table()
                    .current_mut(&peer_id, generation)
                    .and_then(|s| {
                        s.cancel_grace();
                        (s.connection_state() != ConnectionState::Connected)
                            .then(|| s.local_candidates())
                    });
                if let Some(summary) = expired {
                    warn!(%peer_id, generation, "connection not recovered within grace period");
                    summary.log(&peer_id);
                    self.teardown(&peer_id, generation, "connection lost").await;
                }
            }
            ConnectionEvent::NegotiationDeadline {
                peer_id,
                generation,
            } => {
                let stalled = self
                    .table()
                    .get(&peer_id)
                    .filter(|s| s.generation == generation && !s.state().is_established())
                    .map(PeerSession::state);
                let Some(state) = stalled else {
                    return;
                };
                let err = Error::SignalingDropped {
                    peer_id: peer_id.clone(),
                    reason: format!(
                        "negotiation not completed within {:?} (state {state:?})",
                        self.settings.negotiation_timeout
                    ),
                };
                warn!(%peer_id, generation, error = %err, "negotiation deadline expired");
                // Инициатор ждал answer, остальные - продолжения offer
                let kind = if state == NegotiationState::HaveLocalOffer {
                    SignalKind::Answer
                } else {
                    SignalKind::Offer
                };
                self.report_dropped(&peer_id, kind, &err.to_string());
                self.teardown(&peer_id, generation, "negotiation timeout").await;
            }
        }
    }

    fn on_connection_state(&self, peer_id: String, generation: u64, state: ConnectionState) {
        let mut table = self.table();
        let Some(session) = table.current_mut(&peer_id, generation) else {
            return;
        };
        session.set_connection_state(state);
        debug!(%peer_id, generation, ?state, "connection state changed");

        match state {
            ConnectionState::Connected => {
                let recovered = session.cancel_grace();
                if session.state().is_established() {
                    session.advance(NegotiationState::Connected);
                }
                drop(table);
                if recovered {
                    info!(%peer_id, generation, "connection recovered");
                    self.events.emit(CallEvent::ConnectionRecovered {
                        peer_id: peer_id.clone(),
                    });
                }
                info!(%peer_id, generation, "peer connected");
                self.events.emit(CallEvent::SessionEstablished { peer_id });
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if session.has_grace_task() {
                    return;
                }
                let events =
                    ConnectionEvents::new(peer_id.clone(), generation, self.connection_events.clone());
                let grace = self.settings.grace_period;
                session.set_grace_task(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    events.grace_expired();
                }));
                drop(table);
                warn!(%peer_id, generation, ?state, ?grace, "connection problem, waiting for recovery");
                self.events.emit(CallEvent::ConnectionProblem { peer_id });
            }
            _ => {}
        }
    }
}
