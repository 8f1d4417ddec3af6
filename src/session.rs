//! Таблица сессий: peer_id → PeerSession.

use crate::peer::connection::{ConnectionState, PeerConnection};
use crate::peer::ice::{CandidateQueue, CandidateSummary};
use crate::peer::types::IceCandidate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Состояние согласования одной сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    HaveRemoteOffer,
    Answered,
    HaveLocalOffer,
    HaveRemoteAnswer,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn can_advance_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (_, Closed) => self != Closed,
            (New, HaveRemoteOffer) | (HaveRemoteOffer, Answered) => true,
            (New, HaveLocalOffer) | (HaveLocalOffer, HaveRemoteAnswer) => true,
            (Answered, Connected) | (HaveRemoteAnswer, Connected) => true,
            _ => false,
        }
    }

    /// Обмен offer/answer завершён
    pub fn is_established(self) -> bool {
        matches!(
            self,
            NegotiationState::Answered
                | NegotiationState::HaveRemoteAnswer
                | NegotiationState::Connected
        )
    }
}

pub struct PeerSession {
    pub peer_id: String,
    pub generation: u64,
    pub role: Role,
    pub connection: Arc<dyn PeerConnection>,
    pub created_at: DateTime<Utc>,
    state: NegotiationState,
    connection_state: ConnectionState,
    pending_candidates: CandidateQueue,
    remote_description_set: bool,
    tracks_attached: bool,
    local_candidates: CandidateSummary,
    deadline_task: Option<JoinHandle<()>>,
    grace_task: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// false, если переход не разрешён
    pub fn advance(&mut self, next: NegotiationState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    /// Переход в одно из состояний завершённого обмена. Если транспорт
    /// успел подняться раньше, сессия сразу становится Connected.
    pub fn advance_established(&mut self, next: NegotiationState) -> bool {
        if !self.advance(next) {
            return false;
        }
        if self.connection_state == ConnectionState::Connected {
            self.advance(NegotiationState::Connected);
        }
        true
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Забирает очередную пачку отложенных кандидатов. Пока очередь не
    /// опустела, новые кандидаты продолжают вставать в неё; флаг
    /// remote description ставится только на пустой очереди.
    pub fn next_pending_batch(&mut self) -> Vec<IceCandidate> {
        let batch = self.pending_candidates.drain();
        if batch.is_empty() {
            self.remote_description_set = true;
        }
        batch
    }

    pub fn queue_candidate(&mut self, candidate: IceCandidate) -> bool {
        self.pending_candidates.push(candidate)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// true ровно один раз: треки подключаются к соединению не более одного раза
    pub fn mark_tracks_attached(&mut self) -> bool {
        !std::mem::replace(&mut self.tracks_attached, true)
    }

    pub fn tracks_attached(&self) -> bool {
        self.tracks_attached
    }

    pub fn record_local_candidate(&mut self, candidate: &IceCandidate) {
        self.local_candidates.record(candidate);
    }

    pub fn local_candidates(&self) -> CandidateSummary {
        self.local_candidates
    }

    pub fn set_deadline_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.deadline_task.replace(task) {
            old.abort();
        }
    }

    pub fn has_grace_task(&self) -> bool {
        self.grace_task.is_some()
    }

    pub fn set_grace_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.grace_task.replace(task) {
            old.abort();
        }
    }

    /// true, если таймер был активен
    pub fn cancel_grace(&mut self) -> bool {
        match self.grace_task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.deadline_task.take() {
            task.abort();
        }
        self.cancel_grace();
    }
}

/// Хранилище сессий. Мьютекс над ним никогда не держится через await.
pub struct SessionTable {
    sessions: HashMap<String, PeerSession>,
    next_generation: u64,
    candidate_limit: usize,
    open: bool,
}

impl SessionTable {
    pub fn new(candidate_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_generation: 1,
            candidate_limit,
            open: true,
        }
    }

    /// Закрытая таблица не принимает новые сессии
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Вставляет новую сессию в состоянии New. Вытесненная сессия возвращается
    /// вызывающему: закрыть её соединение - его забота.
    pub fn insert(
        &mut self,
        peer_id: &str,
        generation: u64,
        role: Role,
        connection: Arc<dyn PeerConnection>,
    ) -> Option<PeerSession> {
        let session = PeerSession {
            peer_id: peer_id.to_string(),
            generation,
            role,
            connection,
            created_at: Utc::now(),
            state: NegotiationState::New,
            connection_state: ConnectionState::New,
            pending_candidates: CandidateQueue::new(self.candidate_limit),
            remote_description_set: false,
            tracks_attached: false,
            local_candidates: CandidateSummary::default(),
            deadline_task: None,
            grace_task: None,
        };
        self.sessions
            .insert(peer_id.to_string(), session)
            .map(Self::retire)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer_id)
    }

    /// Сессия, только если это всё ещё то же самое воплощение
    pub fn current_mut(&mut self, peer_id: &str, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer_id)
            .filter(|s| s.generation == generation)
    }

    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|s| s.generation == generation)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerSession> {
        self.sessions.remove(peer_id).map(Self::retire)
    }

    pub fn remove_if_current(&mut self, peer_id: &str, generation: u64) -> Option<PeerSession> {
        if !self.is_current(peer_id, generation) {
            return None;
        }
        self.remove(peer_id)
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, s)| Self::retire(s)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Сессии, к которым ещё не подключены локальные треки; помечаются как подключённые
    pub fn claim_unattached(&mut self) -> Vec<(String, u64, Arc<dyn PeerConnection>)> {
        self.sessions
            .values_mut()
            .filter_map(|s| {
                s.mark_tracks_attached()
                    .then(|| (s.peer_id.clone(), s.generation, s.connection.clone()))
            })
            .collect()
    }

    fn retire(mut session: PeerSession) -> PeerSession {
        session.cancel_timers();
        session.state = NegotiationState::Closed;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::media::LocalTrack;
    use crate::peer::connection::OutboundSender;
    use crate::peer::types::SessionDescription;
    use async_trait::async_trait;

    struct NullConnection;

    #[async_trait]
    impl PeerConnection for NullConnection {
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn set_local_description(&self, _: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _: IceCandidate) -> Result<()> {
            Ok(())
        }
        async fn add_track(&self, _: Arc<LocalTrack>) -> Result<Arc<dyn OutboundSender>> {
            unimplemented!()
        }
        async fn senders(&self) -> Vec<Arc<dyn OutboundSender>> {
            Vec::new()
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn responder_and_initiator_paths() {
        use NegotiationState::*;
        assert!(New.can_advance_to(HaveRemoteOffer));
        assert!(HaveRemoteOffer.can_advance_to(Answered));
        assert!(New.can_advance_to(HaveLocalOffer));
        assert!(HaveLocalOffer.can_advance_to(HaveRemoteAnswer));
        assert!(Answered.can_advance_to(Connected));
        assert!(!HaveRemoteOffer.can_advance_to(HaveRemoteAnswer));
        assert!(!Answered.can_advance_to(HaveRemoteOffer));
        assert!(!Closed.can_advance_to(HaveLocalOffer));
        assert!(!Closed.can_advance_to(Closed));
    }

    #[test]
    fn one_live_session_per_peer() {
        let mut table = SessionTable::new(8);
        let g1 = table.allocate_generation();
        assert!(table
            .insert("A", g1, Role::Responder, Arc::new(NullConnection))
            .is_none());
        let g2 = table.allocate_generation();
        let replaced = table
            .insert("A", g2, Role::Responder, Arc::new(NullConnection))
            .unwrap();
        assert_eq!(replaced.generation, g1);
        assert_eq!(replaced.state(), NegotiationState::Closed);
        assert_eq!(table.len(), 1);
        assert!(table.is_current("A", g2));
        assert!(!table.is_current("A", g1));
        assert!(table.remove_if_current("A", g1).is_none());
        assert!(table.remove_if_current("A", g2).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn pending_candidates_flush_once() {
        let mut table = SessionTable::new(8);
        let g = table.allocate_generation();
        table.insert("A", g, Role::Responder, Arc::new(NullConnection));
        let session = table.get_mut("A").unwrap();
        assert!(session.queue_candidate(IceCandidate::new("candidate:1")));
        assert!(session.queue_candidate(IceCandidate::new("candidate:2")));
        assert!(!session.remote_description_set());
        let flushed = session.next_pending_batch();
        assert_eq!(flushed.len(), 2);
        // пока идёт применение пачки, новые кандидаты всё ещё в очередь
        assert!(!session.remote_description_set());
        assert!(session.queue_candidate(IceCandidate::new("candidate:3")));
        let late: Vec<_> = session
            .next_pending_batch()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(late, vec!["candidate:3"]);
        assert!(session.next_pending_batch().is_empty());
        assert!(session.remote_description_set());
        assert_eq!(session.pending_candidates(), 0);
    }

    #[test]
    fn tracks_are_claimed_once() {
        let mut table = SessionTable::new(8);
        for peer in ["A", "B"] {
            let g = table.allocate_generation();
            table.insert(peer, g, Role::Initiator, Arc::new(NullConnection));
        }
        assert_eq!(table.claim_unattached().len(), 2);
        assert!(table.claim_unattached().is_empty());
    }
}
