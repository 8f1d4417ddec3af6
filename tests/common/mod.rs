#![allow(dead_code)]

use async_trait::async_trait;
use duocall::error::{DeviceError, Error, Result};
use duocall::events::{CallEvent, EventEmitter};
use duocall::media::{
    CaptureDevice, LocalMediaStream, LocalTrack, MediaConstraints, MediaPipeline, PlaybackSink,
    PreviewSink, RemoteStream, RemoteTrack, TrackKind,
};
use duocall::negotiator::{Negotiator, NegotiatorSettings};
use duocall::peer::connection::{
    ConnectionContext, ConnectionEvents, ConnectionFactory, OutboundSender, PeerConnection,
};
use duocall::peer::types::{IceCandidate, SdpKind, SessionDescription};
use duocall::signaling::{MemoryRelay, MemoryTransport};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Что соединение успело сделать, по порядку
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    AddTrack(String),
    Close,
}

/// Останавливает операцию, пока тест её не отпустит
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

pub struct FakeConnection {
    pub peer_id: String,
    pub generation: u64,
    ops: Mutex<Vec<Op>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    remote_gate: Option<Gate>,
    candidate_gate: Mutex<Option<Gate>>,
}

impl FakeConnection {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fake_senders(&self) -> Vec<Arc<FakeSender>> {
        self.senders.lock().unwrap().clone()
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Op::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer for {}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer for {}", self.peer_id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Op::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if let Some(gate) = &self.remote_gate {
            gate.pass().await;
        }
        self.record(Op::SetRemote(desc.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let gate = self.candidate_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "candidate before remote description".into(),
            ));
        }
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn OutboundSender>> {
        self.record(Op::AddTrack(track.id().to_string()));
        let sender = Arc::new(FakeSender {
            track_id: track.id().to_string(),
            enabled: AtomicBool::new(true),
        });
        self.senders.lock().unwrap().push(sender.clone());
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn OutboundSender>> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn OutboundSender>)
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.record(Op::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeSender {
    pub track_id: String,
    enabled: AtomicBool,
}

#[async_trait]
impl OutboundSender for FakeSender {
    fn track_id(&self) -> String {
        self.track_id.clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<(Arc<FakeConnection>, ConnectionEvents)>>,
    next_gate: Mutex<Option<Gate>>,
    next_candidate_gate: Mutex<Option<Gate>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Следующее соединение зависнет в set_remote_description
    pub fn gate_next(&self) -> Gate {
        let gate = Gate::default();
        *self.next_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Следующее соединение зависнет на первом add_ice_candidate
    pub fn gate_next_candidate(&self) -> Gate {
        let gate = Gate::default();
        *self.next_candidate_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn for_peer(&self, peer_id: &str) -> Vec<Arc<FakeConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.peer_id == peer_id)
            .collect()
    }

    pub fn latest(&self, peer_id: &str) -> Arc<FakeConnection> {
        self.for_peer(peer_id)
            .pop()
            .unwrap_or_else(|| panic!("no connection for {peer_id}"))
    }

    /// Колбэки последнего соединения с пиром
    pub fn events(&self, peer_id: &str) -> ConnectionEvents {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(c, _)| c.peer_id == peer_id)
            .map(|(_, e)| e.clone())
            .unwrap_or_else(|| panic!("no connection for {peer_id}"))
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self, ctx: ConnectionContext) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(FakeConnection {
            peer_id: ctx.peer_id.clone(),
            generation: ctx.generation,
            ops: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            senders: Mutex::new(Vec::new()),
            remote_gate: self.next_gate.lock().unwrap().take(),
            candidate_gate: Mutex::new(self.next_candidate_gate.lock().unwrap().take()),
        });
        self.created
            .lock()
            .unwrap()
            .push((connection.clone(), ctx.events));
        Ok(connection)
    }
}

#[derive(Default)]
pub struct FakeDevice {
    failure: Mutex<Option<DeviceError>>,
    gate: Mutex<Option<Gate>>,
    pub requests: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: DeviceError) -> Arc<Self> {
        let device = Self::default();
        *device.failure.lock().unwrap() = Some(err);
        Arc::new(device)
    }

    /// Следующий запрос доступа зависнет до release
    pub fn gate_next(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl CaptureDevice for FakeDevice {
    async fn request_access(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalMediaStream, DeviceError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(LocalMediaStream::from_constraints(
            format!("local-{n}"),
            constraints,
        ))
    }
}

#[derive(Default)]
pub struct CollectingSink {
    pub streams: Mutex<Vec<String>>,
    pub output: Mutex<Vec<bool>>,
}

impl PlaybackSink for CollectingSink {
    fn attach_remote(&self, stream: RemoteStream) {
        self.streams.lock().unwrap().push(stream.track_id());
    }

    fn set_output_enabled(&self, enabled: bool) {
        self.output.lock().unwrap().push(enabled);
    }
}

#[derive(Default)]
pub struct CollectingPreview {
    pub attached: Mutex<Vec<(String, bool)>>,
}

impl PreviewSink for CollectingPreview {
    fn attach_local(&self, stream: Arc<LocalMediaStream>, muted: bool) {
        self.attached
            .lock()
            .unwrap()
            .push((stream.id().to_string(), muted));
    }
}

pub struct FakeRemoteTrack {
    pub id: String,
    pub stream_id: String,
}

impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }
}

pub fn remote_stream(id: &str) -> RemoteStream {
    RemoteStream::new(Arc::new(FakeRemoteTrack {
        id: id.to_string(),
        stream_id: format!("{id}-stream"),
    }))
}

pub fn settings(local_id: &str) -> NegotiatorSettings {
    NegotiatorSettings {
        local_id: local_id.to_string(),
        negotiation_timeout: Duration::from_secs(30),
        grace_period: Duration::from_secs(10),
        max_pending_candidates: 64,
    }
}

pub struct Harness {
    pub relay: Arc<MemoryRelay>,
    pub transport: Arc<MemoryTransport>,
    pub factory: Arc<FakeFactory>,
    pub media: Arc<MediaPipeline>,
    pub events: EventEmitter,
    pub negotiator: Arc<Negotiator>,
}

impl Harness {
    pub fn new(settings: NegotiatorSettings) -> Self {
        let relay = MemoryRelay::new();
        let transport = relay.endpoint(settings.local_id.clone());
        let factory = FakeFactory::new();
        let media = Arc::new(MediaPipeline::new());
        let events = EventEmitter::new();
        let negotiator = Negotiator::new(
            settings,
            transport.clone(),
            factory.clone(),
            media.clone(),
            events.clone(),
        )
        .unwrap();
        Self {
            relay,
            transport,
            factory,
            media,
            events,
            negotiator,
        }
    }
}

pub fn offer(sdp: &str) -> SessionDescription {
    SessionDescription::offer(sdp)
}

pub fn answer(sdp: &str) -> SessionDescription {
    SessionDescription::answer(sdp)
}

pub fn candidate(c: &str) -> IceCandidate {
    IceCandidate::new(c)
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Ждёт первое событие, подходящее под условие
pub async fn next_event(
    rx: &mut broadcast::Receiver<CallEvent>,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

/// Все события, накопившиеся к этому моменту
pub fn drain_events(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
