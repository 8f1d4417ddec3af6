//! Медиа-конвейер: локальный захват, подключение треков к сессиям,
//! маршрутизация удалённых потоков в sink'и.

use crate::error::{DeviceError, Result};
use crate::peer::connection::PeerConnection;
use crate::utils::lock;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const FRAGMENT_TAP_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(t: RTPCodecType) -> Self {
        match t {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }
}

/// Что запрашиваем у устройства. Аудио обязательно.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), DeviceError> {
        if !self.audio {
            return Err(DeviceError::InvalidConstraints(
                "audio capture is required".into(),
            ));
        }
        Ok(())
    }
}

/// Фрагмент захваченного медиа, как он уходит в запись
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFragment {
    pub track_id: String,
    pub kind: TrackKind,
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Выход локального трека в одно соединение. Выключенный выход просто
/// не получает сэмплы, sender в соединении остаётся привязанным.
pub struct TrackOutput {
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl TrackOutput {
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Локальный трек захвата. Один и тот же трек подключается ко всем сессиям,
/// каждое соединение получает свой `TrackOutput`.
pub struct LocalTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    codec: RTCRtpCodecCapability,
    outputs: Mutex<Vec<Weak<TrackOutput>>>,
    stopped: AtomicBool,
    taps: broadcast::Sender<MediaFragment>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("outputs", &self.output_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let (taps, _) = broadcast::channel(FRAGMENT_TAP_CAPACITY);
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            codec,
            outputs: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            taps,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Новый выход для очередного соединения. Живёт, пока его держит sender.
    pub fn bind_output(&self) -> Arc<TrackOutput> {
        let output = Arc::new(TrackOutput {
            rtc: Arc::new(TrackLocalStaticSample::new(
                self.codec.clone(),
                self.id.clone(),
                self.stream_id.clone(),
            )),
            enabled: AtomicBool::new(true),
        });
        let mut outputs = lock(&self.outputs);
        outputs.retain(|o| o.strong_count() > 0);
        outputs.push(Arc::downgrade(&output));
        output
    }

    pub fn output_count(&self) -> usize {
        lock(&self.outputs)
            .iter()
            .filter(|o| o.strong_count() > 0)
            .count()
    }

    /// Пишет сэмпл во все включённые выходы и в подписчиков записи.
    /// После `stop()` сэмплы молча отбрасываются.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let outputs: Vec<_> = lock(&self.outputs)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for output in outputs.iter().filter(|o| o.is_enabled()) {
            if let Err(e) = output.rtc.write_sample(sample).await {
                warn!(track_id = %self.id, error = %e, "failed to write sample to connection");
            }
        }
        let _ = self.taps.send(MediaFragment {
            track_id: self.id.clone(),
            kind: self.kind,
            data: sample.data.clone(),
            captured_at: Utc::now(),
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFragment> {
        self.taps.subscribe()
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(track_id = %self.id, "local track stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Поток из свежих треков: аудио всегда, видео по запросу
    pub fn from_constraints(id: impl Into<String>, constraints: &MediaConstraints) -> Self {
        let id = id.into();
        let mut tracks = vec![Arc::new(LocalTrack::new(
            TrackKind::Audio,
            format!("{id}-audio"),
            id.clone(),
        ))];
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(
                TrackKind::Video,
                format!("{id}-video"),
                id.clone(),
            )));
        }
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Устройство захвата (камера/микрофон)
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn request_access(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalMediaStream, DeviceError>;
}

pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> TrackKind;

    /// Исходный трек движка, если он есть
    fn rtc(&self) -> Option<Arc<TrackRemote>> {
        None
    }
}

pub struct RtcRemoteTrack(pub Arc<TrackRemote>);

impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.0.id()
    }

    fn stream_id(&self) -> String {
        self.0.stream_id()
    }

    fn kind(&self) -> TrackKind {
        self.0.kind().into()
    }

    fn rtc(&self) -> Option<Arc<TrackRemote>> {
        Some(self.0.clone())
    }
}

/// Удалённый поток, пришедший от пира
#[derive(Clone)]
pub struct RemoteStream {
    track: Arc<dyn RemoteTrack>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id())
            .field("track_id", &self.track_id())
            .field("kind", &self.kind())
            .finish()
    }
}

impl RemoteStream {
    pub fn new(track: Arc<dyn RemoteTrack>) -> Self {
        Self { track }
    }

    pub fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    pub fn track_id(&self) -> String {
        self.track.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.track.kind()
    }

    pub fn track(&self) -> &Arc<dyn RemoteTrack> {
        &self.track
    }
}

/// Воспроизведение удалённого медиа для одного пира
pub trait PlaybackSink: Send + Sync {
    fn attach_remote(&self, stream: RemoteStream);

    /// Динамик: выключенный sink продолжает принимать потоки, но не играет их
    fn set_output_enabled(&self, _enabled: bool) {}
}

/// Локальное превью
pub trait PreviewSink: Send + Sync {
    fn attach_local(&self, stream: Arc<LocalMediaStream>, muted: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRoute {
    Delivered,
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackToggle {
    pub track_id: String,
    pub enabled: bool,
}

pub struct MediaPipeline {
    local: Mutex<Option<Arc<LocalMediaStream>>>,
    sinks: Mutex<HashMap<String, Arc<dyn PlaybackSink>>>,
    pending: Mutex<HashMap<String, Vec<RemoteStream>>>,
    speaker_on: AtomicBool,
}

impl Default for MediaPipeline {
    fn default() -> Self {
        Self {
            local: Mutex::default(),
            sinks: Mutex::default(),
            pending: Mutex::default(),
            speaker_on: AtomicBool::new(true),
        }
    }
}

impl MediaPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Запрашивает устройства и запоминает общий локальный поток.
    /// Подключение к живым сессиям делает вызывающий (см. `Negotiator::attach_local_tracks`).
    pub async fn acquire_local(
        &self,
        device: &dyn CaptureDevice,
        constraints: &MediaConstraints,
    ) -> std::result::Result<Arc<LocalMediaStream>, DeviceError> {
        constraints.validate()?;
        let stream = device.request_access(constraints).await?;
        if !stream.has_audio() {
            stream.stop_all();
            return Err(DeviceError::Unavailable(
                "device returned no audio track".into(),
            ));
        }

        let stream = Arc::new(stream);
        let previous = lock(&self.local).replace(stream.clone());
        if let Some(previous) = previous {
            previous.stop_all();
        }
        info!(
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "local media acquired"
        );
        Ok(stream)
    }

    pub fn local_stream(&self) -> Option<Arc<LocalMediaStream>> {
        lock(&self.local).clone()
    }

    /// Останавливает локальный захват. Только для завершения звонка целиком.
    pub fn release_local(&self) -> Option<Arc<LocalMediaStream>> {
        let stream = lock(&self.local).take();
        if let Some(stream) = &stream {
            stream.stop_all();
            info!(stream_id = %stream.id(), "local media released");
        }
        stream
    }

    /// Подключает живые треки потока к соединению, возвращает число подключённых
    pub async fn attach_stream(
        stream: &LocalMediaStream,
        connection: &dyn PeerConnection,
    ) -> Result<usize> {
        let mut attached = 0;
        for track in stream.tracks().iter().filter(|t| !t.is_stopped()) {
            connection.add_track(track.clone()).await?;
            attached += 1;
        }
        Ok(attached)
    }

    pub fn on_remote_track(&self, peer_id: &str, stream: RemoteStream) -> RemoteRoute {
        let sink = {
            let sinks = lock(&self.sinks);
            match sinks.get(peer_id) {
                Some(sink) => sink.clone(),
                None => {
                    // sink ещё не смонтирован - держим поток до регистрации
                    debug!(peer_id, stream = ?stream, "no sink yet, buffering remote stream");
                    lock(&self.pending)
                        .entry(peer_id.to_string())
                        .or_default()
                        .push(stream);
                    return RemoteRoute::Buffered;
                }
            }
        };
        sink.attach_remote(stream);
        RemoteRoute::Delivered
    }

    /// Регистрирует sink и отдаёт ему накопленные потоки в порядке прихода
    pub fn register_sink(&self, peer_id: &str, sink: Arc<dyn PlaybackSink>) -> usize {
        let buffered = {
            let mut sinks = lock(&self.sinks);
            sinks.insert(peer_id.to_string(), sink.clone());
            if !self.is_speaker_on() {
                sink.set_output_enabled(false);
            }
            lock(&self.pending).remove(peer_id).unwrap_or_default()
        };
        let flushed = buffered.len();
        for stream in buffered {
            sink.attach_remote(stream);
        }
        if flushed > 0 {
            debug!(peer_id, flushed, "flushed buffered remote streams");
        }
        flushed
    }

    pub fn unregister_sink(&self, peer_id: &str) -> Option<Arc<dyn PlaybackSink>> {
        lock(&self.sinks).remove(peer_id)
    }

    pub fn pending_streams(&self, peer_id: &str) -> usize {
        lock(&self.pending).get(peer_id).map_or(0, Vec::len)
    }

    /// Сессия закрыта - её непринятые потоки больше не нужны
    pub fn forget_peer(&self, peer_id: &str) {
        lock(&self.pending).remove(peer_id);
    }

    pub fn clear_remote(&self) {
        lock(&self.pending).clear();
    }

    pub fn is_speaker_on(&self) -> bool {
        self.speaker_on.load(Ordering::SeqCst)
    }

    /// Включает/выключает воспроизведение во всех sink'ах, в том числе
    /// зарегистрированных позже. Исходящие треки не затрагивает.
    pub fn set_speaker(&self, on: bool) -> usize {
        let sinks = lock(&self.sinks);
        self.speaker_on.store(on, Ordering::SeqCst);
        for sink in sinks.values() {
            sink.set_output_enabled(on);
        }
        sinks.len()
    }

    /// Переключает `enabled` у каждого исходящего sender'а соединения.
    /// Входящий звук не затрагивается. При ошибке уже переключённые
    /// sender'ы возвращаются в прежнее состояние.
    pub async fn toggle_outbound(connection: &dyn PeerConnection) -> Result<Vec<TrackToggle>> {
        let senders = connection.senders().await;
        let mut toggled = Vec::with_capacity(senders.len());
        for (i, sender) in senders.iter().enumerate() {
            let enabled = !sender.is_enabled();
            if let Err(e) = sender.set_enabled(enabled).await {
                warn!(track_id = %sender.track_id(), error = %e, "failed to toggle sender, rolling back");
                for done in &senders[..i] {
                    let previous = !done.is_enabled();
                    if let Err(e) = done.set_enabled(previous).await {
                        warn!(track_id = %done.track_id(), error = %e, "rollback of sender toggle failed");
                    }
                }
                return Err(e);
            }
            toggled.push(TrackToggle {
                track_id: sender.track_id(),
                enabled,
            });
        }
        Ok(toggled)
    }
}
