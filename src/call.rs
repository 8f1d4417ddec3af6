//! Звонок целиком: локальный захват, входящая сигнализация, завершение.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CallEvent, EventEmitter};
use crate::logger;
use crate::media::{
    CaptureDevice, LocalMediaStream, MediaConstraints, MediaPipeline, PlaybackSink, PreviewSink,
    TrackToggle,
};
use crate::negotiator::{Negotiator, NegotiatorSettings, Outcome};
use crate::peer::connection::ConnectionFactory;
use crate::peer::rtc::RtcConnectionFactory;
use crate::recording::{Recorder, Recording, RecordingArtifact};
use crate::signaling::{SignalMessage, SignalingTransport, WsTransport};
use crate::utils::lock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Calling,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateReason {
    /// Отмена до или во время установки
    Cancelled,
    HungUp,
}

enum Inbound {
    Signal(SignalMessage),
    // сессия пира закрыта: пора проверить, нужна ли ещё очередь
    Recheck,
}

struct PeerQueue {
    id: u64,
    tx: mpsc::UnboundedSender<Inbound>,
}

type Queues = Arc<Mutex<HashMap<String, PeerQueue>>>;

/// Входящие сообщения: своя упорядоченная очередь на каждого пира.
/// Порядок внутри пира сохраняется, разные пиры не ждут друг друга.
/// Очередь закрывается, когда у пира нет сессии и в ней ничего не осталось.
pub struct Dispatcher {
    negotiator: Weak<Negotiator>,
    queues: Queues,
    next_queue: AtomicU64,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(negotiator: &Arc<Negotiator>, events: &EventEmitter) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidState(format!("no tokio runtime: {e}")))?;
        let dispatcher = Arc::new(Self {
            negotiator: Arc::downgrade(negotiator),
            queues: Arc::new(Mutex::new(HashMap::new())),
            next_queue: AtomicU64::new(0),
            runtime: runtime.clone(),
        });
        runtime.spawn(Self::watch_sessions(
            Arc::downgrade(&dispatcher),
            events.subscribe(),
        ));
        Ok(dispatcher)
    }

    /// Вызывается из колбэка транспорта, не блокирует
    pub fn dispatch(&self, message: SignalMessage) {
        let peer_id = message.peer_id().to_string();
        let mut queues = lock(&self.queues);
        let inbound = match queues.get(&peer_id) {
            Some(queue) => match queue.tx.send(Inbound::Signal(message)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(inbound)) => inbound,
            },
            None => Inbound::Signal(message),
        };

        let id = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // получатель ещё жив, отправка не может провалиться
        let _ = tx.send(inbound);
        queues.insert(peer_id.clone(), PeerQueue { id, tx });
        debug!(%peer_id, "signaling queue opened");
        self.runtime.spawn(Self::drain(
            self.negotiator.clone(),
            self.queues.clone(),
            peer_id,
            id,
            rx,
        ));
    }

    async fn drain(
        negotiator: Weak<Negotiator>,
        queues: Queues,
        peer_id: String,
        id: u64,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
    ) {
        while let Some(inbound) = rx.recv().await {
            let Some(negotiator) = negotiator.upgrade() else {
                break;
            };
            if let Inbound::Signal(message) = inbound {
                let kind = message.kind();
                match negotiator.handle(message).await {
                    Ok(Outcome::Stale) => {
                        debug!(%peer_id, %kind, "session changed during handling")
                    }
                    Ok(outcome) => debug!(%peer_id, %kind, ?outcome, "signaling handled"),
                    Err(e) => warn!(%peer_id, %kind, error = %e, "signaling message rejected"),
                }
            }
            if negotiator.has_session(&peer_id) {
                continue;
            }

            // dispatch кладёт в очередь под этой же блокировкой
            let idle = {
                let mut queues = lock(&queues);
                let ours = queues.get(&peer_id).is_some_and(|q| q.id == id);
                if ours && rx.is_empty() {
                    queues.remove(&peer_id);
                    true
                } else {
                    false
                }
            };
            if idle {
                debug!(%peer_id, "no session left, signaling queue released");
                return;
            }
        }
        debug!(%peer_id, "signaling queue closed");
    }

    async fn watch_sessions(dispatcher: Weak<Self>, mut events: broadcast::Receiver<CallEvent>) {
        loop {
            let closed = match events.recv().await {
                Ok(CallEvent::SessionClosed { peer_id, .. }) => Some(peer_id),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "session events lagged, rechecking all queues");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(dispatcher) = dispatcher.upgrade() else {
                break;
            };
            let queues = lock(&dispatcher.queues);
            let targets: Vec<_> = match &closed {
                Some(peer_id) => queues.get(peer_id).into_iter().collect(),
                None => queues.values().collect(),
            };
            for queue in targets {
                let _ = queue.tx.send(Inbound::Recheck);
            }
        }
    }

    /// Закрывает все очереди; уже поставленные сообщения дообработаются
    pub fn reset(&self) {
        lock(&self.queues).clear();
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.queues).len()
    }
}

struct Control {
    state: CallState,
    // растёт при каждом terminate; start сверяет его после захвата
    epoch: u64,
    starting: bool,
    recorder: Option<Recorder>,
    last_recording: Option<Recording>,
}

pub struct CallController {
    negotiator: Arc<Negotiator>,
    dispatcher: Arc<Dispatcher>,
    media: Arc<MediaPipeline>,
    device: Arc<dyn CaptureDevice>,
    events: EventEmitter,
    control: Mutex<Control>,
    preview: Mutex<Option<Arc<dyn PreviewSink>>>,
}

impl CallController {
    pub fn new(
        settings: NegotiatorSettings,
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn ConnectionFactory>,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<Arc<Self>> {
        let events = EventEmitter::new();
        let media = Arc::new(MediaPipeline::new());
        let negotiator = Negotiator::new(
            settings,
            transport.clone(),
            factory,
            media.clone(),
            events.clone(),
        )?;
        let dispatcher = Dispatcher::new(&negotiator, &events)?;

        let inbound = Arc::downgrade(&dispatcher);
        transport.on_receive(Box::new(move |message| match inbound.upgrade() {
            Some(dispatcher) => dispatcher.dispatch(message),
            None => debug!("call controller dropped, inbound message ignored"),
        }));

        info!(local_id = negotiator.local_id(), "call controller ready");
        Ok(Arc::new(Self {
            negotiator,
            dispatcher,
            media,
            device,
            events,
            control: Mutex::new(Control {
                state: CallState::Idle,
                epoch: 0,
                starting: false,
                recorder: None,
                last_recording: None,
            }),
            preview: Mutex::new(None),
        }))
    }

    /// Контроллер поверх реального стека: WebSocket relay + webrtc
    pub async fn connect(config: &Config, device: Arc<dyn CaptureDevice>) -> Result<Arc<Self>> {
        config.validate()?;
        logger::init(&config.logging);
        let transport = WsTransport::connect(&config.relay_url, &config.local_id).await?;
        let factory = Arc::new(RtcConnectionFactory::new(&config.ice_servers)?);
        Self::new(
            NegotiatorSettings::from_config(config),
            transport,
            factory,
            device,
        )
    }

    pub fn local_id(&self) -> &str {
        self.negotiator.local_id()
    }

    pub fn state(&self) -> CallState {
        lock(&self.control).state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    pub fn media(&self) -> &Arc<MediaPipeline> {
        &self.media
    }

    pub fn session_count(&self) -> usize {
        self.negotiator.session_count()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Захватывает локальное медиа и переводит звонок в Calling.
    /// Ошибка устройства прерывает старт, состояние не меняется.
    pub async fn start(&self, constraints: MediaConstraints) -> Result<Arc<LocalMediaStream>> {
        let epoch = {
            let mut control = lock(&self.control);
            if control.state == CallState::Calling || control.starting {
                return Err(Error::InvalidState("call already started".into()));
            }
            control.starting = true;
            control.epoch
        };

        let acquired = self
            .media
            .acquire_local(self.device.as_ref(), &constraints)
            .await;

        let stream = {
            let mut control = lock(&self.control);
            if control.epoch == epoch {
                control.starting = false;
            }
            match acquired {
                Err(e) => {
                    drop(control);
                    warn!(error = %e, "failed to acquire local media");
                    self.events.emit(CallEvent::DeviceFailed {
                        message: e.to_string(),
                    });
                    return Err(e.into());
                }
                Ok(_) if control.epoch != epoch => {
                    drop(control);
                    self.media.release_local();
                    info!("call terminated while acquiring media");
                    return Err(Error::Cancelled(
                        "call terminated while acquiring media".into(),
                    ));
                }
                Ok(stream) => {
                    control.state = CallState::Calling;
                    self.negotiator.set_accepting(true);
                    stream
                }
            }
        };

        let attached = self.negotiator.attach_local_tracks().await;
        if attached > 0 {
            info!(sessions = attached, "local tracks attached to live sessions");
        }
        let preview = lock(&self.preview).clone();
        if let Some(preview) = preview {
            preview.attach_local(stream.clone(), true);
        }
        self.events.emit(CallEvent::StateChanged {
            state: CallState::Calling,
        });
        info!(stream_id = %stream.id(), "call started");
        Ok(stream)
    }

    /// Исходящий звонок конкретному пиру
    pub async fn call(&self, peer_id: &str) -> Result<Outcome> {
        if self.state() != CallState::Calling {
            return Err(Error::InvalidState(
                "local media not started, call start() first".into(),
            ));
        }
        self.negotiator.start_outbound(peer_id).await
    }

    /// Завершает звонок: запись, локальные треки, все сессии.
    /// Повторный вызов безопасен; `CallEnded` уходит один раз.
    pub async fn terminate(&self, reason: TerminateReason) -> bool {
        let (recorder, previous) = {
            let mut control = lock(&self.control);
            control.epoch += 1;
            control.starting = false;
            let previous = std::mem::replace(&mut control.state, CallState::Ended);
            (control.recorder.take(), previous)
        };

        if let Some(recorder) = recorder {
            let recording = recorder.stop().await;
            let fragments = recording.len();
            lock(&self.control).last_recording = Some(recording);
            self.events
                .emit(CallEvent::RecordingStopped { fragments });
        }
        self.media.release_local();
        self.negotiator.set_accepting(false);
        let closed = self.negotiator.close_all().await;
        self.media.clear_remote();
        self.dispatcher.reset();

        if previous == CallState::Ended {
            debug!(?reason, "call already ended");
            return false;
        }
        info!(?reason, closed, "call ended");
        self.events.emit(CallEvent::StateChanged {
            state: CallState::Ended,
        });
        self.events.emit(CallEvent::CallEnded { reason });
        true
    }

    /// Вкл/выкл исходящих треков только для этого пира
    pub async fn toggle_track_enabled(&self, peer_id: &str) -> Result<Vec<TrackToggle>> {
        let connection = self
            .negotiator
            .connection(peer_id)
            .ok_or_else(|| Error::SessionNotFound(peer_id.to_string()))?;
        let toggled = MediaPipeline::toggle_outbound(connection.as_ref()).await?;
        info!(peer_id, ?toggled, "outbound tracks toggled");
        Ok(toggled)
    }

    pub fn is_speaker_on(&self) -> bool {
        self.media.is_speaker_on()
    }

    /// Динамик: включает/выключает воспроизведение удалённого звука у всех
    /// пиров. Что уходит пирам, не меняется. Возвращает новое состояние.
    pub fn toggle_speaker(&self) -> bool {
        let on = {
            // переключение под блокировкой звонка, чтобы два вызова не слились
            let _control = lock(&self.control);
            let on = !self.media.is_speaker_on();
            let sinks = self.media.set_speaker(on);
            info!(on, sinks, "speaker toggled");
            on
        };
        self.events.emit(CallEvent::SpeakerToggled { on });
        on
    }

    pub fn register_sink(&self, peer_id: &str, sink: Arc<dyn PlaybackSink>) -> usize {
        self.media.register_sink(peer_id, sink)
    }

    pub fn unregister_sink(&self, peer_id: &str) {
        self.media.unregister_sink(peer_id);
    }

    /// Превью всегда без звука, чтобы не было эха
    pub fn set_preview(&self, sink: Arc<dyn PreviewSink>) {
        if let Some(stream) = self.media.local_stream() {
            sink.attach_local(stream, true);
        }
        *lock(&self.preview) = Some(sink);
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.control).recorder.is_some()
    }

    /// Пишет только локальный поток
    pub fn start_recording(&self) -> Result<()> {
        let stream = self
            .media
            .local_stream()
            .ok_or_else(|| Error::InvalidState("no local media to record".into()))?;
        {
            let mut control = lock(&self.control);
            if control.recorder.is_some() {
                return Err(Error::InvalidState("already recording".into()));
            }
            control.recorder = Some(Recorder::start(&stream));
        }
        self.events.emit(CallEvent::RecordingStarted);
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<Recording> {
        let recorder = lock(&self.control)
            .recorder
            .take()
            .ok_or_else(|| Error::InvalidState("not recording".into()))?;
        let recording = recorder.stop().await;
        lock(&self.control).last_recording = Some(recording.clone());
        self.events.emit(CallEvent::RecordingStopped {
            fragments: recording.len(),
        });
        Ok(recording)
    }

    /// Упаковывает последнюю законченную запись
    pub fn download(&self) -> Result<RecordingArtifact> {
        let control = lock(&self.control);
        let recording = control
            .last_recording
            .as_ref()
            .ok_or_else(|| Error::Recording("nothing recorded yet".into()))?;
        RecordingArtifact::package(recording)
    }
}
