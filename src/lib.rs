//! duocall: ядро сигнализации для звонков один-на-один поверх WebRTC.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod negotiator;
pub mod peer;
pub mod recording;
pub mod session;
pub mod signaling;
pub mod utils;

pub use call::{CallController, CallState, Dispatcher, TerminateReason};
pub use config::Config;
pub use error::{DeviceError, Error, Result};
pub use events::{CallEvent, EventEmitter};
pub use media::{
    CaptureDevice, LocalMediaStream, LocalTrack, MediaConstraints, MediaPipeline, PlaybackSink,
    PreviewSink, RemoteStream, RemoteTrack, TrackKind,
};
pub use negotiator::{DropReason, Negotiator, NegotiatorSettings, Outcome};
pub use recording::{Recorder, Recording, RecordingArtifact};
pub use session::{NegotiationState, Role};
pub use signaling::{
    MemoryRelay, MemoryTransport, SignalKind, SignalMessage, SignalingTransport, WsTransport,
};
