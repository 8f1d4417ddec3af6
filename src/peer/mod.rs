pub mod connection;
pub mod ice;
pub mod rtc;
pub mod types;

pub use connection::{
    ConnectionContext, ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState,
    OutboundSender, PeerConnection,
};
pub use rtc::RtcConnectionFactory;
pub use types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
