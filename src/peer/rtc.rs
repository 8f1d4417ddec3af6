use crate::error::Result;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, RemoteStream, RtcRemoteTrack, TrackOutput};
use crate::peer::connection::{
    ConnectionContext, ConnectionFactory, ConnectionState, OutboundSender, PeerConnection,
};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};
use crate::utils::{add_ice_url_scheme, lock};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Фабрика соединений на движке `webrtc`
pub struct RtcConnectionFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnectionFactory {
    pub fn new(servers: &[ServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            config: rtc_config(servers),
        })
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(&self, ctx: ConnectionContext) -> Result<Arc<dyn PeerConnection>> {
        Ok(self.open(ctx).await? as Arc<dyn PeerConnection>)
    }
}

impl RtcConnectionFactory {
    /// То же, что `create`, но с конкретным типом соединения
    pub async fn open(&self, ctx: ConnectionContext) -> Result<Arc<RtcPeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let peer_id = ctx.peer_id.clone();

        // Trickle-ICE: каждый локальный кандидат сразу уходит в negotiator
        let events = ctx.events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        dump_candidate("LOCAL", events.peer_id(), &candidate);
                        events.local_candidate(candidate);
                    }
                    Err(e) => warn!(peer_id = events.peer_id(), error = %e, "failed to serialize local candidate"),
                },
                // cand == None означает конец сбора
                None => events.gathering_complete(),
            }
            Box::pin(async {})
        }));

        let events = ctx.events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                debug!(peer_id = events.peer_id(), track_id = %track.id(), "remote track received");
                events.remote_track(RemoteStream::new(Arc::new(RtcRemoteTrack(track))));
                Box::pin(async {})
            },
        ));

        pc.on_ice_gathering_state_change(Box::new({
            let peer_id = peer_id.clone();
            move |state| {
                debug!(peer_id = %peer_id, ?state, "ICE gathering state changed");
                Box::pin(async {})
            }
        }));

        // слабая ссылка, чтобы обработчик не держал соединение живым
        let pc_state = Arc::downgrade(&pc);
        let events = ctx.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(peer_id = events.peer_id(), state = %st, "peer connection state changed");
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_state.upgrade() {
                    let peer_id = events.peer_id().to_string();
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, &peer_id, "BEFORE-FAIL").await;
                    });
                }
            }
            events.state_changed(ConnectionState::from(st));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RtcSender>>>,
}

impl RtcPeerConnection {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn OutboundSender>> {
        let output = track.bind_output();
        let rtp_sender = self
            .pc
            .add_track(output.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP нужно вычитывать, иначе interceptor'ы не работают
        tokio::spawn(async move { while rtp_sender.read_rtcp().await.is_ok() {} });

        let sender = Arc::new(RtcSender {
            track_id: track.id().to_string(),
            output,
        });
        lock(&self.senders).push(sender.clone());
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn OutboundSender>> {
        lock(&self.senders)
            .iter()
            .map(|s| s.clone() as Arc<dyn OutboundSender>)
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Sender держит собственный выход локального трека. Выключение только
/// перестаёт писать в этот выход: трек остаётся привязанным к
/// соединению, остальные пиры его не замечают.
pub struct RtcSender {
    track_id: String,
    output: Arc<TrackOutput>,
}

#[async_trait]
impl OutboundSender for RtcSender {
    fn track_id(&self) -> String {
        self.track_id.clone()
    }

    fn is_enabled(&self) -> bool {
        self.output.is_enabled()
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.output.set_enabled(enabled);
        debug!(track_id = %self.track_id, enabled, "outbound sender toggled");
        Ok(())
    }
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
