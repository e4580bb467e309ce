//! [`Transport`] on top of a webrtc-rs `RTCPeerConnection`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio;
use crate::media::{LocalTrack, MediaKind};
use crate::transport::{
    ConnectionState, IceCandidate, MediaSender, SdpType, SessionDescription, StatsEntry,
    StreamDirection, Transport, TransportConfig, TransportError, TransportEvent,
    TransportEventSink, TransportFactory, TransportStats,
};

/// Builds peer connections from one shared webrtc-rs API instance.
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        let transport = WebRtcTransport::new(peer_connection, events);
        Ok(Arc::new(transport))
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn media_kind(kind: &str) -> Option<MediaKind> {
    match kind {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

pub struct WebRtcSender {
    kind: MediaKind,
    sender: Arc<RTCRtpSender>,
    track: Mutex<Option<LocalTrack>>,
}

#[async_trait]
impl MediaSender for WebRtcSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn track(&self) -> Option<LocalTrack> {
        self.track.lock().await.clone()
    }

    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), TransportError> {
        let rtc = track
            .as_ref()
            .map(|t| t.rtc().clone() as Arc<dyn TrackLocal + Send + Sync>);
        self.sender.replace_track(rtc).await?;
        *self.track.lock().await = track;
        Ok(())
    }
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<WebRtcSender>>>,
    state: Arc<std::sync::Mutex<ConnectionState>>,
    closed: AtomicBool,
    epoch: Instant,
}

impl WebRtcTransport {
    fn new(peer_connection: Arc<RTCPeerConnection>, events: TransportEventSink) -> Self {
        let state = Arc::new(std::sync::Mutex::new(ConnectionState::New));

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    let mime = track.codec().capability.mime_type;
                    info!(participant_id = %sink.participant_id(), %kind, %mime, "Remote track received");
                    sink.emit(TransportEvent::RemoteTrack(kind));

                    // The handler must return promptly; reading happens elsewhere.
                    if kind == MediaKind::Audio && mime.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
                        audio::play_remote(track);
                    } else {
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 1500];
                            while track.read(&mut buf).await.is_ok() {}
                        });
                    }
                })
            },
        ));

        let sink = events;
        let shared_state = state.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let mapped = connection_state(s);
                if let Ok(mut current) = shared_state.lock() {
                    *current = mapped;
                }
                debug!(participant_id = %sink.participant_id(), state = %s, "Peer connection state changed");
                sink.emit(TransportEvent::StateChanged(mapped));
                Box::pin(async {})
            },
        ));

        Self {
            peer_connection,
            senders: Mutex::new(Vec::new()),
            state,
            closed: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    async fn keep_sender(
        &self,
        kind: MediaKind,
        rtp_sender: Arc<RTCRtpSender>,
        track: Option<LocalTrack>,
    ) -> Arc<dyn MediaSender> {
        // Drain RTCP so interceptors keep running.
        let rtcp = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        let sender = Arc::new(WebRtcSender {
            kind,
            sender: rtp_sender,
            track: Mutex::new(track),
        });
        self.senders.lock().await.push(sender.clone());
        sender
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn MediaSender>, TransportError> {
        self.ensure_open()?;
        let rtp_sender = self
            .peer_connection
            .add_track(track.rtc().clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(self.keep_sender(track.kind(), rtp_sender, Some(track.clone())).await)
    }

    async fn reserve_sender(&self, kind: MediaKind) -> Result<Arc<dyn MediaSender>, TransportError> {
        self.ensure_open()?;
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let transceiver = self
            .peer_connection
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;
        debug!(%kind, "Reserved empty sender");
        Ok(self.keep_sender(kind, transceiver.sender().await, None).await)
    }

    async fn senders(&self) -> Vec<Arc<dyn MediaSender>> {
        self.senders
            .lock()
            .await
            .iter()
            .map(|s| s.clone() as Arc<dyn MediaSender>)
            .collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let desc = to_rtc_description(desc)?;
        self.peer_connection.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let desc = to_rtc_description(desc)?;
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ensure_open()?;
        let report = self.peer_connection.get_stats().await;
        let now_ms = self.epoch.elapsed().as_secs_f64() * 1000.0;

        let mut entries = Vec::new();
        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(s) => {
                    if let Some(kind) = media_kind(&s.kind) {
                        entries.push(
                            StatsEntry::new(s.id.clone(), kind, StreamDirection::Outbound, now_ms)
                                .with_bytes(s.bytes_sent)
                                .with_packets_sent(s.packets_sent),
                        );
                    }
                }
                StatsReportType::InboundRTP(s) => {
                    if let Some(kind) = media_kind(&s.kind) {
                        entries.push(
                            StatsEntry::new(s.id.clone(), kind, StreamDirection::Inbound, now_ms)
                                .with_bytes(s.bytes_received),
                        );
                    }
                }
                StatsReportType::RemoteInboundRTP(s) => {
                    if let Some(kind) = media_kind(&s.kind) {
                        let mut entry = StatsEntry::new(
                            s.id.clone(),
                            kind,
                            StreamDirection::RemoteInbound,
                            now_ms,
                        )
                        .with_packets_lost(s.packets_lost);
                        if let Some(rtt) = s.round_trip_time {
                            entry = entry.with_round_trip_time(rtt);
                        }
                        entries.push(entry);
                    }
                }
                _ => {}
            }
        }
        Ok(TransportStats { entries })
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}
