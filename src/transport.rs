//! The point-to-point media transport contract.
//!
//! The session core only talks to transports through [`Transport`] and
//! [`TransportFactory`]; `crate::webrtc` provides the webrtc-rs backed
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::media::{LocalTrack, MediaKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("No {0} sender on this transport")]
    NoSender(MediaKind),

    #[error("Transport is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Negotiation description, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled connectivity candidate, shaped like `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Notifications a transport raises on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaKind),
    StateChanged(ConnectionState),
}

/// A transport notification tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub participant_id: String,
    /// Registry generation of the owning session; stale generations are dropped.
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a transport delivers its notifications.
#[derive(Clone)]
pub struct TransportEventSink {
    participant_id: String,
    generation: u64,
    deliver: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl TransportEventSink {
    pub fn new(
        participant_id: impl Into<String>,
        generation: u64,
        deliver: impl Fn(PeerEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            generation,
            deliver: Arc::new(deliver),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.deliver)(PeerEvent {
            participant_id: self.participant_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink")
            .field("participant_id", &self.participant_id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Outbound,
    Inbound,
    /// The remote end's receiver report about our outbound stream.
    RemoteInbound,
}

/// One entry of a statistics report. Counters are cumulative.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntry {
    pub id: String,
    pub kind: MediaKind,
    pub direction: StreamDirection,
    /// Milliseconds on a clock private to the transport.
    pub timestamp_ms: f64,
    /// Bytes sent (outbound) or received (inbound).
    pub bytes: u64,
    pub packets_sent: u64,
    pub packets_lost: i64,
    /// Seconds.
    pub jitter: Option<f64>,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    /// Seconds.
    pub round_trip_time: Option<f64>,
}

impl StatsEntry {
    pub fn new(
        id: impl Into<String>,
        kind: MediaKind,
        direction: StreamDirection,
        timestamp_ms: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            direction,
            timestamp_ms,
            bytes: 0,
            packets_sent: 0,
            packets_lost: 0,
            jitter: None,
            frames_per_second: None,
            frame_width: None,
            frame_height: None,
            round_trip_time: None,
        }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn with_packets_sent(mut self, packets: u64) -> Self {
        self.packets_sent = packets;
        self
    }

    pub fn with_packets_lost(mut self, packets: i64) -> Self {
        self.packets_lost = packets;
        self
    }

    pub fn with_jitter(mut self, seconds: f64) -> Self {
        self.jitter = Some(seconds);
        self
    }

    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frames_per_second = Some(fps);
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_width = Some(width);
        self.frame_height = Some(height);
        self
    }

    pub fn with_round_trip_time(mut self, seconds: f64) -> Self {
        self.round_trip_time = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub entries: Vec<StatsEntry>,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ice_servers: Vec<String>,
}

/// An outbound media slot on a transport.
#[async_trait]
pub trait MediaSender: Send + Sync {
    fn kind(&self) -> MediaKind;

    async fn track(&self) -> Option<LocalTrack>;

    /// Swap the source feeding this sender without renegotiating.
    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn MediaSender>, TransportError>;

    /// Negotiate an outbound `kind` slot that carries nothing yet, so a track
    /// acquired later can be swapped in without a new offer.
    async fn reserve_sender(&self, kind: MediaKind) -> Result<Arc<dyn MediaSender>, TransportError>;

    async fn senders(&self) -> Vec<Arc<dyn MediaSender>>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    fn connection_state(&self) -> ConnectionState;

    /// Must be safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Point the transport's outbound `kind` slot at `track`. The slot must exist
/// already; adding one to a negotiated transport would go unseen by the peer.
pub async fn set_outbound_track(
    transport: &dyn Transport,
    track: &LocalTrack,
) -> Result<(), TransportError> {
    let kind = track.kind();
    for sender in transport.senders().await {
        if sender.kind() == kind {
            return sender.replace_track(Some(track.clone())).await;
        }
    }
    Err(TransportError::NoSender(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn description_serializes_like_the_browser() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "offer", "sdp": "v=0" }));
    }

    #[test]
    fn candidate_accepts_browser_field_names() {
        let candidate: IceCandidate = serde_json::from_value(serde_json::json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn sink_tags_events_with_owner() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = seen.clone();
        let sink = TransportEventSink::new("user-9", 4, move |e| store.lock().unwrap().push(e));

        sink.emit(TransportEvent::StateChanged(ConnectionState::Connected));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].participant_id, "user-9");
        assert_eq!(seen[0].generation, 4);
    }
}
