use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::error::RejectReason;
use crate::media::{MediaFlags, MediaKind};
use crate::transport::ConnectionState;

pub const CONNECTED_TO_SERVER: &str = "Connected to server";
pub const DISCONNECTED_FROM_SERVER: &str = "Disconnected from server";
pub const FAILED_TO_CONNECT: &str = "Failed to connect to server";
pub const WAITING_FOR_PEER: &str = "Waiting for peer...";
pub const PEER_FOUND: &str = "Peer found, connecting...";
pub const PEER_DISCONNECTED: &str = "Peer disconnected";
pub const NEGOTIATION_FAILED: &str = "WebRTC negotiation failed";
pub const CANDIDATE_FAILED: &str = "ICE negotiation failed";
pub const UNEXPECTED_ERROR: &str = "An unexpected error occurred.";

/// Status line for a transport connection state, if it warrants one.
pub fn connection_state_text(state: ConnectionState) -> Option<&'static str> {
    match state {
        ConnectionState::Connected => Some("Connected - call active"),
        ConnectionState::Disconnected => Some("Connection lost"),
        ConnectionState::Failed => Some("Connection failed"),
        ConnectionState::Closed => Some("Connection closed"),
        ConnectionState::New | ConnectionState::Connecting => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub display_name: String,
    pub connection: ConnectionState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub text: String,
    pub room_id: String,
    pub joined: bool,
    pub peers: BTreeMap<String, PeerStatus>,
    pub media: MediaFlags,
    /// False when the host cannot capture its display.
    pub screen_share_supported: bool,
    /// Whole seconds left on the session timer while joined.
    pub time_remaining_secs: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            text: "Initializing...".to_string(),
            room_id: String::new(),
            joined: false,
            peers: BTreeMap::new(),
            media: MediaFlags::default(),
            screen_share_supported: true,
            time_remaining_secs: None,
            last_error: None,
        }
    }
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Manual,
    Timeout,
    MeetingEnded,
    Rejected(RejectReason),
    /// Required runtime support is missing.
    Unsupported,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Manual => write!(f, "Left the meeting"),
            ExitReason::Timeout => write!(f, "Session time limit reached"),
            ExitReason::MeetingEnded => write!(f, "The host ended the meeting"),
            ExitReason::Rejected(reason) => write!(f, "{reason}"),
            ExitReason::Unsupported => write!(f, "Calls are not supported on this system"),
        }
    }
}

/// One-off events for the user, as opposed to the persistent [`SessionStatus`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Alert(String),
    RemoteMedia {
        participant_id: String,
        display_name: String,
        kind: MediaKind,
        enabled: bool,
    },
    ScreenShare {
        display_name: String,
        active: bool,
    },
    TimeWarning {
        remaining: Duration,
    },
    /// Terminal. Control returns to the lobby.
    Exited(ExitReason),
}

/// Publishes session status and notices to any number of observers.
#[derive(Clone)]
pub struct StatusMonitor {
    status: Arc<watch::Sender<SessionStatus>>,
    receiver: watch::Receiver<SessionStatus>,
    notices: broadcast::Sender<SessionNotice>,
    exit: Arc<watch::Sender<Option<ExitReason>>>,
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(SessionStatus::default());
        let (notices, _) = broadcast::channel(64);
        let (exit, _) = watch::channel(None);
        Self {
            status: Arc::new(status),
            receiver,
            notices,
            exit: Arc::new(exit),
        }
    }

    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.status.send_modify(|status| status.text = text);
    }

    pub fn set_room(&self, room_id: &str) {
        self.status
            .send_modify(|status| status.room_id = room_id.to_string());
    }

    /// Leaving also clears the countdown.
    pub fn set_joined(&self, joined: bool) {
        self.status.send_modify(|status| {
            status.joined = joined;
            if !joined {
                status.time_remaining_secs = None;
            }
        });
    }

    /// Mirror a session countdown into the status until it stops. Updates
    /// that land after leaving are ignored.
    pub fn follow_countdown(&self, mut remaining: watch::Receiver<Duration>) {
        let status = self.status.clone();
        tokio::spawn(async move {
            loop {
                let secs = remaining.borrow_and_update().as_secs();
                status.send_if_modified(|status| {
                    if !status.joined || status.time_remaining_secs == Some(secs) {
                        return false;
                    }
                    status.time_remaining_secs = Some(secs);
                    true
                });
                if remaining.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    pub fn set_screen_share_supported(&self, supported: bool) {
        self.status
            .send_modify(|status| status.screen_share_supported = supported);
    }

    pub fn set_media(&self, flags: MediaFlags) {
        self.status.send_modify(|status| status.media = flags);
    }

    pub fn upsert_peer(&self, participant_id: &str, display_name: &str, audio: bool, video: bool) {
        self.status.send_modify(|status| {
            let peer = status
                .peers
                .entry(participant_id.to_string())
                .or_insert_with(|| PeerStatus {
                    display_name: display_name.to_string(),
                    connection: ConnectionState::New,
                    audio_enabled: audio,
                    video_enabled: video,
                });
            peer.display_name = display_name.to_string();
            peer.audio_enabled = audio;
            peer.video_enabled = video;
        });
    }

    pub fn set_peer_connection(&self, participant_id: &str, state: ConnectionState) {
        self.status.send_modify(|status| {
            if let Some(peer) = status.peers.get_mut(participant_id) {
                peer.connection = state;
            }
        });
    }

    pub fn set_peer_media(&self, participant_id: &str, kind: MediaKind, enabled: bool) {
        self.status.send_modify(|status| {
            if let Some(peer) = status.peers.get_mut(participant_id) {
                match kind {
                    MediaKind::Audio => peer.audio_enabled = enabled,
                    MediaKind::Video => peer.video_enabled = enabled,
                }
            }
        });
    }

    pub fn remove_peer(&self, participant_id: &str) {
        self.status.send_modify(|status| {
            status.peers.remove(participant_id);
        });
    }

    pub fn clear_peers(&self) {
        self.status.send_modify(|status| status.peers.clear());
    }

    /// Record a failure and show `text` as the status line.
    pub fn set_error(&self, text: impl Into<String>, error: impl fmt::Display) {
        let text = text.into();
        let error = error.to_string();
        self.status.send_modify(|status| {
            status.text = text;
            status.last_error = Some(error);
        });
    }

    pub fn status(&self) -> SessionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.receiver.clone()
    }

    pub fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Record the end of the session. Only the first reason sticks.
    pub fn exit(&self, reason: ExitReason) {
        let first = self.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
        if first {
            self.notify(SessionNotice::Exited(reason));
        }
    }

    /// Wait until the session has ended.
    pub async fn exited(&self) -> ExitReason {
        let mut rx = self.exit.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ExitReason::Manual),
            Err(_) => ExitReason::Manual,
        };
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_states_map_to_status_lines() {
        assert_eq!(
            connection_state_text(ConnectionState::Connected),
            Some("Connected - call active")
        );
        assert_eq!(
            connection_state_text(ConnectionState::Disconnected),
            Some("Connection lost")
        );
        assert_eq!(connection_state_text(ConnectionState::Failed), Some("Connection failed"));
        assert_eq!(connection_state_text(ConnectionState::Closed), Some("Connection closed"));
        assert_eq!(connection_state_text(ConnectionState::Connecting), None);
    }

    #[test]
    fn peer_updates_are_visible_to_subscribers() {
        let monitor = StatusMonitor::new();
        let rx = monitor.subscribe();

        monitor.upsert_peer("user-2", "Grace", true, true);
        monitor.set_peer_connection("user-2", ConnectionState::Connected);
        monitor.set_peer_media("user-2", MediaKind::Video, false);

        let status = rx.borrow().clone();
        let peer = &status.peers["user-2"];
        assert_eq!(peer.connection, ConnectionState::Connected);
        assert!(!peer.video_enabled);
        assert!(peer.audio_enabled);
    }

    #[test]
    fn unknown_peers_are_not_created_by_updates() {
        let monitor = StatusMonitor::new();
        monitor.set_peer_connection("ghost", ConnectionState::Failed);
        assert!(monitor.status().peers.is_empty());
    }

    #[test]
    fn errors_keep_the_cause() {
        let monitor = StatusMonitor::new();
        monitor.set_error(NEGOTIATION_FAILED, "bad sdp");
        let status = monitor.status();
        assert_eq!(status.text, NEGOTIATION_FAILED);
        assert_eq!(status.last_error.as_deref(), Some("bad sdp"));
    }

    #[tokio::test]
    async fn only_the_first_exit_is_announced() {
        let monitor = StatusMonitor::new();
        let mut notices = monitor.notices();
        assert_eq!(*monitor.exit.borrow(), None);

        monitor.exit(ExitReason::MeetingEnded);
        monitor.exit(ExitReason::Manual);

        assert_eq!(monitor.exited().await, ExitReason::MeetingEnded);
        assert_eq!(*monitor.exit.borrow(), Some(ExitReason::MeetingEnded));
        assert_eq!(
            notices.recv().await.unwrap(),
            SessionNotice::Exited(ExitReason::MeetingEnded)
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn countdown_is_shown_only_while_joined() {
        let monitor = StatusMonitor::new();
        let (tx, rx) = watch::channel(Duration::from_secs(90));
        monitor.set_joined(true);
        monitor.follow_countdown(rx);

        let mut status = monitor.subscribe();
        status
            .wait_for(|s| s.time_remaining_secs == Some(90))
            .await
            .unwrap();
        tx.send_replace(Duration::from_secs(89));
        status
            .wait_for(|s| s.time_remaining_secs == Some(89))
            .await
            .unwrap();

        monitor.set_joined(false);
        assert_eq!(monitor.status().time_remaining_secs, None);
        tx.send_replace(Duration::from_secs(88));
        drop(tx);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(monitor.status().time_remaining_secs, None);
    }

    #[tokio::test]
    async fn notices_reach_every_subscriber() {
        let monitor = StatusMonitor::new();
        let mut first = monitor.notices();
        let mut second = monitor.notices();

        monitor.notify(SessionNotice::Exited(ExitReason::Timeout));

        assert_eq!(first.recv().await.unwrap(), SessionNotice::Exited(ExitReason::Timeout));
        assert_eq!(second.recv().await.unwrap(), SessionNotice::Exited(ExitReason::Timeout));
    }
}
