use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{AudioMetrics, NetworkMetrics, VideoMetrics};
use crate::room::Participant;
use crate::transport::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Signaling channel is closed")]
    Closed,
}

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Join {
        room_id: String,
        participant_id: String,
        display_name: String,
        video_enabled: bool,
    },
    UserReady {
        room_id: String,
        display_name: String,
    },
    Offer {
        sdp: SessionDescription,
        to_participant_id: String,
        room_id: String,
        display_name: String,
    },
    Answer {
        sdp: SessionDescription,
        to_participant_id: String,
        room_id: String,
        display_name: String,
    },
    IceCandidate {
        candidate: IceCandidate,
        to_participant_id: String,
    },
    Leave {
        room_id: String,
        display_name: String,
    },
    EndMeeting {
        room_id: String,
    },
    AudioToggle {
        participant_id: String,
        enabled: bool,
        display_name: String,
    },
    VideoToggle {
        participant_id: String,
        enabled: bool,
        display_name: String,
    },
    ScreenShareStart {
        room_id: String,
        display_name: String,
    },
    ScreenShareStop {
        room_id: String,
        display_name: String,
    },
    MetricsUpdate {
        participant_id: String,
        network: NetworkMetrics,
        video: VideoMetrics,
        audio: AudioMetrics,
    },
}

/// Messages the relay delivers to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    UserJoined {
        users: Vec<Participant>,
        is_initiator: bool,
    },
    UserReady {
        from_participant_id: String,
        room_id: String,
        display_name: String,
    },
    Offer {
        sdp: SessionDescription,
        from_participant_id: String,
        room_id: String,
        display_name: String,
    },
    Answer {
        sdp: SessionDescription,
        from_participant_id: String,
        room_id: String,
        display_name: String,
    },
    IceCandidate {
        candidate: IceCandidate,
        from_participant_id: String,
    },
    UserLeft {
        participant_id: String,
        display_name: String,
    },
    MeetingEnded {
        room_id: String,
    },
    AudioToggle {
        participant_id: String,
        enabled: bool,
        display_name: String,
    },
    VideoToggle {
        participant_id: String,
        enabled: bool,
        display_name: String,
    },
    ScreenShareStart {
        room_id: String,
        display_name: String,
    },
    ScreenShareStop {
        room_id: String,
        display_name: String,
    },
    RoomFull,
    RoomNotFound,
    DuplicateJoin,
}

/// What the relay connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Message(ServerMessage),
    Disconnected,
}

/// Outbound half of a relay connection.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn emit(&self, message: ClientMessage) -> Result<(), SignalingError>;

    /// Close the connection. Safe to call more than once.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

enum Outgoing {
    Frame(String),
    Close,
}

/// WebSocket connection to the relay. Frames are JSON [`ClientMessage`] /
/// [`ServerMessage`] values.
pub struct SignalingClient {
    tx: mpsc::Sender<Outgoing>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl SignalingClient {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!(%url, "Connected to signaling server");

        let (event_tx, event_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Outgoing>(100);
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let _ = event_tx.send(SignalingEvent::Connected).await;

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(item) = outgoing_rx.recv().await {
                match item {
                    Outgoing::Frame(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            warn!(error = %e, "Failed to write signaling frame");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = write.close().await;
                        break;
                    }
                }
            }
        });

        // Handle incoming messages
        let reader_connected = connected.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    frame = read.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                if event_tx.send(SignalingEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(error = %e, "Ignoring unrecognised signaling frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Signaling connection error");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let _ = event_tx.send(SignalingEvent::Disconnected).await;
        });

        Ok((
            Self {
                tx: outgoing_tx,
                connected,
                shutdown,
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn emit(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        let json = serde_json::to_string(&message)?;
        self.tx
            .send(Outgoing::Frame(json))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outgoing::Close).await;
            self.shutdown.cancel();
            info!("Disconnected from signaling server");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_carry_an_event_discriminant() {
        let message = ClientMessage::Join {
            room_id: "r1".into(),
            participant_id: "user-1".into(),
            display_name: "Ada".into(),
            video_enabled: true,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "event": "join",
                "roomId": "r1",
                "participantId": "user-1",
                "displayName": "Ada",
                "videoEnabled": true
            })
        );
    }

    #[test]
    fn rejections_need_no_payload() {
        let message: ServerMessage = serde_json::from_value(json!({ "event": "room-full" })).unwrap();
        assert_eq!(message, ServerMessage::RoomFull);

        let message: ServerMessage =
            serde_json::from_value(json!({ "event": "duplicate-join" })).unwrap();
        assert_eq!(message, ServerMessage::DuplicateJoin);
    }

    #[test]
    fn inbound_offer_names_the_sender() {
        let message: ServerMessage = serde_json::from_value(json!({
            "event": "offer",
            "sdp": { "type": "offer", "sdp": "v=0" },
            "fromParticipantId": "user-2",
            "roomId": "r1",
            "displayName": "Grace"
        }))
        .unwrap();
        match message {
            ServerMessage::Offer {
                sdp,
                from_participant_id,
                ..
            } => {
                assert_eq!(sdp, SessionDescription::offer("v=0"));
                assert_eq!(from_participant_id, "user-2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_events_are_rejected() {
        let result = serde_json::from_value::<ServerMessage>(json!({ "event": "chat-message" }));
        assert!(result.is_err());
    }
}
