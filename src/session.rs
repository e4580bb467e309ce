//! The session actor.
//!
//! One task owns the peer registry, the roster, local media and the session
//! timer. Relay messages, transport notifications, user commands, timer
//! ticks and delayed offers all arrive as [`SessionEvent`]s on a single
//! channel, so handling for any participant is serialised.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, SessionConfig};
use crate::connection::{
    connection_state_text, ExitReason, SessionNotice, SessionStatus, StatusMonitor,
    CANDIDATE_FAILED, CONNECTED_TO_SERVER, DISCONNECTED_FROM_SERVER, NEGOTIATION_FAILED,
    PEER_DISCONNECTED, PEER_FOUND, UNEXPECTED_ERROR, WAITING_FOR_PEER,
};
use crate::error::{Error, ErrorCategory, RejectReason, Result};
use crate::media::{LocalMediaController, MediaDevices, MediaFlags, MediaKind};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::negotiation::{NegotiationStep, Negotiator, Role};
use crate::registry::{PeerRegistry, PeerView};
use crate::room::{Participant, Roster};
use crate::signaling::{ClientMessage, ServerMessage, SignalingChannel, SignalingEvent};
use crate::timer::{SessionTimer, TimerEvent};
use crate::transport::{
    ConnectionState, PeerEvent, SessionDescription, TransportConfig, TransportEvent,
    TransportFactory,
};

/// User requests, each answered on its own reply channel.
pub enum Command {
    ToggleMicrophone(oneshot::Sender<Result<bool>>),
    ToggleCamera(oneshot::Sender<Result<bool>>),
    ToggleScreenShare(oneshot::Sender<Result<bool>>),
    Leave(oneshot::Sender<()>),
    EndMeeting(oneshot::Sender<()>),
    Inspect(oneshot::Sender<Vec<PeerView>>),
}

pub enum SessionEvent {
    Signaling(SignalingEvent),
    Peer(PeerEvent),
    Command(Command),
    /// The initiator's stabilisation delay for this session has passed.
    SendOffer {
        participant_id: String,
        generation: u64,
    },
    Timer(TimerEvent),
    /// A display capture track ended, possibly from outside the client.
    ScreenShareEnded { track_id: String },
}

impl From<TimerEvent> for SessionEvent {
    fn from(event: TimerEvent) -> Self {
        SessionEvent::Timer(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Joining,
    Joined,
    Left,
}

pub struct Session {
    identity: SessionConfig,
    config: ClientConfig,
    phase: Phase,
    signaling: Arc<dyn SignalingChannel>,
    negotiator: Negotiator,
    registry: PeerRegistry,
    roster: Roster,
    media: LocalMediaController,
    metrics: MetricsCollector,
    timer: Option<SessionTimer>,
    monitor: StatusMonitor,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    /// Check capabilities, open local media, ask the relay to join, and spawn
    /// the actor. The returned handle is the only way to talk to it.
    pub async fn start(
        identity: SessionConfig,
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        mut signaling_events: mpsc::Receiver<SignalingEvent>,
    ) -> Result<SessionHandle> {
        let monitor = StatusMonitor::new();
        monitor.set_room(&identity.room_id);

        let mut media = LocalMediaController::new(devices);
        let capabilities = media.capabilities();
        if !capabilities.user_media {
            monitor.set_text(ExitReason::Unsupported.to_string());
            return Err(Error::Capability("camera and microphone capture".into()));
        }
        if !capabilities.display_capture {
            warn!("Display capture unavailable, screen sharing disabled");
            monitor.set_screen_share_supported(false);
        }

        media.acquire(identity.no_audio, identity.video_off).await?;
        monitor.set_media(media.flags());

        let (events, inbox) = mpsc::unbounded_channel();
        let deliver = events.clone();
        let negotiator = Negotiator::new(
            factory,
            signaling.clone(),
            TransportConfig {
                ice_servers: config.ice_servers.clone(),
            },
            identity.room_id.clone(),
            identity.display_name.clone(),
            move |event| {
                let _ = deliver.send(SessionEvent::Peer(event));
            },
        );
        let metrics = MetricsCollector::new(
            identity.participant_id.clone(),
            signaling.clone(),
            config.metrics_interval,
            config.latency_source,
        );

        let forward = events.clone();
        tokio::spawn(async move {
            while let Some(event) = signaling_events.recv().await {
                if forward.send(SessionEvent::Signaling(event)).is_err() {
                    break;
                }
            }
        });

        let join = ClientMessage::Join {
            room_id: identity.room_id.clone(),
            participant_id: identity.participant_id.clone(),
            display_name: identity.display_name.clone(),
            video_enabled: media.flags().cam_enabled,
        };
        if let Err(e) = signaling.emit(join).await {
            media.stop();
            return Err(e.into());
        }
        info!(
            room_id = %identity.room_id,
            participant_id = %identity.participant_id,
            "Joining room"
        );

        let handle = SessionHandle {
            events: events.clone(),
            monitor: monitor.clone(),
            metrics: metrics.clone(),
            room_id: identity.room_id.clone(),
            participant_id: identity.participant_id.clone(),
        };

        let session = Session {
            identity,
            config,
            phase: Phase::Joining,
            signaling,
            negotiator,
            registry: PeerRegistry::new(),
            roster: Roster::new(),
            media,
            metrics,
            timer: None,
            monitor,
            events,
        };
        tokio::spawn(session.run(inbox));
        Ok(handle)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event).await;
            if self.phase == Phase::Left {
                break;
            }
        }
        debug!(room_id = %self.identity.room_id, "Session actor stopped");
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signaling(SignalingEvent::Connected) => {
                self.monitor.set_text(CONNECTED_TO_SERVER);
            }
            SessionEvent::Signaling(SignalingEvent::Disconnected) => {
                warn!("Signaling connection lost");
                self.monitor.set_text(DISCONNECTED_FROM_SERVER);
            }
            SessionEvent::Signaling(SignalingEvent::Message(message)) => self.route(message).await,
            SessionEvent::Peer(event) => self.on_peer_event(event).await,
            SessionEvent::Command(command) => self.on_command(command).await,
            SessionEvent::SendOffer {
                participant_id,
                generation,
            } => {
                if let Err(e) = self
                    .negotiator
                    .send_offer(&mut self.registry, &participant_id, generation)
                    .await
                {
                    self.report(NEGOTIATION_FAILED, &e);
                }
            }
            SessionEvent::Timer(TimerEvent::Warning { remaining }) => {
                info!(remaining_secs = remaining.as_secs(), "Session ending soon");
                self.monitor.notify(SessionNotice::TimeWarning { remaining });
            }
            SessionEvent::Timer(TimerEvent::Expired) => {
                info!("Session time limit reached");
                self.leave(ExitReason::Timeout).await;
            }
            SessionEvent::ScreenShareEnded { track_id } => {
                self.on_screen_share_ended(&track_id).await;
            }
        }
    }

    async fn route(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::UserJoined {
                users,
                is_initiator,
            } => self.on_roster(users, is_initiator).await,
            ServerMessage::UserReady {
                from_participant_id,
                display_name,
                ..
            } => self.on_user_ready(&from_participant_id, &display_name).await,
            ServerMessage::Offer {
                sdp,
                from_participant_id,
                display_name,
                ..
            } => self.on_offer(&from_participant_id, &display_name, sdp).await,
            ServerMessage::Answer {
                sdp,
                from_participant_id,
                display_name,
                ..
            } => {
                if let Err(e) = self
                    .negotiator
                    .handle_answer(&mut self.registry, &from_participant_id, &display_name, sdp)
                    .await
                {
                    self.report(NEGOTIATION_FAILED, &e);
                }
            }
            ServerMessage::IceCandidate {
                candidate,
                from_participant_id,
            } => {
                if let Err(e) = self
                    .negotiator
                    .handle_candidate(&mut self.registry, &from_participant_id, candidate)
                    .await
                {
                    self.report(CANDIDATE_FAILED, &e);
                }
            }
            ServerMessage::UserLeft {
                participant_id,
                display_name,
            } => self.on_user_left(&participant_id, &display_name).await,
            ServerMessage::MeetingEnded { .. } => self.leave(ExitReason::MeetingEnded).await,
            ServerMessage::AudioToggle {
                participant_id,
                enabled,
                display_name,
            } => self.on_remote_media(participant_id, display_name, MediaKind::Audio, enabled),
            ServerMessage::VideoToggle {
                participant_id,
                enabled,
                display_name,
            } => self.on_remote_media(participant_id, display_name, MediaKind::Video, enabled),
            ServerMessage::ScreenShareStart { display_name, .. } => {
                self.monitor.notify(SessionNotice::ScreenShare {
                    display_name,
                    active: true,
                });
            }
            ServerMessage::ScreenShareStop { display_name, .. } => {
                self.monitor.notify(SessionNotice::ScreenShare {
                    display_name,
                    active: false,
                });
            }
            ServerMessage::RoomFull => self.reject(RejectReason::RoomFull).await,
            ServerMessage::RoomNotFound => self.reject(RejectReason::RoomNotFound).await,
            ServerMessage::DuplicateJoin => self.reject(RejectReason::DuplicateJoin).await,
        }
    }

    async fn on_roster(&mut self, users: Vec<Participant>, is_initiator: bool) {
        let diff = self.roster.replace(users, &self.identity.participant_id);
        let offered = Role::from_initiator_flag(is_initiator);

        for id in &diff.added {
            self.registry.admit(id);
            let role = self.roster.assign_role(id, offered);
            if let Some(p) = self.roster.get(id) {
                self.monitor
                    .upsert_peer(id, &p.display_name, p.audio_enabled, p.video_enabled);
                info!(participant_id = %id, display_name = %p.display_name, %role, "Participant in room");
            }
        }
        for id in &diff.removed {
            self.close_peer(id).await;
            self.registry.dismiss(id);
            self.monitor.remove_peer(id);
        }

        if self.phase == Phase::Joining {
            self.phase = Phase::Joined;
            self.monitor.set_joined(true);
            let timer = SessionTimer::start(
                self.config.session_duration,
                self.config.session_warning,
                self.events.clone(),
            );
            self.monitor.follow_countdown(timer.subscribe());
            self.timer = Some(timer);
            self.metrics.start();
            info!(room_id = %self.identity.room_id, peers = self.roster.len(), "Joined room");
        }

        self.monitor.set_text(if self.roster.is_empty() {
            WAITING_FOR_PEER
        } else {
            PEER_FOUND
        });

        if !diff.added.is_empty() {
            self.broadcast(ClientMessage::UserReady {
                room_id: self.identity.room_id.clone(),
                display_name: self.identity.display_name.clone(),
            })
            .await;
        }
    }

    async fn on_user_ready(&mut self, from: &str, display_name: &str) {
        match self.roster.role(from) {
            Some(Role::Initiator) => {}
            Some(Role::Responder) => {
                debug!(participant_id = %from, "Peer ready, waiting for its offer");
                return;
            }
            None => {
                debug!(participant_id = %from, "Ready from unknown participant");
                return;
            }
        }
        if self.registry.contains(from) {
            debug!(participant_id = %from, "Already negotiating");
            return;
        }

        match self
            .negotiator
            .open_session(&mut self.registry, &self.media, from, Role::Initiator, display_name)
            .await
        {
            Ok(generation) => {
                self.track_transport(from);
                self.schedule_offer(from, generation);
            }
            Err(e) => self.report(NEGOTIATION_FAILED, &e),
        }
    }

    fn schedule_offer(&self, participant_id: &str, generation: u64) {
        let events = self.events.clone();
        let delay = self.config.offer_delay;
        let participant_id = participant_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::SendOffer {
                participant_id,
                generation,
            });
        });
    }

    async fn on_offer(&mut self, from: &str, display_name: &str, sdp: SessionDescription) {
        if !self.roster.contains(from) {
            self.roster.upsert(Participant::new(from, display_name));
            self.monitor.upsert_peer(from, display_name, true, true);
        }
        self.roster.assign_role(from, Role::Responder);
        self.registry.admit(from);

        let result = self
            .negotiator
            .handle_offer(&mut self.registry, &self.media, from, display_name, sdp)
            .await;
        self.track_transport(from);
        if let Err(e) = result {
            self.report(NEGOTIATION_FAILED, &e);
        }
    }

    async fn on_user_left(&mut self, participant_id: &str, display_name: &str) {
        info!(%participant_id, %display_name, "Participant left");
        self.close_peer(participant_id).await;
        self.registry.dismiss(participant_id);
        self.roster.remove(participant_id);
        self.monitor.remove_peer(participant_id);
        self.monitor.set_text(PEER_DISCONNECTED);
        self.monitor
            .notify(SessionNotice::Alert(format!("{display_name} has left the meeting")));
    }

    fn on_remote_media(
        &mut self,
        participant_id: String,
        display_name: String,
        kind: MediaKind,
        enabled: bool,
    ) {
        if participant_id == self.identity.participant_id {
            return;
        }
        self.roster.set_media(&participant_id, kind, enabled);
        self.monitor.set_peer_media(&participant_id, kind, enabled);
        self.monitor.notify(SessionNotice::RemoteMedia {
            participant_id,
            display_name,
            kind,
            enabled,
        });
    }

    async fn reject(&mut self, reason: RejectReason) {
        warn!(room_id = %self.identity.room_id, %reason, "Join rejected");
        self.leave(ExitReason::Rejected(reason)).await;
    }

    async fn on_peer_event(&mut self, peer_event: PeerEvent) {
        let PeerEvent {
            participant_id,
            generation,
            event,
        } = peer_event;
        let Some(session) = self.registry.current_mut(&participant_id, generation) else {
            debug!(%participant_id, generation, "Dropping event from a stale transport");
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.negotiator.send_candidate(&participant_id, candidate).await {
                    warn!(%participant_id, error = %e, "Failed to relay candidate");
                }
            }
            TransportEvent::RemoteTrack(kind) => {
                session.remote_track_bound = true;
                info!(%participant_id, %kind, "Remote track received");
            }
            TransportEvent::StateChanged(state) => {
                session.connection_state = state;
                if state == ConnectionState::Connected {
                    session.advance(NegotiationStep::TransportConnected);
                    info!(%participant_id, "Peer connected");
                }
                self.monitor.set_peer_connection(&participant_id, state);
                if let Some(text) = connection_state_text(state) {
                    self.monitor.set_text(text);
                }
                if state == ConnectionState::Closed {
                    self.close_peer(&participant_id).await;
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ToggleMicrophone(reply) => {
                let result = self.toggle_microphone().await;
                let _ = reply.send(result);
            }
            Command::ToggleCamera(reply) => {
                let result = self.toggle_camera().await;
                let _ = reply.send(result);
            }
            Command::ToggleScreenShare(reply) => {
                let result = self.toggle_screen_share().await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.leave(ExitReason::Manual).await;
                let _ = reply.send(());
            }
            Command::EndMeeting(reply) => {
                info!(room_id = %self.identity.room_id, "Ending meeting for everyone");
                self.broadcast(ClientMessage::EndMeeting {
                    room_id: self.identity.room_id.clone(),
                })
                .await;
                self.leave(ExitReason::MeetingEnded).await;
                let _ = reply.send(());
            }
            Command::Inspect(reply) => {
                let _ = reply.send(self.registry.views());
            }
        }
    }

    async fn toggle_microphone(&mut self) -> Result<bool> {
        let transports = self.registry.transports();
        let enabled = match self.media.toggle_microphone(&transports).await {
            Ok(enabled) => enabled,
            Err(e) => {
                self.report(UNEXPECTED_ERROR, &e);
                return Err(e);
            }
        };
        self.monitor.set_media(self.media.flags());
        self.broadcast(ClientMessage::AudioToggle {
            participant_id: self.identity.participant_id.clone(),
            enabled,
            display_name: self.identity.display_name.clone(),
        })
        .await;
        Ok(enabled)
    }

    async fn toggle_camera(&mut self) -> Result<bool> {
        let transports = self.registry.transports();
        let enabled = match self.media.toggle_camera(&transports).await {
            Ok(enabled) => enabled,
            Err(e) => {
                self.report(UNEXPECTED_ERROR, &e);
                return Err(e);
            }
        };
        self.monitor.set_media(self.media.flags());
        self.broadcast(ClientMessage::VideoToggle {
            participant_id: self.identity.participant_id.clone(),
            enabled,
            display_name: self.identity.display_name.clone(),
        })
        .await;
        Ok(enabled)
    }

    async fn toggle_screen_share(&mut self) -> Result<bool> {
        if self.media.flags().screen_share_active {
            return self.stop_screen_share().await.map(|_| false);
        }

        let transports = self.registry.transports();
        let track = match self.media.start_screen_share(&transports).await {
            Ok(track) => track,
            Err(e) => {
                self.report(UNEXPECTED_ERROR, &e);
                return Err(e);
            }
        };

        // The capture can also be ended from outside the client.
        let events = self.events.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = events.send(SessionEvent::ScreenShareEnded {
                track_id: track.id().to_string(),
            });
        });

        self.monitor.set_media(self.media.flags());
        self.broadcast(ClientMessage::ScreenShareStart {
            room_id: self.identity.room_id.clone(),
            display_name: self.identity.display_name.clone(),
        })
        .await;
        Ok(true)
    }

    async fn stop_screen_share(&mut self) -> Result<bool> {
        let transports = self.registry.transports();
        let stopped = self.media.stop_screen_share(&transports).await?;
        if stopped {
            self.monitor.set_media(self.media.flags());
            self.broadcast(ClientMessage::ScreenShareStop {
                room_id: self.identity.room_id.clone(),
                display_name: self.identity.display_name.clone(),
            })
            .await;
        }
        Ok(stopped)
    }

    async fn on_screen_share_ended(&mut self, track_id: &str) {
        let current = self
            .media
            .state()
            .and_then(|s| s.screen_stream.as_ref())
            .and_then(|s| s.first(MediaKind::Video));
        if !current.is_some_and(|t| t.id() == track_id) {
            return;
        }
        info!(%track_id, "Display capture ended");
        if let Err(e) = self.stop_screen_share().await {
            self.report(UNEXPECTED_ERROR, &e);
        }
    }

    /// The single exit path. Runs once; later triggers are no-ops.
    async fn leave(&mut self, reason: ExitReason) {
        if self.phase == Phase::Left {
            return;
        }
        self.phase = Phase::Left;
        info!(room_id = %self.identity.room_id, %reason, "Leaving room");

        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        self.metrics.stop();
        for mut session in self.registry.drain() {
            self.metrics.remove_transport(&session.participant_id);
            session.close().await;
        }
        self.media.stop();
        self.roster.clear();

        if matches!(reason, ExitReason::Manual | ExitReason::Timeout) {
            self.broadcast(ClientMessage::Leave {
                room_id: self.identity.room_id.clone(),
                display_name: self.identity.display_name.clone(),
            })
            .await;
        }
        self.signaling.disconnect().await;

        self.monitor.set_joined(false);
        self.monitor.clear_peers();
        self.monitor.set_media(MediaFlags::default());
        self.monitor.set_text(reason.to_string());
        self.monitor.exit(reason);
    }

    async fn close_peer(&mut self, participant_id: &str) {
        self.metrics.remove_transport(participant_id);
        if let Some(mut session) = self.registry.remove(participant_id) {
            session.close().await;
        }
    }

    fn track_transport(&self, participant_id: &str) {
        if let Some(session) = self.registry.get(participant_id) {
            self.metrics
                .add_transport(participant_id, session.transport.clone());
        }
    }

    async fn broadcast(&self, message: ClientMessage) {
        if !self.signaling.is_connected() {
            debug!(?message, "Not connected, dropping relay message");
            return;
        }
        if let Err(e) = self.signaling.emit(message).await {
            warn!(error = %e, "Failed to send relay message");
        }
    }

    /// Surface a failure without ending the session.
    fn report(&self, text: &str, err: &Error) {
        match err.category() {
            ErrorCategory::CapabilityAbsent | ErrorCategory::DeviceAccess => {
                warn!(error = %err, "Media device request failed");
                self.monitor.notify(SessionNotice::Alert(err.to_string()));
            }
            ErrorCategory::Negotiation => {
                warn!(error = %err, "Negotiation step failed");
                self.monitor.set_error(text, err);
            }
            ErrorCategory::RoomRejected | ErrorCategory::Unexpected => {
                error!(error = %err, "Unexpected session error");
                self.monitor.set_error(UNEXPECTED_ERROR, err);
            }
        }
    }
}

/// Cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    monitor: StatusMonitor,
    metrics: MetricsCollector,
    room_id: String,
    participant_id: String,
}

impl SessionHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::Command(command(tx)))
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Returns whether the microphone is now enabled.
    pub async fn toggle_microphone(&self) -> Result<bool> {
        self.request(Command::ToggleMicrophone).await?
    }

    pub async fn toggle_camera(&self) -> Result<bool> {
        self.request(Command::ToggleCamera).await?
    }

    /// Returns whether a share is now active.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.request(Command::ToggleScreenShare).await?
    }

    /// Leave the room. Safe to call any number of times.
    pub async fn leave(&self) {
        if self.request(Command::Leave).await.is_err() {
            debug!("Session already closed");
        }
    }

    /// End the meeting for every participant, then leave.
    pub async fn end_meeting(&self) -> Result<()> {
        self.request(Command::EndMeeting).await
    }

    pub async fn inspect(&self) -> Result<Vec<PeerView>> {
        self.request(Command::Inspect).await
    }

    pub fn status(&self) -> SessionStatus {
        self.monitor.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.monitor.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.monitor.notices()
    }

    pub fn metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics.subscribe()
    }

    pub fn report_freeze(&self, duration_ms: f64) {
        self.metrics.report_freeze(duration_ms);
    }

    pub fn report_audio_drop(&self, duration_ms: f64) {
        self.metrics.report_audio_drop(duration_ms);
    }

    pub fn update_resolution(&self, width: u32, height: u32) {
        self.metrics.update_resolution(width, height);
    }

    /// Resolves with the exit reason once the session has ended.
    pub async fn exited(&self) -> ExitReason {
        self.monitor.exited().await
    }
}
