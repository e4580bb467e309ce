//! In-process stand-ins for devices, transports and the relay.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::media::{
    DeviceCapabilities, LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaKind,
    MediaStream,
};
use crate::room::Participant;
use crate::signaling::{ClientMessage, ServerMessage, SignalingChannel, SignalingError, SignalingEvent};
use crate::transport::{
    ConnectionState, IceCandidate, MediaSender, SessionDescription, Transport, TransportConfig,
    TransportError, TransportEvent, TransportEventSink, TransportFactory, TransportStats,
};

/// Poll `check` until it holds, panicking after a few (virtual) seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

struct DeviceState {
    denied: HashSet<MediaKind>,
    user_media: bool,
    display_capture: bool,
    issued: Vec<LocalTrack>,
}

/// Capture devices that always succeed unless told otherwise.
#[derive(Clone)]
pub struct FakeDevices {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                denied: HashSet::new(),
                user_media: true,
                display_capture: true,
                issued: Vec::new(),
            })),
        }
    }
}

impl FakeDevices {
    pub fn deny(&self, kind: MediaKind) {
        self.state.lock().unwrap().denied.insert(kind);
    }

    pub fn allow(&self, kind: MediaKind) {
        self.state.lock().unwrap().denied.remove(&kind);
    }

    pub fn disable_display_capture(&self) {
        self.state.lock().unwrap().display_capture = false;
    }

    pub fn disable_user_media(&self) {
        self.state.lock().unwrap().user_media = false;
    }

    /// Every track handed out so far.
    pub fn issued(&self) -> Vec<LocalTrack> {
        self.state.lock().unwrap().issued.clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    fn capabilities(&self) -> DeviceCapabilities {
        let state = self.state.lock().unwrap();
        DeviceCapabilities {
            user_media: state.user_media,
            display_capture: state.display_capture,
        }
    }

    async fn user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        let mut state = self.state.lock().unwrap();
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(MediaKind::Audio);
        }
        if constraints.video {
            kinds.push(MediaKind::Video);
        }
        if let Some(denied) = kinds.iter().find(|k| state.denied.contains(*k)) {
            return Err(MediaError::Denied(denied.to_string()));
        }
        let tracks: Vec<_> = kinds
            .into_iter()
            .map(|kind| LocalTrack::new(kind, format!("fake {kind}")))
            .collect();
        state.issued.extend(tracks.iter().cloned());
        Ok(MediaStream::with_tracks(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, MediaError> {
        let mut state = self.state.lock().unwrap();
        if !state.display_capture {
            return Err(MediaError::Unsupported("display capture".into()));
        }
        let track = LocalTrack::new(MediaKind::Video, "fake screen");
        state.issued.push(track.clone());
        Ok(MediaStream::with_tracks(vec![track]))
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    transports: Vec<(String, String, Arc<LoopbackTransport>)>,
    reject_next: HashSet<String>,
}

/// Connects loopback transports to each other by the id in their descriptions.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn factory(&self, owner: &str) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            owner: owner.to_string(),
        }
    }

    /// The most recent transport `owner` created towards `remote`.
    pub fn transport(&self, owner: &str, remote: &str) -> Option<Arc<LoopbackTransport>> {
        self.state
            .lock()
            .unwrap()
            .transports
            .iter()
            .rev()
            .find(|(o, r, _)| o == owner && r == remote)
            .map(|(_, _, t)| t.clone())
    }

    /// How many transports `owner` has created.
    pub fn created_by(&self, owner: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .transports
            .iter()
            .filter(|(o, _, _)| o == owner)
            .count()
    }

    /// Make the next remote description applied by any of `owner`'s
    /// transports fail.
    pub fn reject_next_remote_description(&self, owner: &str) {
        self.state.lock().unwrap().reject_next.insert(owner.to_string());
    }

    fn by_id(&self, id: u64) -> Option<Arc<LoopbackTransport>> {
        self.state
            .lock()
            .unwrap()
            .transports
            .iter()
            .find(|(_, _, t)| t.id == id)
            .map(|(_, _, t)| t.clone())
    }

    fn take_rejection(&self, owner: &str) -> bool {
        self.state.lock().unwrap().reject_next.remove(owner)
    }
}

pub struct LoopbackFactory {
    network: LoopbackNetwork,
    owner: String,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let remote = events.participant_id().to_string();
        let mut state = self.network.state.lock().unwrap();
        state.next_id += 1;
        let transport = Arc::new(LoopbackTransport {
            id: state.next_id,
            owner: self.owner.clone(),
            network: Some(self.network.clone()),
            sink: Some(events),
            state: Mutex::new(LinkState::default()),
        });
        state
            .transports
            .push((self.owner.clone(), remote, transport.clone()));
        Ok(transport)
    }
}

pub struct LoopbackSender {
    kind: MediaKind,
    track: Mutex<Option<LocalTrack>>,
    network: Option<LoopbackNetwork>,
    transport_id: u64,
}

impl LoopbackSender {
    /// Tell the connected far end that media of this kind started flowing.
    fn announce(&self) {
        let Some(owner) = self.network.as_ref().and_then(|n| n.by_id(self.transport_id)) else {
            return;
        };
        if let Some(peer) = owner.connected_peer() {
            peer.emit(TransportEvent::RemoteTrack(self.kind));
        }
    }
}

#[async_trait]
impl MediaSender for LoopbackSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn track(&self) -> Option<LocalTrack> {
        self.track.lock().unwrap().clone()
    }

    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), TransportError> {
        let filled = track.is_some();
        let was_empty = std::mem::replace(&mut *self.track.lock().unwrap(), track).is_none();
        if was_empty && filled {
            self.announce();
        }
        Ok(())
    }
}

struct LinkState {
    senders: Vec<Arc<LoopbackSender>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<u64>,
    remote_descriptions: usize,
    remote_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<MediaKind>,
    connection: ConnectionState,
    stats: TransportStats,
    closed: bool,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            local: None,
            remote: None,
            peer: None,
            remote_descriptions: 0,
            remote_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            connection: ConnectionState::New,
            stats: TransportStats::default(),
            closed: false,
        }
    }
}

/// A transport that "connects" once both ends hold each other's description.
pub struct LoopbackTransport {
    id: u64,
    owner: String,
    network: Option<LoopbackNetwork>,
    sink: Option<TransportEventSink>,
    state: Mutex<LinkState>,
}

impl LoopbackTransport {
    /// A transport attached to no network.
    pub fn detached() -> Self {
        Self {
            id: 0,
            owner: String::new(),
            network: None,
            sink: None,
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn remote_description_count(&self) -> usize {
        self.state.lock().unwrap().remote_descriptions
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().remote_candidates.clone()
    }

    /// Kinds of remote media this end has been told about, in order.
    pub fn remote_tracks(&self) -> Vec<MediaKind> {
        self.state.lock().unwrap().remote_tracks.clone()
    }

    pub fn set_stats(&self, stats: TransportStats) {
        self.state.lock().unwrap().stats = stats;
    }

    /// Whether some sender currently carries `track`.
    pub async fn sends(&self, track: &LocalTrack) -> bool {
        self.sender_tracks()
            .iter()
            .any(|(_, t)| t.as_ref().is_some_and(|t| t.same_track(track)))
    }

    pub async fn video_sender_track(&self) -> Option<LocalTrack> {
        self.sender_tracks()
            .into_iter()
            .find(|(kind, _)| *kind == MediaKind::Video)
            .and_then(|(_, t)| t)
    }

    fn sender_tracks(&self) -> Vec<(MediaKind, Option<LocalTrack>)> {
        let senders = self.state.lock().unwrap().senders.clone();
        senders
            .iter()
            .map(|s| (s.kind, s.track.lock().unwrap().clone()))
            .collect()
    }

    fn sending_kinds(&self) -> Vec<MediaKind> {
        self.sender_tracks()
            .into_iter()
            .filter(|(_, track)| track.is_some())
            .map(|(kind, _)| kind)
            .collect()
    }

    fn emit(&self, event: TransportEvent) {
        if let TransportEvent::RemoteTrack(kind) = &event {
            self.state.lock().unwrap().remote_tracks.push(*kind);
        }
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn connected_peer(&self) -> Option<Arc<LoopbackTransport>> {
        let peer = {
            let state = self.state.lock().unwrap();
            if state.closed || state.connection != ConnectionState::Connected {
                return None;
            }
            state.peer?
        };
        self.network.as_ref()?.by_id(peer)
    }

    fn new_sender(&self, kind: MediaKind, track: Option<LocalTrack>) -> Arc<LoopbackSender> {
        let sender = Arc::new(LoopbackSender {
            kind,
            track: Mutex::new(track),
            network: self.network.clone(),
            transport_id: self.id,
        });
        self.state.lock().unwrap().senders.push(sender.clone());
        sender
    }

    fn is_ready_for(&self, peer: u64) -> bool {
        let state = self.state.lock().unwrap();
        !state.closed
            && state.connection != ConnectionState::Connected
            && state.local.is_some()
            && state.remote.is_some()
            && state.peer == Some(peer)
    }

    fn mark_connected(&self) {
        self.state.lock().unwrap().connection = ConnectionState::Connected;
    }

    /// Connect both ends once each has applied the other's description.
    fn try_connect(&self) {
        let Some(network) = &self.network else {
            return;
        };
        let Some(peer_id) = self.state.lock().unwrap().peer else {
            return;
        };
        let Some(peer) = network.by_id(peer_id) else {
            return;
        };
        if !self.is_ready_for(peer_id) || !peer.is_ready_for(self.id) {
            return;
        }

        self.mark_connected();
        peer.mark_connected();
        for (end, other) in [(self, peer.as_ref()), (peer.as_ref(), self)] {
            end.emit(TransportEvent::StateChanged(ConnectionState::Connected));
            for kind in other.sending_kinds() {
                end.emit(TransportEvent::RemoteTrack(kind));
            }
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().unwrap().closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn MediaSender>, TransportError> {
        self.ensure_open()?;
        Ok(self.new_sender(track.kind(), Some(track.clone())))
    }

    async fn reserve_sender(&self, kind: MediaKind) -> Result<Arc<dyn MediaSender>, TransportError> {
        self.ensure_open()?;
        Ok(self.new_sender(kind, None))
    }

    async fn senders(&self) -> Vec<Arc<dyn MediaSender>> {
        self.state
            .lock()
            .unwrap()
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn MediaSender>)
            .collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("loopback {}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.state.lock().unwrap().remote.is_none() {
            return Err(TransportError::Rejected("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("loopback {}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().unwrap().local = Some(desc);
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(network) = &self.network {
            if network.take_rejection(&self.owner) {
                return Err(TransportError::Rejected("remote description rejected".into()));
            }
        }
        let peer = desc
            .sdp
            .strip_prefix("loopback ")
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::InvalidDescription(desc.sdp.clone()))?;
        {
            let mut state = self.state.lock().unwrap();
            state.remote = Some(desc);
            state.peer = Some(peer);
            state.remote_descriptions += 1;
        }
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(TransportError::Rejected("no remote description".into()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ensure_open()?;
        Ok(self.state.lock().unwrap().stats.clone())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    async fn close(&self) -> Result<(), TransportError> {
        let newly_closed = {
            let mut state = self.state.lock().unwrap();
            let newly_closed = !state.closed;
            state.closed = true;
            state.connection = ConnectionState::Closed;
            newly_closed
        };
        if newly_closed {
            self.emit(TransportEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Signaling channel that records what it is asked to send.
pub struct RecordingSignaling {
    sent: Mutex<Vec<ClientMessage>>,
    connected: AtomicBool,
}

impl Default for RecordingSignaling {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl RecordingSignaling {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn emit(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Member {
    participant: Participant,
    conn: u64,
}

#[derive(Default)]
struct RelayState {
    next_conn: u64,
    conns: HashMap<u64, mpsc::Sender<SignalingEvent>>,
    memberships: HashMap<u64, (String, String)>,
    rooms: HashMap<String, Vec<Member>>,
    ended_rooms: HashSet<String>,
    capacity: Option<usize>,
    metrics: Vec<ClientMessage>,
}

impl RelayState {
    fn send(&self, conn: u64, message: ServerMessage) {
        if let Some(tx) = self.conns.get(&conn) {
            let _ = tx.try_send(SignalingEvent::Message(message));
        }
    }

    fn send_to(&self, room_id: &str, participant_id: &str, message: ServerMessage) {
        if let Some(member) = self
            .rooms
            .get(room_id)
            .and_then(|m| m.iter().find(|m| m.participant.participant_id == participant_id))
        {
            self.send(member.conn, message);
        }
    }

    fn broadcast_others(&self, room_id: &str, except: u64, message: &ServerMessage) {
        for member in self.rooms.get(room_id).into_iter().flatten() {
            if member.conn != except {
                self.send(member.conn, message.clone());
            }
        }
    }

    fn leave(&mut self, conn: u64) {
        let Some((room_id, participant_id)) = self.memberships.remove(&conn) else {
            return;
        };
        let Some(members) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(index) = members.iter().position(|m| m.conn == conn) else {
            return;
        };
        let member = members.remove(index);
        let left = ServerMessage::UserLeft {
            participant_id,
            display_name: member.participant.display_name,
        };
        self.broadcast_others(&room_id, conn, &left);
    }

    fn handle(&mut self, conn: u64, message: ClientMessage) {
        let from = self.memberships.get(&conn).cloned();
        match message {
            ClientMessage::Join {
                room_id,
                participant_id,
                display_name,
                video_enabled,
            } => {
                if self.ended_rooms.contains(&room_id) {
                    self.send(conn, ServerMessage::RoomNotFound);
                    return;
                }
                let members = self.rooms.get(&room_id);
                let duplicate = members.is_some_and(|m| {
                    m.iter()
                        .any(|m| m.participant.participant_id == participant_id)
                });
                let full = self
                    .capacity
                    .is_some_and(|cap| members.map_or(0, Vec::len) >= cap);
                if duplicate {
                    self.send(conn, ServerMessage::DuplicateJoin);
                    return;
                }
                if full {
                    self.send(conn, ServerMessage::RoomFull);
                    return;
                }
                let mut participant = Participant::new(participant_id.clone(), display_name);
                participant.video_enabled = video_enabled;
                self.rooms
                    .entry(room_id.clone())
                    .or_default()
                    .push(Member { participant, conn });
                self.memberships
                    .insert(conn, (room_id.clone(), participant_id.clone()));

                let users: Vec<Participant> = self.rooms[&room_id]
                    .iter()
                    .map(|m| m.participant.clone())
                    .collect();
                for member in &self.rooms[&room_id] {
                    self.send(
                        member.conn,
                        ServerMessage::UserJoined {
                            users: users.clone(),
                            is_initiator: member.participant.participant_id == participant_id,
                        },
                    );
                }
            }
            ClientMessage::UserReady {
                room_id,
                display_name,
            } => {
                let Some((_, from)) = from else { return };
                let ready = ServerMessage::UserReady {
                    from_participant_id: from,
                    room_id: room_id.clone(),
                    display_name,
                };
                self.broadcast_others(&room_id, conn, &ready);
            }
            ClientMessage::Offer {
                sdp,
                to_participant_id,
                room_id,
                display_name,
            } => {
                let Some((_, from)) = from else { return };
                let offer = ServerMessage::Offer {
                    sdp,
                    from_participant_id: from,
                    room_id: room_id.clone(),
                    display_name,
                };
                self.send_to(&room_id, &to_participant_id, offer);
            }
            ClientMessage::Answer {
                sdp,
                to_participant_id,
                room_id,
                display_name,
            } => {
                let Some((_, from)) = from else { return };
                let answer = ServerMessage::Answer {
                    sdp,
                    from_participant_id: from,
                    room_id: room_id.clone(),
                    display_name,
                };
                self.send_to(&room_id, &to_participant_id, answer);
            }
            ClientMessage::IceCandidate {
                candidate,
                to_participant_id,
            } => {
                let Some((room_id, from)) = from else { return };
                let candidate = ServerMessage::IceCandidate {
                    candidate,
                    from_participant_id: from,
                };
                self.send_to(&room_id, &to_participant_id, candidate);
            }
            ClientMessage::Leave { .. } => self.leave(conn),
            ClientMessage::EndMeeting { room_id } => {
                let ended = ServerMessage::MeetingEnded {
                    room_id: room_id.clone(),
                };
                self.broadcast_others(&room_id, conn, &ended);
                if let Some(members) = self.rooms.remove(&room_id) {
                    for member in members {
                        self.memberships.remove(&member.conn);
                    }
                }
                self.ended_rooms.insert(room_id);
            }
            ClientMessage::AudioToggle {
                participant_id,
                enabled,
                display_name,
            } => {
                let Some((room_id, _)) = from else { return };
                let toggle = ServerMessage::AudioToggle {
                    participant_id,
                    enabled,
                    display_name,
                };
                self.broadcast_others(&room_id, conn, &toggle);
            }
            ClientMessage::VideoToggle {
                participant_id,
                enabled,
                display_name,
            } => {
                let Some((room_id, _)) = from else { return };
                let toggle = ServerMessage::VideoToggle {
                    participant_id,
                    enabled,
                    display_name,
                };
                self.broadcast_others(&room_id, conn, &toggle);
            }
            ClientMessage::ScreenShareStart {
                room_id,
                display_name,
            } => {
                let share = ServerMessage::ScreenShareStart {
                    room_id: room_id.clone(),
                    display_name,
                };
                self.broadcast_others(&room_id, conn, &share);
            }
            ClientMessage::ScreenShareStop {
                room_id,
                display_name,
            } => {
                let share = ServerMessage::ScreenShareStop {
                    room_id: room_id.clone(),
                    display_name,
                };
                self.broadcast_others(&room_id, conn, &share);
            }
            update @ ClientMessage::MetricsUpdate { .. } => self.metrics.push(update),
        }
    }
}

/// In-memory relay speaking the same protocol as the signaling server.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn with_capacity(capacity: usize) -> Self {
        let relay = Self::default();
        relay.state.lock().unwrap().capacity = Some(capacity);
        relay
    }

    pub fn connect(&self) -> (Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let _ = tx.try_send(SignalingEvent::Connected);
        let mut state = self.state.lock().unwrap();
        state.next_conn += 1;
        let conn = state.next_conn;
        state.conns.insert(conn, tx);
        let channel = RelayChannel {
            relay: self.clone(),
            conn,
            connected: AtomicBool::new(true),
        };
        (Arc::new(channel), rx)
    }

    /// Metrics updates received so far.
    pub fn metrics(&self) -> Vec<ClientMessage> {
        self.state.lock().unwrap().metrics.clone()
    }

    /// Simulate the relay dropping every connection.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, tx) in state.conns.drain() {
            let _ = tx.try_send(SignalingEvent::Disconnected);
        }
    }
}

struct RelayChannel {
    relay: LoopbackRelay,
    conn: u64,
    connected: AtomicBool,
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    async fn emit(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        let mut state = self.relay.state.lock().unwrap();
        if !state.conns.contains_key(&self.conn) {
            return Err(SignalingError::Closed);
        }
        state.handle(self.conn, message);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut state = self.relay.state.lock().unwrap();
            state.leave(self.conn);
            if let Some(tx) = state.conns.remove(&self.conn) {
                let _ = tx.try_send(SignalingEvent::Disconnected);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
