//! Peer registry: one [`PeerSession`] per remote participant.
//!
//! Sessions are addressed by participant id only. Code that awaits between
//! two registry accesses re-fetches by id (and generation) instead of holding
//! a reference across the suspension.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::negotiation::{NegotiationState, NegotiationStep, Role};
use crate::transport::{ConnectionState, IceCandidate, Transport};

/// Candidates held per participant while no description is in place.
pub const MAX_PENDING_CANDIDATES: usize = 64;

pub struct PeerSession {
    pub participant_id: String,
    pub role: Role,
    pub state: NegotiationState,
    pub transport: Arc<dyn Transport>,
    pub remote_display_name: String,
    pub remote_track_bound: bool,
    pub connection_state: ConnectionState,
    generation: u64,
    remote_description_applied: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerSession {
    pub fn new(
        participant_id: impl Into<String>,
        role: Role,
        transport: Arc<dyn Transport>,
        remote_display_name: impl Into<String>,
        generation: u64,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            role,
            state: NegotiationState::New,
            transport,
            remote_display_name: remote_display_name.into(),
            remote_track_bound: false,
            connection_state: ConnectionState::New,
            generation,
            remote_description_applied: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply a negotiation step; invalid steps are logged and ignored.
    pub fn advance(&mut self, step: NegotiationStep) -> bool {
        match self.state.next(step) {
            Some(next) => {
                debug!(
                    participant_id = %self.participant_id,
                    from = ?self.state,
                    to = ?next,
                    "Negotiation state changed"
                );
                self.state = next;
                true
            }
            None => {
                debug!(
                    participant_id = %self.participant_id,
                    state = ?self.state,
                    ?step,
                    "Ignoring negotiation step"
                );
                false
            }
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_applied
    }

    pub fn mark_remote_description_applied(&mut self) {
        self.remote_description_applied = true;
    }

    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
            warn!(participant_id = %self.participant_id, "Candidate buffer full, dropping candidate");
            return;
        }
        self.pending_candidates.push(candidate);
    }

    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    /// Move to `CLOSED` and close the transport. Idempotent.
    pub async fn close(&mut self) {
        self.advance(NegotiationStep::Close);
        self.connection_state = ConnectionState::Closed;
        if let Err(e) = self.transport.close().await {
            warn!(participant_id = %self.participant_id, error = %e, "Error closing transport");
        }
    }

    pub fn view(&self) -> PeerView {
        PeerView {
            participant_id: self.participant_id.clone(),
            role: self.role,
            state: self.state,
            remote_display_name: self.remote_display_name.clone(),
            remote_track_bound: self.remote_track_bound,
            connection_state: self.connection_state,
        }
    }
}

/// Read-only snapshot of a session for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    pub participant_id: String,
    pub role: Role,
    pub state: NegotiationState,
    pub remote_display_name: String,
    pub remote_track_bound: bool,
    pub connection_state: ConnectionState,
}

#[derive(Default)]
pub struct PeerRegistry {
    sessions: HashMap<String, PeerSession>,
    /// Room members that may still open a session with us.
    members: HashSet<String>,
    orphan_candidates: HashMap<String, Vec<IceCandidate>>,
    generation: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Store a session. A previous entry for the same participant is handed
    /// back so the caller can close it.
    pub fn insert(&mut self, session: PeerSession) -> Option<PeerSession> {
        self.sessions.insert(session.participant_id.clone(), session)
    }

    pub fn get(&self, participant_id: &str) -> Option<&PeerSession> {
        self.sessions.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(participant_id)
    }

    /// The session for `participant_id`, only if it is still the one with `generation`.
    pub fn current_mut(&mut self, participant_id: &str, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(participant_id)
            .filter(|s| s.generation == generation)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.sessions.contains_key(participant_id)
    }

    pub fn remove(&mut self, participant_id: &str) -> Option<PeerSession> {
        self.orphan_candidates.remove(participant_id);
        self.sessions.remove(participant_id)
    }

    /// Accept early candidates from `participant_id` until it is dismissed.
    pub fn admit(&mut self, participant_id: &str) {
        self.members.insert(participant_id.to_string());
    }

    /// Forget a participant that left the room, along with anything it sent early.
    pub fn dismiss(&mut self, participant_id: &str) {
        self.members.remove(participant_id);
        self.orphan_candidates.remove(participant_id);
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.members.clear();
        self.orphan_candidates.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.sessions.values().map(|s| s.transport.clone()).collect()
    }

    /// Hold a candidate that arrived before any session with its sender.
    /// Candidates from anyone outside the room are dropped. Returns whether
    /// the candidate was kept.
    pub fn buffer_orphan(&mut self, participant_id: &str, candidate: IceCandidate) -> bool {
        if !self.members.contains(participant_id) {
            debug!(%participant_id, "Dropping candidate from a participant outside the room");
            return false;
        }
        let queue = self
            .orphan_candidates
            .entry(participant_id.to_string())
            .or_default();
        if queue.len() >= MAX_PENDING_CANDIDATES {
            debug!(%participant_id, "Orphan candidate buffer full, dropping candidate");
            return false;
        }
        queue.push(candidate);
        true
    }

    pub fn take_orphans(&mut self, participant_id: &str) -> Vec<IceCandidate> {
        self.orphan_candidates
            .remove(participant_id)
            .unwrap_or_default()
    }

    pub fn views(&self) -> Vec<PeerView> {
        let mut views: Vec<_> = self.sessions.values().map(PeerSession::view).collect();
        views.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        views
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
