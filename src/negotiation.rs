//! Per-participant offer/answer/candidate exchange.
//!
//! ```text
//! initiator:  NEW -> OFFER_SENT -> ANSWER_RECEIVED -> CONNECTED
//! responder:  NEW -> OFFER_RECEIVED -> ANSWER_SENT -> CONNECTED
//! any state  -> CLOSED
//! ```
//!
//! Roles come from the relay. No glare resolution happens here.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::LocalMediaController;
use crate::registry::{PeerRegistry, PeerSession};
use crate::signaling::{ClientMessage, SignalingChannel};
use crate::transport::{
    IceCandidate, PeerEvent, SdpType, SessionDescription, TransportConfig, TransportEventSink,
    TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn from_initiator_flag(is_initiator: bool) -> Self {
        if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "Initiator"),
            Role::Responder => write!(f, "Receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerReceived,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    /// Our offer went out.
    OfferSent,
    /// A remote offer was applied.
    OfferApplied,
    /// Our answer went out.
    AnswerSent,
    /// The remote answer was applied.
    AnswerApplied,
    /// The transport reported a connected state.
    TransportConnected,
    Close,
}

impl NegotiationState {
    /// The state after `step`, or `None` when the step does not apply here.
    pub fn next(self, step: NegotiationStep) -> Option<NegotiationState> {
        use NegotiationState as S;
        use NegotiationStep as E;

        match (self, step) {
            (S::Closed, _) => None,
            (_, E::Close) => Some(S::Closed),
            (S::New, E::OfferSent) => Some(S::OfferSent),
            // A fresh offer may also restart a stalled or finished exchange.
            (S::New | S::OfferReceived | S::AnswerSent | S::Connected, E::OfferApplied) => {
                Some(S::OfferReceived)
            }
            (S::OfferReceived, E::AnswerSent) => Some(S::AnswerSent),
            (S::OfferSent, E::AnswerApplied) => Some(S::AnswerReceived),
            (S::AnswerReceived | S::AnswerSent, E::TransportConnected) => Some(S::Connected),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        self == NegotiationState::Closed
    }
}

/// Drives negotiation for every session in a [`PeerRegistry`].
///
/// Every method re-fetches its session by participant id after each
/// suspension point; a session that vanished in between is not an error.
pub struct Negotiator {
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    transport_config: TransportConfig,
    room_id: String,
    display_name: String,
    deliver: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl Negotiator {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        transport_config: TransportConfig,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
        deliver: impl Fn(PeerEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory,
            signaling,
            transport_config,
            room_id: room_id.into(),
            display_name: display_name.into(),
            deliver: Arc::new(deliver),
        }
    }

    /// Create a session with a new transport carrying the current local
    /// tracks. An existing session for the participant is kept as is.
    /// Returns the generation of the session in place.
    pub async fn open_session(
        &self,
        registry: &mut PeerRegistry,
        media: &LocalMediaController,
        participant_id: &str,
        role: Role,
        remote_display_name: &str,
    ) -> Result<u64> {
        if let Some(existing) = registry.get(participant_id) {
            return Ok(existing.generation());
        }
        if media.state().is_none() {
            return Err(Error::NoLocalStream);
        }

        let generation = registry.next_generation();
        let deliver = self.deliver.clone();
        let sink = TransportEventSink::new(participant_id, generation, move |event| deliver(event));
        let transport = self.factory.create(&self.transport_config, sink).await?;

        if let Err(e) = media.attach_to(transport.as_ref()).await {
            let _ = transport.close().await;
            return Err(e);
        }

        let session = PeerSession::new(
            participant_id,
            role,
            transport,
            remote_display_name,
            generation,
        );
        if let Some(mut stale) = registry.insert(session) {
            stale.close().await;
        }
        info!(%participant_id, %role, generation, "Peer session created");
        Ok(generation)
    }

    /// Generate and transmit the offer for a session still in `NEW`.
    pub async fn send_offer(
        &self,
        registry: &mut PeerRegistry,
        participant_id: &str,
        generation: u64,
    ) -> Result<()> {
        let transport = match registry.current_mut(participant_id, generation) {
            Some(s) if s.state == NegotiationState::New => s.transport.clone(),
            Some(s) => {
                debug!(%participant_id, state = ?s.state, "Offer no longer needed");
                return Ok(());
            }
            None => {
                debug!(%participant_id, generation, "Offer target is gone");
                return Ok(());
            }
        };

        let offer = transport
            .create_offer()
            .await
            .map_err(|e| Error::negotiation(participant_id, e))?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::negotiation(participant_id, e))?;

        let Some(session) = registry.current_mut(participant_id, generation) else {
            return Ok(());
        };
        session.advance(NegotiationStep::OfferSent);

        self.signaling
            .emit(ClientMessage::Offer {
                sdp: offer,
                to_participant_id: participant_id.to_string(),
                room_id: self.room_id.clone(),
                display_name: self.display_name.clone(),
            })
            .await?;
        debug!(%participant_id, "Offer sent");
        Ok(())
    }

    /// Apply a remote offer and answer it, creating a responder session
    /// first when none exists.
    pub async fn handle_offer(
        &self,
        registry: &mut PeerRegistry,
        media: &LocalMediaController,
        from: &str,
        display_name: &str,
        sdp: SessionDescription,
    ) -> Result<()> {
        if sdp.kind != SdpType::Offer {
            return Err(Error::negotiation(from, "expected an offer description"));
        }
        let generation = self
            .open_session(registry, media, from, Role::Responder, display_name)
            .await?;

        let Some(session) = registry.current_mut(from, generation) else {
            return Ok(());
        };
        // Both sides offering means the relay handed out conflicting roles.
        if session.state.next(NegotiationStep::OfferApplied).is_none() {
            warn!(participant_id = %from, state = ?session.state, "Rejecting offer that collides with ours");
            return Err(Error::negotiation(
                from,
                format!("offer not accepted in state {:?}", session.state),
            ));
        }
        session.remote_display_name = display_name.to_string();
        let transport = session.transport.clone();

        transport
            .set_remote_description(sdp)
            .await
            .map_err(|e| Error::negotiation(from, e))?;
        let Some(session) = registry.current_mut(from, generation) else {
            return Ok(());
        };
        session.mark_remote_description_applied();
        session.advance(NegotiationStep::OfferApplied);
        self.flush_candidates(registry, from, generation).await;

        let answer = transport
            .create_answer()
            .await
            .map_err(|e| Error::negotiation(from, e))?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::negotiation(from, e))?;

        let Some(session) = registry.current_mut(from, generation) else {
            return Ok(());
        };
        session.advance(NegotiationStep::AnswerSent);

        self.signaling
            .emit(ClientMessage::Answer {
                sdp: answer,
                to_participant_id: from.to_string(),
                room_id: self.room_id.clone(),
                display_name: self.display_name.clone(),
            })
            .await?;
        debug!(participant_id = %from, "Answer sent");
        Ok(())
    }

    /// Apply a remote answer. Answers that arrive outside `OFFER_SENT` are
    /// duplicates or late deliveries and are dropped.
    pub async fn handle_answer(
        &self,
        registry: &mut PeerRegistry,
        from: &str,
        display_name: &str,
        sdp: SessionDescription,
    ) -> Result<()> {
        let (transport, generation) = match registry.get_mut(from) {
            Some(s) if s.state == NegotiationState::OfferSent => {
                s.remote_display_name = display_name.to_string();
                (s.transport.clone(), s.generation())
            }
            Some(s) => {
                debug!(participant_id = %from, state = ?s.state, "Ignoring duplicate or late answer");
                return Ok(());
            }
            None => {
                debug!(participant_id = %from, "Ignoring answer without a session");
                return Ok(());
            }
        };

        transport
            .set_remote_description(sdp)
            .await
            .map_err(|e| Error::negotiation(from, e))?;

        let Some(session) = registry.current_mut(from, generation) else {
            return Ok(());
        };
        session.mark_remote_description_applied();
        session.advance(NegotiationStep::AnswerApplied);
        self.flush_candidates(registry, from, generation).await;
        Ok(())
    }

    /// Forward a trickled candidate, or hold it until its session has a
    /// remote description.
    pub async fn handle_candidate(
        &self,
        registry: &mut PeerRegistry,
        from: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let transport = match registry.get_mut(from) {
            None => {
                if registry.buffer_orphan(from, candidate) {
                    debug!(participant_id = %from, "Buffering candidate until its session opens");
                }
                return Ok(());
            }
            Some(s) if !s.has_remote_description() => {
                s.queue_candidate(candidate);
                return Ok(());
            }
            Some(s) => s.transport.clone(),
        };

        transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::negotiation(from, e))
    }

    /// Relay a candidate discovered by one of our transports.
    pub async fn send_candidate(&self, to: &str, candidate: IceCandidate) -> Result<()> {
        self.signaling
            .emit(ClientMessage::IceCandidate {
                candidate,
                to_participant_id: to.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn flush_candidates(&self, registry: &mut PeerRegistry, participant_id: &str, generation: u64) {
        let mut pending = registry.take_orphans(participant_id);
        let Some(session) = registry.current_mut(participant_id, generation) else {
            return;
        };
        pending.extend(session.take_pending_candidates());
        if pending.is_empty() {
            return;
        }

        let transport = session.transport.clone();
        debug!(%participant_id, count = pending.len(), "Flushing buffered candidates");
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(%participant_id, error = %e, "Buffered candidate rejected");
            }
        }
    }
}
