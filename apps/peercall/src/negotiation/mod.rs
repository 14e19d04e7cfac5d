//! The negotiation controller: owns at most one peer connection and drives
//! the offer/answer/candidate exchange over the signaling channel.
//!
//! Everything asynchronous (inbound frames, channel open/close, peer
//! callbacks) lands in one queue and is handled one event at a time by
//! whoever owns the [`Controller`], either directly through
//! [`Controller::process_next`] or via the [`CallHandle`] actor.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::error::CallError;
use crate::media::{LocalMedia, MediaSource};
use crate::peer::{LinkState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents};
use crate::protocol::{IceCandidate, ParticipantId, SessionDescription, SignalingMessage};
use crate::signaling::{ChannelEvent, ChannelState, ChannelStatus, Connector, SignalingChannel};

pub mod handle;
pub mod state;

pub use handle::{CallHandle, CallStatus};
pub use state::NegotiationState;

const NOTIFY_CAPACITY: usize = 64;

/// Notifications for a user interface.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Negotiation(NegotiationState),
    Channel(ChannelState),
    Joined,
    RemoteTrack { id: String, kind: String },
    Link(LinkState),
    RelayError(String),
    AnswerUndelivered { to: ParticipantId, reason: String },
}

/// Work item for the controller's queue.
#[derive(Debug)]
pub enum ControllerEvent {
    Channel(ChannelEvent),
    Peer { session: u64, event: PeerEvent },
}

struct Session {
    id: u64,
    peer: Arc<dyn PeerConnection>,
    state: NegotiationState,
    remote: Option<ParticipantId>,
    pending_candidates: Vec<IceCandidate>,
}

pub struct Controller {
    config: Config,
    channel: SignalingChannel,
    factory: Arc<dyn PeerConnectionFactory>,
    media_source: Arc<dyn MediaSource>,
    media: Option<Arc<LocalMedia>>,
    session: Option<Session>,
    next_session: u64,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    notify: broadcast::Sender<CallEvent>,
}

impl Controller {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn PeerConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        let channel = SignalingChannel::new(
            config.self_id.clone(),
            config.signal_url.clone(),
            connector,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel_events = events_tx.clone();
        channel.on_message(move |event| {
            let _ = channel_events.send(ControllerEvent::Channel(event));
        });
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);

        Self {
            config,
            channel,
            factory,
            media_source,
            media: None,
            session: None,
            next_session: 0,
            events_tx,
            events_rx,
            notify,
        }
    }

    pub fn self_id(&self) -> &ParticipantId {
        &self.config.self_id
    }

    pub fn state(&self) -> NegotiationState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(NegotiationState::Idle)
    }

    pub fn remote_peer(&self) -> Option<&ParticipantId> {
        self.session.as_ref().and_then(|session| session.remote.as_ref())
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// Local candidates waiting for the channel to open.
    pub fn deferred_candidates(&self) -> usize {
        self.session
            .as_ref()
            .map(|session| session.pending_candidates.len())
            .unwrap_or(0)
    }

    pub fn status(&self) -> CallStatus {
        CallStatus {
            self_id: self.config.self_id.clone(),
            negotiation: self.state(),
            channel: self.channel.status(),
            remote: self.remote_peer().cloned(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.notify.subscribe()
    }

    /// Opens the signaling channel if needed and waits for it.
    pub async fn connect(&mut self) -> Result<(), CallError> {
        if self.channel.state() == ChannelState::Closed {
            self.channel.connect();
            self.publish(CallEvent::Channel(ChannelState::Opening));
        }
        self.channel.await_ready(self.config.ready_timeout).await
    }

    /// Acquires local media once and shares it with every later caller.
    pub async fn local_media(&mut self) -> Result<Arc<LocalMedia>, CallError> {
        if let Some(media) = &self.media {
            return Ok(Arc::clone(media));
        }
        let media = Arc::new(self.media_source.acquire().await?);
        tracing::info!(
            target = "peercall::negotiation",
            tracks = media.tracks().len(),
            "local media ready"
        );
        self.media = Some(Arc::clone(&media));
        Ok(media)
    }

    pub async fn place_call(&mut self, target: impl Into<ParticipantId>) -> Result<(), CallError> {
        let target = target.into();
        if target.is_blank() {
            return Err(CallError::InvalidTarget);
        }
        tracing::info!(target = "peercall::negotiation", peer = %target, "placing call");

        if self.channel.state() == ChannelState::Closed {
            self.channel.connect();
            self.publish(CallEvent::Channel(ChannelState::Opening));
        }
        self.channel.await_ready(self.config.ready_timeout).await?;

        let peer = self.ensure_session().await?;
        self.set_remote(target.clone());
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.set_state(NegotiationState::HaveLocalOffer);

        let sdp = peer.local_description().await.unwrap_or(offer);
        self.channel.send(SignalingMessage::Offer {
            from: self.config.self_id.clone(),
            to: target.clone(),
            sdp,
        })?;
        tracing::info!(target = "peercall::negotiation", peer = %target, "offer sent");
        self.flush_pending_candidates();
        Ok(())
    }

    /// Handles the next queued event, waiting for one if necessary. The
    /// controller holds a sender itself, so the queue stays open for its
    /// whole lifetime.
    pub async fn process_next(&mut self) {
        if let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Handles everything already queued without waiting.
    pub async fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Channel(event) => self.handle_channel_event(event).await,
            ControllerEvent::Peer { session, event } => self.handle_peer_event(session, event),
        }
    }

    /// Tears everything down from any state. Safe to call repeatedly.
    pub async fn hangup(&mut self) {
        let had_session = self.session.is_some();
        if let Some(session) = self.session.take() {
            self.publish(CallEvent::Negotiation(NegotiationState::Closed));
            if !session.pending_candidates.is_empty() {
                tracing::debug!(
                    target = "peercall::negotiation",
                    session = session.id,
                    dropped = session.pending_candidates.len(),
                    "dropping deferred candidates"
                );
            }
            if let Err(err) = session.peer.close().await {
                tracing::warn!(
                    target = "peercall::negotiation",
                    session = session.id,
                    error = %err,
                    "peer connection close failed"
                );
            }
        }

        if let Some(media) = self.media.take() {
            let stopped = media.stop_all();
            tracing::debug!(target = "peercall::negotiation", stopped, "released local media");
        }

        let was_active = self.channel.state() != ChannelState::Closed;
        self.channel.close();
        if was_active {
            self.publish(CallEvent::Channel(ChannelState::Closed));
        }

        if had_session {
            self.publish(CallEvent::Negotiation(NegotiationState::Idle));
            tracing::info!(target = "peercall::negotiation", "call ended");
        }
    }

    async fn ensure_session(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        if let Some(session) = &self.session {
            return Ok(Arc::clone(&session.peer));
        }

        let media = self.local_media().await?;
        self.next_session += 1;
        let id = self.next_session;
        let queue = self.events_tx.clone();
        let events = PeerEvents::new(move |event| {
            let _ = queue.send(ControllerEvent::Peer { session: id, event });
        });
        let peer = self
            .factory
            .create(&self.config.ice_servers, &media, events)
            .await?;

        self.session = Some(Session {
            id,
            peer: Arc::clone(&peer),
            state: NegotiationState::Stable,
            remote: None,
            pending_candidates: Vec::new(),
        });
        tracing::debug!(target = "peercall::negotiation", session = id, "created negotiation session");
        self.publish(CallEvent::Negotiation(NegotiationState::Stable));
        Ok(peer)
    }

    fn set_state(&mut self, next: NegotiationState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == next {
            return;
        }
        tracing::debug!(
            target = "peercall::negotiation",
            session = session.id,
            from = %session.state,
            to = %next,
            "negotiation state changed"
        );
        session.state = next;
        self.publish(CallEvent::Negotiation(next));
    }

    fn set_remote(&mut self, remote: ParticipantId) {
        if let Some(session) = self.session.as_mut() {
            session.remote = Some(remote);
        }
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.notify.send(event);
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        let connection = event.connection();
        if connection != self.channel.connection_id() {
            tracing::debug!(
                target = "peercall::negotiation",
                connection,
                current = self.channel.connection_id(),
                "discarding event from retired connection"
            );
            return;
        }

        match event {
            ChannelEvent::Opened { .. } => {
                self.publish(CallEvent::Channel(ChannelState::Open));
                self.flush_pending_candidates();
            }
            ChannelEvent::Closed { .. } => {
                tracing::info!(target = "peercall::negotiation", connection, "signaling channel lost");
                self.publish(CallEvent::Channel(ChannelState::Closed));
            }
            ChannelEvent::Message { message, .. } => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: SignalingMessage) {
        if let Some(to) = message.recipient() {
            if *to != self.config.self_id {
                tracing::warn!(
                    target = "peercall::negotiation",
                    kind = message.kind(),
                    to = %to,
                    "ignoring message addressed to another participant"
                );
                return;
            }
        }

        match message {
            SignalingMessage::Joined => self.publish(CallEvent::Joined),
            SignalingMessage::Error { message } => {
                tracing::warn!(target = "peercall::negotiation", message = %message, "relay reported an error");
                self.publish(CallEvent::RelayError(message));
            }
            SignalingMessage::Join { from } => {
                tracing::debug!(target = "peercall::negotiation", from = %from, "ignoring join frame");
            }
            SignalingMessage::Offer { from, sdp, .. } => {
                if let Err(err) = self.handle_remote_offer(from.clone(), sdp).await {
                    tracing::warn!(
                        target = "peercall::negotiation",
                        from = %from,
                        error = %err,
                        kind = err.kind(),
                        "failed to answer remote offer"
                    );
                }
            }
            SignalingMessage::Answer { from, sdp, .. } => self.handle_remote_answer(from, sdp).await,
            SignalingMessage::Candidate {
                from, candidate, ..
            } => self.handle_remote_candidate(from, candidate).await,
        }
    }

    async fn handle_remote_offer(
        &mut self,
        from: ParticipantId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        tracing::info!(target = "peercall::negotiation", from = %from, "received offer");
        let peer = self.ensure_session().await?;
        // A rejected offer must not redirect the call in progress.
        peer.set_remote_description(sdp).await?;
        self.set_remote(from.clone());
        self.set_state(NegotiationState::HaveRemoteOffer);

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.set_state(NegotiationState::Stable);

        let sdp = peer.local_description().await.unwrap_or(answer);
        let delivered = match self.channel.await_ready(self.config.ready_timeout).await {
            Ok(()) => self.channel.send(SignalingMessage::Answer {
                from: self.config.self_id.clone(),
                to: from.clone(),
                sdp,
            }),
            Err(err) => Err(err),
        };
        match delivered {
            Ok(()) => {
                tracing::info!(target = "peercall::negotiation", to = %from, "answer sent");
                self.flush_pending_candidates();
            }
            Err(err) => {
                tracing::error!(
                    target = "peercall::negotiation",
                    to = %from,
                    error = %err,
                    "answer could not be delivered"
                );
                self.publish(CallEvent::AnswerUndelivered {
                    to: from,
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn handle_remote_answer(&mut self, from: ParticipantId, sdp: SessionDescription) {
        let state = self.state();
        let Some(session) = self
            .session
            .as_ref()
            .filter(|session| session.state == NegotiationState::HaveLocalOffer)
        else {
            let err = CallError::StaleMessage {
                kind: "answer",
                state: state.to_string(),
            };
            tracing::warn!(target = "peercall::negotiation", from = %from, error = %err, "ignoring answer");
            return;
        };
        if session.remote.as_ref() != Some(&from) {
            tracing::warn!(
                target = "peercall::negotiation",
                from = %from,
                expected = ?session.remote,
                "ignoring answer from unexpected peer"
            );
            return;
        }

        let peer = Arc::clone(&session.peer);
        match peer.set_remote_description(sdp).await {
            Ok(()) => {
                tracing::info!(target = "peercall::negotiation", from = %from, "answer applied");
                self.set_state(NegotiationState::Stable);
            }
            Err(err) => tracing::warn!(
                target = "peercall::negotiation",
                from = %from,
                error = %err,
                "failed to apply remote answer"
            ),
        }
    }

    async fn handle_remote_candidate(&mut self, from: ParticipantId, candidate: IceCandidate) {
        let Some(session) = &self.session else {
            tracing::debug!(
                target = "peercall::negotiation",
                from = %from,
                "dropping remote candidate; no session"
            );
            return;
        };
        let peer = Arc::clone(&session.peer);
        if let Err(err) = peer.add_ice_candidate(candidate).await {
            tracing::warn!(
                target = "peercall::negotiation",
                from = %from,
                error = %err,
                kind = err.kind(),
                "remote candidate rejected"
            );
        }
    }

    fn handle_peer_event(&mut self, session_id: u64, event: PeerEvent) {
        if self.session.as_ref().map(|session| session.id) != Some(session_id) {
            tracing::debug!(
                target = "peercall::negotiation",
                session = session_id,
                "discarding event from closed session"
            );
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            PeerEvent::RemoteTrack { id, kind } => {
                tracing::info!(target = "peercall::negotiation", track = %id, kind = %kind, "remote track arrived");
                self.publish(CallEvent::RemoteTrack { id, kind });
            }
            PeerEvent::ConnectionState(state) => {
                tracing::info!(target = "peercall::negotiation", state = %state, "peer connection state changed");
                self.publish(CallEvent::Link(state));
            }
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) {
        let open = self.channel.state() == ChannelState::Open;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(remote) = session.remote.clone() else {
            tracing::warn!(
                target = "peercall::negotiation",
                session = session.id,
                "local candidate undeliverable; no remote peer"
            );
            return;
        };

        if open {
            let message = SignalingMessage::Candidate {
                from: self.config.self_id.clone(),
                to: remote,
                candidate: candidate.clone(),
            };
            match self.channel.send(message) {
                Ok(()) => return,
                Err(err) => tracing::debug!(
                    target = "peercall::negotiation",
                    error = %err,
                    "channel closed under candidate send; deferring"
                ),
            }
        }
        session.pending_candidates.push(candidate);
        tracing::debug!(
            target = "peercall::negotiation",
            session = session.id,
            pending = session.pending_candidates.len(),
            "deferred local candidate until the channel opens"
        );
    }

    fn flush_pending_candidates(&mut self) {
        if self.channel.state() != ChannelState::Open {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(remote) = session.remote.clone() else {
            return;
        };
        if session.pending_candidates.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut session.pending_candidates);
        for (index, candidate) in pending.iter().enumerate() {
            let message = SignalingMessage::Candidate {
                from: self.config.self_id.clone(),
                to: remote.clone(),
                candidate: candidate.clone(),
            };
            if let Err(err) = self.channel.send(message) {
                tracing::warn!(
                    target = "peercall::negotiation",
                    error = %err,
                    remaining = pending.len() - index,
                    "candidate flush interrupted"
                );
                session.pending_candidates.extend_from_slice(&pending[index..]);
                return;
            }
        }
        tracing::debug!(
            target = "peercall::negotiation",
            session = session.id,
            flushed = pending.len(),
            "flushed deferred candidates"
        );
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(media) = self.media.take() {
            media.stop_all();
        }
    }
}
