//! Seam between the negotiation controller and the real-time connection primitive.
//!
//! The controller only ever calls create-offer, create-answer, set-local,
//! set-remote, add-candidate and close. Everything the primitive reports back
//! arrives as a [`PeerEvent`] pushed through [`PeerEvents`]; implementations
//! must never call back into the controller directly.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::CallError;
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SessionDescription};

pub mod mock;
pub mod rtc;

pub use mock::{MockPeer, MockPeerFactory};
pub use rtc::RtcPeerFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { id: String, kind: String },
    ConnectionState(LinkState),
}

/// Callback handed to a peer connection at creation time.
#[derive(Clone)]
pub struct PeerEvents {
    emit: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl PeerEvents {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(PeerEvent) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.emit)(event);
    }
}

impl fmt::Debug for PeerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEvents").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    /// The applied local description, if any. May differ from what
    /// `create_*` returned once gathering has started.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[RTCIceServer],
        media: &LocalMedia,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}
