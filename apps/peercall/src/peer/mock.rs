//! Scripted [`PeerConnection`] for exercising the negotiation controller
//! without a media stack.
//!
//! Descriptions are small JSON objects (`{"type": "offer", "sdp": "<label>-offer-1"}`)
//! and every successful `set_local_description` emits a configurable number of
//! local candidates, the way a real connection starts gathering.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use webrtc::ice_transport::ice_server::RTCIceServer;

use super::{LinkState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents};
use crate::error::CallError;
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Clone)]
pub struct MockPeerFactory {
    label: String,
    candidates_per_description: usize,
    reject_remote: Arc<AtomicBool>,
    peers: Arc<Mutex<Vec<Arc<MockPeer>>>>,
}

impl MockPeerFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            candidates_per_description: 0,
            reject_remote: Arc::new(AtomicBool::new(false)),
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates_per_description = count;
        self
    }

    /// Makes every later `set_remote_description` fail.
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.reject_remote.store(reject, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        ice_servers: &[RTCIceServer],
        media: &LocalMedia,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let index = self.peers.lock().len() + 1;
        let peer = Arc::new(MockPeer {
            label: format!("{}#{index}", self.label),
            candidates_per_description: self.candidates_per_description,
            reject_remote: Arc::clone(&self.reject_remote),
            events,
            ice_servers: ice_servers.len(),
            tracks: media.tracks().len(),
            signaling: Mutex::new(MockSignaling::Stable),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            descriptions: AtomicUsize::new(0),
            emitted: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockSignaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

pub struct MockPeer {
    label: String,
    candidates_per_description: usize,
    reject_remote: Arc<AtomicBool>,
    events: PeerEvents,
    ice_servers: usize,
    tracks: usize,
    signaling: Mutex<MockSignaling>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    descriptions: AtomicUsize,
    emitted: AtomicUsize,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn ice_server_count(&self) -> usize {
        self.ice_servers
    }

    pub fn track_count(&self) -> usize {
        self.tracks
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Surfaces one more local candidate, as late gathering would.
    pub fn emit_candidate(&self) -> IceCandidate {
        let n = self.emitted.fetch_add(1, Ordering::SeqCst) + 1;
        let candidate = IceCandidate(json!({
            "candidate": format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50_000 + n),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": self.label,
        }));
        self.events.emit(PeerEvent::LocalCandidate(candidate.clone()));
        candidate
    }

    pub fn emit_remote_track(&self, kind: &str) {
        self.events.emit(PeerEvent::RemoteTrack {
            id: format!("{}-{kind}", self.label),
            kind: kind.to_string(),
        });
    }

    pub fn emit_link_state(&self, state: LinkState) {
        self.events.emit(PeerEvent::ConnectionState(state));
    }

    fn describe(&self, kind: &str) -> SessionDescription {
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        SessionDescription(json!({
            "type": kind,
            "sdp": format!("{}-{kind}-{n}", self.label),
        }))
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::Description("peer connection is closed".into()));
        }
        Ok(())
    }
}

fn description_kind(desc: &SessionDescription) -> Result<&str, CallError> {
    desc.0
        .get("type")
        .and_then(|kind| kind.as_str())
        .ok_or_else(|| CallError::Description("description has no type".into()))
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        Ok(self.describe("offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        if *self.signaling.lock() != MockSignaling::HaveRemoteOffer {
            return Err(CallError::Description(
                "create_answer requires a remote offer".into(),
            ));
        }
        Ok(self.describe("answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        let next = {
            let signaling = *self.signaling.lock();
            match (description_kind(&desc)?, signaling) {
                ("offer", MockSignaling::Stable | MockSignaling::HaveLocalOffer) => {
                    MockSignaling::HaveLocalOffer
                }
                ("answer", MockSignaling::HaveRemoteOffer) => MockSignaling::Stable,
                (kind, state) => {
                    return Err(CallError::Description(format!(
                        "cannot apply local {kind} in {state:?}"
                    )));
                }
            }
        };
        *self.signaling.lock() = next;
        *self.local.lock() = Some(desc);
        for _ in 0..self.candidates_per_description {
            self.emit_candidate();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(CallError::Description("remote description rejected".into()));
        }
        let next = {
            let signaling = *self.signaling.lock();
            match (description_kind(&desc)?, signaling) {
                ("offer", MockSignaling::Stable | MockSignaling::HaveRemoteOffer) => {
                    MockSignaling::HaveRemoteOffer
                }
                ("answer", MockSignaling::HaveLocalOffer) => MockSignaling::Stable,
                (kind, state) => {
                    return Err(CallError::Description(format!(
                        "cannot apply remote {kind} in {state:?}"
                    )));
                }
            }
        };
        *self.signaling.lock() = next;
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        if self.remote.lock().is_none() {
            return Err(CallError::CandidateApply(
                "remote description not set".into(),
            ));
        }
        if candidate.0.get("candidate").is_none() {
            return Err(CallError::CandidateApply("missing candidate field".into()));
        }
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn close(&self) -> Result<(), CallError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
