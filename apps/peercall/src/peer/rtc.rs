//! [`PeerConnection`] backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use super::{LinkState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents};
use crate::error::CallError;
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[RTCIceServer],
        media: &LocalMedia,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| setup_error("register codecs", err))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| setup_error("register interceptors", err))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| setup_error("create peer connection", err))?,
        );

        for track in media.tracks() {
            let sender = pc
                .add_track(track.rtp_track())
                .await
                .map_err(|err| CallError::MediaAcquisition(format!("attach {}: {err}", track.id())))?;
            // RTCP has to be drained for the interceptors to make progress.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        install_handlers(&pc, events);
        tracing::debug!(
            target = "peercall::peer",
            ice_servers = ice_servers.len(),
            tracks = media.tracks().len(),
            "created webrtc peer connection"
        );
        Ok(Arc::new(RtcPeer { pc }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json().map(|init| serde_json::to_value(&init)) {
                Ok(Ok(value)) => events.emit(PeerEvent::LocalCandidate(IceCandidate(value))),
                Ok(Err(err)) => {
                    tracing::warn!(target = "peercall::peer", error = %err, "failed to encode local candidate")
                }
                Err(err) => {
                    tracing::warn!(target = "peercall::peer", error = %err, "failed to serialize local candidate")
                }
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                events.emit(PeerEvent::RemoteTrack {
                    id: track.id(),
                    kind: track.kind().to_string(),
                });
            })
        },
    ));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            let link = match state {
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => LinkState::New,
            };
            events.emit(PeerEvent::ConnectionState(link));
        })
    }));
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await.map_err(description_error)?;
        to_blob(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(description_error)?;
        to_blob(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = from_blob(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = from_blob(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)
            .map_err(|err| CallError::CandidateApply(err.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| CallError::CandidateApply(err.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        to_blob(&desc).ok()
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc
            .close()
            .await
            .map_err(|err| CallError::Transport(format!("close peer connection: {err}")))
    }
}

fn to_blob(desc: &RTCSessionDescription) -> Result<SessionDescription, CallError> {
    serde_json::to_value(desc)
        .map(SessionDescription)
        .map_err(|err| CallError::Description(err.to_string()))
}

/// Rebuilds through the typed constructors so the SDP is parsed before use.
fn from_blob(blob: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    let raw: RTCSessionDescription = serde_json::from_value(blob.0)
        .map_err(|err| CallError::Description(format!("malformed description: {err}")))?;
    let parsed = match raw.sdp_type {
        RTCSdpType::Offer => RTCSessionDescription::offer(raw.sdp),
        RTCSdpType::Answer => RTCSessionDescription::answer(raw.sdp),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(raw.sdp),
        other => {
            return Err(CallError::Description(format!(
                "unsupported description type {other}"
            )));
        }
    };
    parsed.map_err(description_error)
}

fn description_error(err: webrtc::Error) -> CallError {
    CallError::Description(err.to_string())
}

fn setup_error(step: &str, err: webrtc::Error) -> CallError {
    CallError::Transport(format!("{step}: {err}"))
}
