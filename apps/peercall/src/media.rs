//! Outbound media tracks.
//!
//! Capture devices are outside this crate; a [`MediaSource`] only has to
//! produce tracks that can be attached to a peer connection. The controller
//! owns the resulting [`LocalMedia`] and is the only component that stops it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::CallError;

const STREAM_ID: &str = "peercall-local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

pub struct MediaTrack {
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, rtp: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            rtp,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.rtp.id()
    }

    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Returns `true` only for the call that actually stopped the track.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The set of local tracks shared between preview and the negotiation session.
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Stops every live track; returns how many were stopped by this call.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|track| track.stop()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, CallError>;
}

/// One Opus audio and one VP8 video sample track, no capture device behind them.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource {
    pub audio: bool,
    pub video: bool,
}

impl SyntheticMediaSource {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        if !self.audio && !self.video {
            return Err(CallError::MediaAcquisition(
                "no audio or video requested".into(),
            ));
        }
        let mut tracks = Vec::new();
        if self.audio {
            let rtp = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                STREAM_ID.to_owned(),
            ));
            tracks.push(MediaTrack::new(TrackKind::Audio, rtp));
        }
        if self.video {
            let rtp = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video".to_owned(),
                STREAM_ID.to_owned(),
            ));
            tracks.push(MediaTrack::new(TrackKind::Video, rtp));
        }
        tracing::debug!(target = "peercall::media", tracks = tracks.len(), "acquired local media");
        Ok(LocalMedia::new(tracks))
    }
}
