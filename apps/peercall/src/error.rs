use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling channel is not open: {0}")]
    ChannelNotReady(&'static str),
    #[error("timed out after {0:?} waiting for the signaling channel to open")]
    ChannelTimeout(Duration),
    #[error("a non-empty peer id is required to place a call")]
    InvalidTarget,
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("unexpected {kind} in state {state}")]
    StaleMessage { kind: &'static str, state: String },
    #[error("failed to apply remote candidate: {0}")]
    CandidateApply(String),
    #[error("local media unavailable: {0}")]
    MediaAcquisition(String),
    #[error("signaling transport failed: {0}")]
    Transport(String),
    #[error("signaling frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("call controller has stopped")]
    ControllerGone,
}

impl CallError {
    /// Stable label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::ChannelNotReady(_) => "channel_not_ready",
            CallError::ChannelTimeout(_) => "channel_timeout",
            CallError::InvalidTarget => "invalid_target",
            CallError::Description(_) => "description_error",
            CallError::StaleMessage { .. } => "stale_message",
            CallError::CandidateApply(_) => "candidate_apply_error",
            CallError::MediaAcquisition(_) => "media_acquisition_error",
            CallError::Transport(_) => "transport",
            CallError::Codec(_) => "codec",
            CallError::Config(_) => "config",
            CallError::ControllerGone => "controller_gone",
        }
    }
}
