pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod signaling;
pub mod telemetry;

pub use config::Config;
pub use error::CallError;
pub use negotiation::{CallEvent, CallHandle, CallStatus, Controller, NegotiationState};
pub use protocol::{ParticipantId, SignalingMessage};
pub use signaling::{ChannelState, ChannelStatus, SignalingChannel};
