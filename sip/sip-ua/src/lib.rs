#![deny(unsafe_code)]

//! SIP user agent built on `lark-sip-core`.
//!
//! The [`Agent`] owns the registration binding, the set of live
//! [`Dialog`](dialog::Dialog)s and their media sessions. The host drives
//! everything through [`Agent::tick`] and receives progress through its
//! [`AgentHandler`].

mod agent;
mod config;
mod dialog;
mod events;
mod registration;

pub use agent::Agent;
pub use config::{AgentConfig, MqttConfig, TransportType};
pub use dialog::{CallDirection, DialogId, DialogState};
pub use events::{AgentHandler, AgentState};

pub use media::{AudioCapture, AudioPlayback, MediaConfig, SessionStats, TransportMode};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] sip_core::Error),
    #[error(transparent)]
    Media(#[from] media::MediaError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("unknown dialog")]
    UnknownDialog,
    #[error("operation invalid in dialog state {0}")]
    InvalidDialogState(DialogState),
    #[error("invalid target uri")]
    InvalidTarget,
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
