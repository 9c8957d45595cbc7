use crate::dialog::{DialogId, DialogState};
use std::fmt;

/// Registration lifecycle of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Registering,
    Registered,
    RegisterFailed,
    Unregistering,
    Unregistered,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Registering => "registering",
            AgentState::Registered => "registered",
            AgentState::RegisterFailed => "register-failed",
            AgentState::Unregistering => "unregistering",
            AgentState::Unregistered => "unregistered",
        };

        f.write_str(name)
    }
}

/// Callbacks reported by [`Agent::tick`](crate::Agent::tick).
///
/// All methods default to no-ops; implement what the application cares
/// about. Callbacks fire on the thread running the tick.
pub trait AgentHandler {
    fn on_state_changed(&mut self, old: AgentState, new: AgentState) {
        let _ = (old, new);
    }

    fn on_register_result(&mut self, success: bool, code: u16, reason: &str) {
        let _ = (success, code, reason);
    }

    fn on_incoming_call(&mut self, dialog: DialogId, from: &str) {
        let _ = (dialog, from);
    }

    fn on_dialog_state_changed(&mut self, dialog: DialogId, old: DialogState, new: DialogState) {
        let _ = (dialog, old, new);
    }

    fn on_remote_sdp(&mut self, dialog: DialogId, sdp: &str) {
        let _ = (dialog, sdp);
    }

    fn on_error(&mut self, code: u16, message: &str) {
        let _ = (code, message);
    }
}

/// Buffered handler invocation, dispatched at the end of a tick
pub(crate) enum AgentEvent {
    StateChanged {
        old: AgentState,
        new: AgentState,
    },
    RegisterResult {
        success: bool,
        code: u16,
        reason: String,
    },
    IncomingCall {
        dialog: DialogId,
        from: String,
    },
    DialogStateChanged {
        dialog: DialogId,
        old: DialogState,
        new: DialogState,
    },
    RemoteSdp {
        dialog: DialogId,
        sdp: String,
    },
    Error {
        code: u16,
        message: String,
    },
}

pub(crate) fn dispatch(handler: &mut dyn AgentHandler, event: AgentEvent) {
    match event {
        AgentEvent::StateChanged { old, new } => handler.on_state_changed(old, new),
        AgentEvent::RegisterResult {
            success,
            code,
            reason,
        } => handler.on_register_result(success, code, &reason),
        AgentEvent::IncomingCall { dialog, from } => handler.on_incoming_call(dialog, &from),
        AgentEvent::DialogStateChanged { dialog, old, new } => {
            handler.on_dialog_state_changed(dialog, old, new)
        }
        AgentEvent::RemoteSdp { dialog, sdp } => handler.on_remote_sdp(dialog, &sdp),
        AgentEvent::Error { code, message } => handler.on_error(code, &message),
    }
}
