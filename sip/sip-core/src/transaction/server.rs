use super::{TsxAction, TsxContext, TsxKey, TsxTimer, consts};
use bytes::Bytes;
use std::net::SocketAddr;

/// Non-INVITE server transaction (RFC 3261 section 17.2.2)
pub(crate) struct ServerTsx {
    /// Where responses go (derived from Via and the request source)
    destination: SocketAddr,
    state: State,
    last_response: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Trying,
    Proceeding,
    Completed,
}

impl ServerTsx {
    pub(crate) fn new(destination: SocketAddr) -> Self {
        Self {
            destination,
            state: State::Trying,
            last_response: None,
        }
    }

    pub(crate) fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// A retransmission of the request arrived
    pub(crate) fn retransmission(&mut self, ctx: &mut TsxContext<'_>) -> TsxAction {
        match self.state {
            // no response yet, absorb
            State::Trying => {}
            State::Proceeding | State::Completed => {
                if let Some(last_response) = &self.last_response {
                    ctx.send(last_response, self.destination);
                }
            }
        }

        TsxAction::Keep
    }

    /// Send a response created by the layer above
    pub(crate) fn respond(
        &mut self,
        key: &TsxKey,
        response_bytes: Bytes,
        is_final: bool,
        ctx: &mut TsxContext<'_>,
    ) -> TsxAction {
        if self.state == State::Completed {
            log::warn!("transaction {key} already answered, dropping response");
            return TsxAction::Keep;
        }

        ctx.send(&response_bytes, self.destination);
        self.last_response = Some(response_bytes);

        if !is_final {
            self.state = State::Proceeding;
            return TsxAction::Keep;
        }

        self.state = State::Completed;

        if ctx.reliable() {
            TsxAction::Remove
        } else {
            // linger to absorb request retransmissions
            ctx.scheduler
                .schedule(key.clone(), TsxTimer::J, consts::TIMEOUT);
            TsxAction::Keep
        }
    }

    pub(crate) fn timer(&mut self, timer: TsxTimer) -> TsxAction {
        match (timer, self.state) {
            (TsxTimer::J, State::Completed) => TsxAction::Remove,
            _ => TsxAction::Keep,
        }
    }
}
