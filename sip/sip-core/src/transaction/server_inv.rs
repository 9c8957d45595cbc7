use super::{TsxAction, TsxContext, TsxKey, TsxTimer, consts};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// INVITE server transaction (RFC 3261 section 17.2.1 with the RFC 6026
/// `Accepted` state: 2xx responses are retransmitted here until the ACK
/// arrives)
pub(crate) struct ServerInvTsx {
    destination: SocketAddr,
    state: State,
    last_response: Option<Bytes>,
    retransmit_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Proceeding,
    Accepted,
    Completed,
    Confirmed,
}

impl ServerInvTsx {
    pub(crate) fn new(destination: SocketAddr) -> Self {
        Self {
            destination,
            state: State::Proceeding,
            last_response: None,
            retransmit_interval: consts::T1,
        }
    }

    pub(crate) fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// A retransmission of the INVITE arrived
    pub(crate) fn retransmission(&mut self, ctx: &mut TsxContext<'_>) -> TsxAction {
        if let Some(last_response) = &self.last_response {
            ctx.send(last_response, self.destination);
        }

        TsxAction::Keep
    }

    pub(crate) fn respond(
        &mut self,
        key: &TsxKey,
        response_bytes: Bytes,
        code: sip_types::StatusCode,
        ctx: &mut TsxContext<'_>,
    ) -> TsxAction {
        if self.state != State::Proceeding {
            log::warn!("transaction {key} already answered, dropping response");
            return TsxAction::Keep;
        }

        ctx.send(&response_bytes, self.destination);
        self.last_response = Some(response_bytes);

        if code.is_provisional() {
            return TsxAction::Keep;
        }

        if code.is_success() {
            // 2xx: retransmit until the ACK arrives end-to-end
            self.state = State::Accepted;

            if !ctx.reliable() {
                ctx.scheduler
                    .schedule(key.clone(), TsxTimer::G, self.retransmit_interval);
            }

            ctx.scheduler
                .schedule(key.clone(), TsxTimer::L, consts::TIMEOUT);
        } else {
            self.state = State::Completed;

            if !ctx.reliable() {
                ctx.scheduler
                    .schedule(key.clone(), TsxTimer::G, self.retransmit_interval);
            }

            ctx.scheduler
                .schedule(key.clone(), TsxTimer::H, consts::TIMEOUT);
        }

        TsxAction::Keep
    }

    /// The matching ACK arrived
    pub(crate) fn ack_received(&mut self, key: &TsxKey, ctx: &mut TsxContext<'_>) -> TsxAction {
        match self.state {
            State::Accepted => {
                // 2xx acknowledged, done
                TsxAction::Remove
            }
            State::Completed => {
                self.state = State::Confirmed;

                if ctx.reliable() {
                    TsxAction::Remove
                } else {
                    ctx.scheduler.schedule(key.clone(), TsxTimer::I, consts::T4);
                    TsxAction::Keep
                }
            }
            State::Proceeding | State::Confirmed => TsxAction::Keep,
        }
    }

    pub(crate) fn timer(
        &mut self,
        key: &TsxKey,
        timer: TsxTimer,
        ctx: &mut TsxContext<'_>,
    ) -> TsxAction {
        match (timer, self.state) {
            (TsxTimer::G, State::Accepted | State::Completed) => {
                if let Some(last_response) = &self.last_response {
                    ctx.send(last_response, self.destination);
                }

                self.retransmit_interval = (self.retransmit_interval * 2).min(consts::T2);
                ctx.scheduler
                    .schedule(key.clone(), TsxTimer::G, self.retransmit_interval);

                TsxAction::Keep
            }
            (TsxTimer::H, State::Completed) | (TsxTimer::L, State::Accepted) => {
                // no ACK was ever received
                ctx.events.push_back(crate::CoreEvent::TsxTimeout {
                    tsx_key: key.clone(),
                });

                TsxAction::Remove
            }
            (TsxTimer::I, State::Confirmed) => TsxAction::Remove,
            _ => TsxAction::Keep,
        }
    }
}
