use super::{TsxAction, TsxContext, TsxKey, TsxResponse, TsxTimer, consts};
use crate::CoreEvent;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Non-INVITE client transaction (RFC 3261 section 17.1.2)
pub(crate) struct ClientTsx {
    request_bytes: Bytes,
    target: SocketAddr,
    state: State,
    /// Current timer E retransmit interval
    retransmit_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Trying,
    Proceeding,
    Completed,
}

impl ClientTsx {
    /// Send the serialized request and arm the timers
    pub(crate) fn send(
        key: &TsxKey,
        request_bytes: Bytes,
        target: SocketAddr,
        ctx: &mut TsxContext<'_>,
    ) -> Self {
        ctx.send(&request_bytes, target);

        if !ctx.reliable() {
            ctx.scheduler
                .schedule(key.clone(), TsxTimer::E, consts::T1);
        }

        ctx.scheduler
            .schedule(key.clone(), TsxTimer::F, consts::TIMEOUT);

        Self {
            request_bytes,
            target,
            state: State::Trying,
            retransmit_interval: consts::T1,
        }
    }

    pub(crate) fn receive(
        &mut self,
        key: &TsxKey,
        response: TsxResponse,
        ctx: &mut TsxContext<'_>,
    ) -> TsxAction {
        match self.state {
            State::Trying | State::Proceeding => {
                let code = response.line.code;

                ctx.events.push_back(CoreEvent::Response {
                    tsx_key: key.clone(),
                    response,
                });

                if code.is_provisional() {
                    self.state = State::Proceeding;
                    return TsxAction::Keep;
                }

                self.state = State::Completed;

                if ctx.reliable() {
                    TsxAction::Remove
                } else {
                    // linger to absorb retransmitted final responses
                    ctx.scheduler.schedule(key.clone(), TsxTimer::K, consts::T4);
                    TsxAction::Keep
                }
            }
            State::Completed => {
                // retransmitted final response, absorbed
                TsxAction::Keep
            }
        }
    }

    pub(crate) fn timer(
        &mut self,
        key: &TsxKey,
        timer: TsxTimer,
        ctx: &mut TsxContext<'_>,
    ) -> TsxAction {
        match (timer, self.state) {
            (TsxTimer::E, State::Trying | State::Proceeding) => {
                ctx.send(&self.request_bytes, self.target);

                self.retransmit_interval = (self.retransmit_interval * 2).min(consts::T2);
                ctx.scheduler
                    .schedule(key.clone(), TsxTimer::E, self.retransmit_interval);

                TsxAction::Keep
            }
            (TsxTimer::F, State::Trying | State::Proceeding) => {
                ctx.events
                    .push_back(CoreEvent::TsxTimeout { tsx_key: key.clone() });

                TsxAction::Remove
            }
            (TsxTimer::K, State::Completed) => TsxAction::Remove,
            _ => TsxAction::Keep,
        }
    }
}
