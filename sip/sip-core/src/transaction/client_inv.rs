use super::{TsxAction, TsxContext, TsxKey, TsxResponse, TsxTimer, consts};
use crate::{CoreEvent, Request};
use bytes::Bytes;
use sip_types::{Method, Name};
use std::net::SocketAddr;
use std::time::Duration;

/// INVITE client transaction (RFC 3261 section 17.1.1, with the RFC 6026
/// `Accepted` state so retransmitted 2xx responses reach the UA for
/// re-ACKing)
pub(crate) struct ClientInvTsx {
    /// The original request, kept to construct the ACK for failure
    /// responses
    request: Request,
    request_bytes: Bytes,
    target: SocketAddr,
    state: State,
    retransmit_interval: Duration,
    /// ACK built for the failure response, resent on retransmitted finals
    failure_ack: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Calling,
    Proceeding,
    Accepted,
    Completed,
}

impl ClientInvTsx {
    pub(crate) fn send(
        key: &TsxKey,
        request: Request,
        request_bytes: Bytes,
        target: SocketAddr,
        ctx: &mut TsxContext<'_>,
    ) -> Self {
        ctx.send(&request_bytes, target);

        if !ctx.reliable() {
            ctx.scheduler
                .schedule(key.clone(), TsxTimer::A, consts::T1);
        }

        ctx.scheduler
            .schedule(key.clone(), TsxTimer::B, consts::TIMEOUT);

        Self {
            request,
            request_bytes,
            target,
            state: State::Calling,
            retransmit_interval: consts::T1,
            failure_ack: None,
        }
    }

    pub(crate) fn receive(
        &mut self,
        key: &TsxKey,
        response: TsxResponse,
        ctx: &mut TsxContext<'_>,
    ) -> TsxAction {
        let code = response.line.code;

        match self.state {
            State::Calling | State::Proceeding => {
                if code.is_provisional() {
                    self.state = State::Proceeding;

                    ctx.events.push_back(CoreEvent::Response {
                        tsx_key: key.clone(),
                        response,
                    });

                    return TsxAction::Keep;
                }

                if code.is_success() {
                    // 2xx: the ACK is end-to-end and owned by the UA
                    self.state = State::Accepted;
                    ctx.scheduler
                        .schedule(key.clone(), TsxTimer::M, consts::TIMEOUT);

                    ctx.events.push_back(CoreEvent::Response {
                        tsx_key: key.clone(),
                        response,
                    });

                    return TsxAction::Keep;
                }

                // failure: the transaction ACKs on its own
                let ack = self.build_failure_ack(&response);
                ctx.send(&ack, self.target);
                self.failure_ack = Some(ack);

                self.state = State::Completed;

                ctx.events.push_back(CoreEvent::Response {
                    tsx_key: key.clone(),
                    response,
                });

                if ctx.reliable() {
                    TsxAction::Remove
                } else {
                    ctx.scheduler
                        .schedule(key.clone(), TsxTimer::D, consts::TIMEOUT);
                    TsxAction::Keep
                }
            }
            State::Accepted => {
                // retransmitted 2xx, hand up so the ACK is resent
                if code.is_success() {
                    ctx.events.push_back(CoreEvent::Response {
                        tsx_key: key.clone(),
                        response,
                    });
                }

                TsxAction::Keep
            }
            State::Completed => {
                // retransmitted failure, answer with the stored ACK
                if let Some(ack) = &self.failure_ack {
                    ctx.send(ack, self.target);
                }

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
            (TsxTimer::A, State::Calling) => {
                ctx.send(&self.request_bytes, self.target);

                self.retransmit_interval *= 2;
                ctx.scheduler
                    .schedule(key.clone(), TsxTimer::A, self.retransmit_interval);

                TsxAction::Keep
            }
            (TsxTimer::B, State::Calling | State::Proceeding) => {
                ctx.events
                    .push_back(CoreEvent::TsxTimeout { tsx_key: key.clone() });

                TsxAction::Remove
            }
            (TsxTimer::D, State::Completed) => TsxAction::Remove,
            (TsxTimer::M, State::Accepted) => TsxAction::Remove,
            _ => TsxAction::Keep,
        }
    }

    /// ACK for a non-2xx final response (RFC 3261 section 17.1.1.3): same
    /// branch and CSeq number as the INVITE, To copied from the response
    fn build_failure_ack(&self, response: &TsxResponse) -> Bytes {
        let mut ack = Request::new(Method::Ack, self.request.line.uri.clone());

        if let Some(via) = self.request.headers.get(&Name::Via) {
            ack.headers.insert(Name::Via, via);
        }

        self.request.headers.clone_into(&mut ack.headers, Name::From);
        ack.headers
            .insert(Name::To, response.base_headers.to.to_string());
        self.request
            .headers
            .clone_into(&mut ack.headers, Name::CallId);
        ack.headers.insert(
            Name::CSeq,
            format!("{} ACK", response.base_headers.cseq.cseq),
        );
        ack.headers.insert(Name::MaxForwards, "70");

        crate::core::print_request(&mut ack)
    }
}
