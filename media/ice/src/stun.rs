use crate::{Candidate, IceCredentials, IceEvent};
use std::cmp::min;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun_types::{Class, Message, MessageBuilder, Method, TransactionId};

pub(crate) struct StunConfig {
    pub(crate) initial_rto: Duration,
    pub(crate) max_retransmits: u32,
    pub(crate) max_rto: Duration,
}

impl StunConfig {
    pub(crate) fn new() -> Self {
        Self {
            initial_rto: Duration::from_millis(250),
            // RFC 5389 default
            max_retransmits: 7,
            max_rto: Duration::from_secs(3),
        }
    }

    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let rto = self.initial_rto * 2u32.saturating_pow(attempts);

        min(rto, self.max_rto)
    }
}

pub(super) fn make_binding_request(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    local_candidate: &Candidate,
    is_controlling: bool,
    control_tie_breaker: u64,
    use_candidate: bool,
) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);

    let username = format!("{}:{}", remote_credentials.ufrag, local_credentials.ufrag);
    builder.username(&username);
    builder.priority(local_candidate.priority);

    if is_controlling {
        builder.ice_controlling(control_tie_breaker);
    } else {
        builder.ice_controlled(control_tie_breaker);
    }

    if use_candidate {
        builder.use_candidate();
    }

    builder.message_integrity(remote_credentials.pwd.as_bytes());
    builder.fingerprint();

    builder.finish()
}

pub(super) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    builder.xor_mapped_address(source);
    builder.message_integrity(local_credentials.pwd.as_bytes());
    builder.fingerprint();

    builder.finish()
}

pub(super) fn make_role_error(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
    is_controlling: bool,
    control_tie_breaker: u64,
) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);

    builder.error_code(487, "Role Conflict");

    if is_controlling {
        builder.ice_controlling(control_tie_breaker);
    } else {
        builder.ice_controlled(control_tie_breaker);
    }

    builder.xor_mapped_address(source);
    builder.message_integrity(local_credentials.pwd.as_bytes());
    builder.fingerprint();

    builder.finish()
}

/// Verify MESSAGE-INTEGRITY of an incoming STUN message.
///
/// Requests are integrity protected with our own password, responses with
/// the peer's password.
pub(crate) fn verify_integrity(
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    stun_msg: &Message,
) -> bool {
    let key = match stun_msg.class() {
        Class::Request | Class::Indication => &local_credentials.pwd,
        Class::Success | Class::Error => &remote_credentials.pwd,
    };

    stun_msg.verify_integrity(key.as_bytes())
}

/// Plain binding request towards a configured STUN server, used to discover
/// a server-reflexive candidate during gathering.
pub(crate) struct StunServerBinding {
    server: SocketAddr,
    state: StunServerBindingState,
}

enum StunServerBindingState {
    Waiting,
    InProgress {
        transaction_id: TransactionId,
        retransmit_at: Instant,
        retransmits: u32,
    },
    Completed,
}

impl StunServerBinding {
    pub(crate) fn new(server: SocketAddr) -> Self {
        Self {
            server,
            state: StunServerBindingState::Waiting,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self.state, StunServerBindingState::Completed)
    }

    pub(crate) fn poll(
        &mut self,
        now: Instant,
        config: &StunConfig,
        events: &mut std::collections::VecDeque<IceEvent>,
    ) {
        match &mut self.state {
            StunServerBindingState::Waiting => {
                let transaction_id = TransactionId::random();

                events.push_back(IceEvent::SendData {
                    data: make_plain_binding_request(transaction_id),
                    target: self.server,
                });

                self.state = StunServerBindingState::InProgress {
                    transaction_id,
                    retransmit_at: now + config.retransmit_delta(0),
                    retransmits: 0,
                };
            }
            StunServerBindingState::InProgress {
                transaction_id,
                retransmit_at,
                retransmits,
            } => {
                if *retransmit_at > now {
                    return;
                }

                if *retransmits >= config.max_retransmits {
                    log::debug!("gave up on STUN server {}", self.server);
                    self.state = StunServerBindingState::Completed;
                    return;
                }

                *retransmits += 1;
                *retransmit_at += config.retransmit_delta(*retransmits);

                events.push_back(IceEvent::SendData {
                    data: make_plain_binding_request(*transaction_id),
                    target: self.server,
                });
            }
            StunServerBindingState::Completed => {}
        }
    }

    pub(crate) fn wants_stun_response(&self, transaction_id: TransactionId) -> bool {
        match &self.state {
            StunServerBindingState::InProgress {
                transaction_id: expected,
                ..
            } => *expected == transaction_id,
            _ => false,
        }
    }

    /// Consume a binding response, returns the discovered reflexive address
    pub(crate) fn receive_stun_response(&mut self, msg: &Message) -> Option<SocketAddr> {
        self.state = StunServerBindingState::Completed;

        msg.xor_mapped_address()
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            StunServerBindingState::Waiting => Some(Duration::ZERO),
            StunServerBindingState::InProgress { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            StunServerBindingState::Completed => None,
        }
    }
}

fn make_plain_binding_request(transaction_id: TransactionId) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
    builder.fingerprint();
    builder.finish()
}
