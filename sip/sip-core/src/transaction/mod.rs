//! RFC 3261 transaction layer.
//!
//! Transactions are stored in a map keyed by [`TsxKey`] (branch parameter,
//! CSeq method and role). Retransmissions and timeouts run through the
//! timer service: each timer callback drops a `(key, timer)` token into an
//! intake queue which [`SipCore::tick`](crate::SipCore::tick) drains. The
//! token is re-validated against the map before anything fires, so a timer
//! racing a completed transaction is a no-op.

use crate::transport::Transport;
use crate::{BaseHeaders, CoreEvent, Error, Result};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::msg::{MessageLine, StatusLine};
use sip_types::{Headers, Method};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use timer::{TimerHandle, TimerService};

mod client;
mod client_inv;
mod server;
mod server_inv;

pub(crate) use client::ClientTsx;
pub(crate) use client_inv::ClientInvTsx;
pub(crate) use server::ServerTsx;
pub(crate) use server_inv::ServerInvTsx;

pub mod consts {
    use std::time::Duration;

    pub const T1: Duration = Duration::from_millis(500);
    pub const T2: Duration = Duration::from_secs(4);
    pub const T4: Duration = Duration::from_secs(5);

    /// Timer B / F / H / L: give up after 64*T1
    pub const TIMEOUT: Duration = Duration::from_secs(32);

    pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";
}

/// Role of the transaction, part of the matching key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Transaction matching key (RFC 3261 section 17.1.3 / 17.2.3)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TsxKey {
    branch: BytesStr,
    method: Method,
    role: Role,
}

impl TsxKey {
    /// Key for a new client transaction with a freshly generated branch
    pub fn client(method: Method) -> Self {
        Self::client_with_branch(generate_branch(), method)
    }

    /// Key for a client transaction reusing an existing branch. Needed for
    /// CANCEL, which must carry the branch of the INVITE it cancels.
    pub fn client_with_branch(branch: BytesStr, method: Method) -> Self {
        Self {
            branch,
            method: normalize_method(method),
            role: Role::Client,
        }
    }

    /// Derive the key a received message belongs to
    pub fn from_message_parts(line: &MessageLine, base_headers: &BaseHeaders) -> Result<Self> {
        let branch = base_headers.via[0]
            .branch()
            .cloned()
            .ok_or(Error::Header(sip_types::HeaderError::Malformed(
                sip_types::Name::Via,
            )))?;

        let (role, method) = match line {
            MessageLine::Request(line) => (Role::Server, line.method.clone()),
            MessageLine::Response(_) => (Role::Client, base_headers.cseq.method.clone()),
        };

        Ok(Self {
            branch,
            method: normalize_method(method),
            role,
        })
    }

    /// The INVITE server transaction a CANCEL refers to
    pub fn invite_sibling(&self) -> TsxKey {
        TsxKey {
            branch: self.branch.clone(),
            method: Method::Invite,
            role: Role::Server,
        }
    }

    pub fn branch(&self) -> &BytesStr {
        &self.branch
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

/// An ACK uses the branch of the INVITE it acknowledges, fold it onto the
/// INVITE key so the map lookup matches the server transaction
fn normalize_method(method: Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other,
    }
}

impl fmt::Display for TsxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}/{}", self.role, self.method, self.branch)
    }
}

pub(crate) fn generate_branch() -> BytesStr {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    consts::RFC3261_BRANCH_PREFIX
        .bytes()
        .chain(rand::rng().sample_iter(Alphanumeric).take(23))
        .map(char::from)
        .collect::<String>()
        .into()
}

/// Response received inside a client transaction
#[derive(Debug)]
pub struct TsxResponse {
    pub line: StatusLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

/// Retransmission / timeout timers (RFC 3261 section 17 naming)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TsxTimer {
    /// INVITE client retransmit
    A,
    /// INVITE client timeout
    B,
    /// Completed client INVITE linger
    D,
    /// Non-INVITE client retransmit
    E,
    /// Non-INVITE client timeout
    F,
    /// Server INVITE final response retransmit
    G,
    /// Server INVITE timeout waiting for ACK of a failure response
    H,
    /// Confirmed server INVITE linger
    I,
    /// Completed non-INVITE server linger
    J,
    /// Completed non-INVITE client linger
    K,
    /// Accepted server INVITE timeout waiting for ACK of a 2xx
    L,
    /// Accepted client INVITE linger (absorbs retransmitted 2xx)
    M,
}

pub(crate) type TimerIntake = Arc<Mutex<VecDeque<(TsxKey, TsxTimer)>>>;

/// Schedules transaction timers through the timer service
pub(crate) struct Scheduler {
    timers: TimerService,
    intake: TimerIntake,
}

impl Scheduler {
    pub(crate) fn new(timers: TimerService) -> Self {
        Self {
            timers,
            intake: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub(crate) fn intake(&self) -> TimerIntake {
        self.intake.clone()
    }

    pub(crate) fn schedule(&self, key: TsxKey, timer: TsxTimer, delay: Duration) -> TimerHandle {
        let intake = self.intake.clone();

        self.timers.start(delay, move || {
            intake.lock().push_back((key, timer));
        })
    }
}

/// What to do with a transaction after it handled input
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TsxAction {
    Keep,
    Remove,
}

pub(crate) enum TsxState {
    Client(ClientTsx),
    ClientInv(ClientInvTsx),
    Server(ServerTsx),
    ServerInv(ServerInvTsx),
}

/// Shared context handed into the transaction state machines
pub(crate) struct TsxContext<'c> {
    pub(crate) transport: &'c mut Transport,
    pub(crate) scheduler: &'c Scheduler,
    pub(crate) events: &'c mut VecDeque<CoreEvent>,
}

impl TsxContext<'_> {
    pub(crate) fn send(&mut self, bytes: &[u8], target: SocketAddr) {
        if let Err(e) = self.transport.send(bytes, target) {
            // best effort, the retransmission timers take over from here
            log::warn!("transaction send to {target} failed: {e}");
        }
    }

    pub(crate) fn reliable(&self) -> bool {
        self.transport.reliable()
    }
}

/// The set of live transactions
#[derive(Default)]
pub(crate) struct Transactions {
    map: HashMap<TsxKey, TsxState>,
}

impl Transactions {
    pub(crate) fn insert(&mut self, key: TsxKey, state: TsxState) {
        if self.map.insert(key.clone(), state).is_some() {
            log::error!("replaced an existing transaction {key}");
        }
    }

    pub(crate) fn contains(&self, key: &TsxKey) -> bool {
        self.map.contains_key(key)
    }

    pub(crate) fn get_mut(&mut self, key: &TsxKey) -> Option<&mut TsxState> {
        self.map.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &TsxKey) {
        if self.map.remove(key).is_some() {
            log::debug!("transaction {key} terminated");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Run `f` on the transaction and honor the returned action
    pub(crate) fn with<F>(&mut self, key: &TsxKey, ctx: &mut TsxContext<'_>, f: F) -> bool
    where
        F: FnOnce(&mut TsxState, &TsxKey, &mut TsxContext<'_>) -> TsxAction,
    {
        let Some(state) = self.map.get_mut(key) else {
            return false;
        };

        if f(state, key, ctx) == TsxAction::Remove {
            self.map.remove(key);
            log::debug!("transaction {key} terminated");
        }

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn branch_has_rfc3261_prefix() {
        let branch = generate_branch();

        assert!(branch.starts_with(consts::RFC3261_BRANCH_PREFIX));
        assert_eq!(branch.len(), consts::RFC3261_BRANCH_PREFIX.len() + 23);
    }

    #[test]
    fn ack_key_matches_invite_server_transaction() {
        let invite_key = TsxKey {
            branch: "z9hG4bKtest".into(),
            method: normalize_method(Method::Invite),
            role: Role::Server,
        };

        let ack_key = TsxKey {
            branch: "z9hG4bKtest".into(),
            method: normalize_method(Method::Ack),
            role: Role::Server,
        };

        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn cancel_sibling() {
        let cancel_key = TsxKey {
            branch: "z9hG4bKxyz".into(),
            method: Method::Cancel,
            role: Role::Server,
        };

        let sibling = cancel_key.invite_sibling();

        assert_eq!(sibling.method, Method::Invite);
        assert_eq!(sibling.branch, cancel_key.branch);
        assert_eq!(sibling.role, Role::Server);
    }
}
