#![deny(unreachable_pub, unsafe_code)]

//! sans-io implementation of an ICE agent.
//!
//! The agent is driven by three calls: [`IceAgent::receive`] for every
//! datagram arriving on the media socket, [`IceAgent::poll`] after the
//! duration returned by [`IceAgent::timeout`], and [`IceAgent::pop_event`]
//! until it returns `None`. All I/O is surfaced through
//! [`IceEvent::SendData`].
//!
//! RTP and RTCP are always multiplexed on a single component, so every
//! candidate and candidate pair belongs to component 1.

use rand::seq::IndexedRandom;
use sdp_types::{IceCandidate, UntaggedAddress};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use std::mem::take;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use stun::{StunConfig, StunServerBinding};
use stun_types::{Class, Message, TransactionId};

mod stun;

/// A datagram received on the media socket
pub struct ReceivedPkt {
    pub data: Vec<u8>,
    /// Source address of the datagram
    pub source: SocketAddr,
    /// Local address the datagram was received on
    pub destination: SocketAddr,
}

/// ICE related events emitted by the [`IceAgent`]
#[derive(Debug)]
pub enum IceEvent {
    GatheringStateChanged {
        old: IceGatheringState,
        new: IceGatheringState,
    },
    ConnectionStateChanged {
        old: IceConnectionState,
        new: IceConnectionState,
    },
    /// A nominated pair is usable, send media to `target`
    DiscoveredAddr { target: SocketAddr },
    /// Transmit `data` to `target` over the media socket
    SendData { data: Vec<u8>, target: SocketAddr },
}

/// State of gathering candidates from external STUN servers.
/// Without a configured STUN server this jumps straight to `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Connectivity state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IceConnectionState {
    /// No valid candidate pair could be found
    Failed,
    /// A previously working pair stopped responding
    Disconnected,
    /// Waiting for local & remote candidates
    New,
    /// Connectivity checks are running
    Checking,
    /// A nominated pair works
    Connected,
}

/// Credentials of an ICE agent, exchanged through SDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Generate random credentials from the ice-char set
    pub fn random() -> Self {
        const ICE_CHARS: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

        let mut rng = rand::rng();

        let mut sample = |len: usize| {
            (0..len)
                .map(|_| char::from(*ICE_CHARS.choose(&mut rng).expect("charset is not empty")))
                .collect::<String>()
        };

        Self {
            ufrag: sample(8),
            pwd: sample(24),
        }
    }
}

new_key_type!(
    struct LocalCandidateId;
    struct RemoteCandidateId;
);

#[derive(Debug, PartialEq, Clone, Copy, Hash)]
enum CandidateKind {
    Host = 126,
    PeerReflexive = 110,
    ServerReflexive = 100,
}

struct Candidate {
    addr: SocketAddr,
    kind: CandidateKind,
    priority: u32,
    foundation: String,
    /// Transport address checks for this candidate are sent from. Same as
    /// `addr` for host candidates.
    base: SocketAddr,
}

struct CandidatePair {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
    priority: u64,
    state: CandidatePairState,

    /// Nominated by the peer
    received_use_candidate: bool,
    /// Nominated by us
    nominated: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum CandidatePairState {
    Waiting,
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        target: SocketAddr,
    },
    Succeeded,
    Failed,
}

/// The ICE agent state machine
pub struct IceAgent {
    stun_config: StunConfig,
    stun_server: Vec<StunServerBinding>,

    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,

    pairs: Vec<CandidatePair>,
    triggered_check_queue: VecDeque<(LocalCandidateId, RemoteCandidateId)>,

    is_controlling: bool,
    /// lite agents never originate connectivity checks
    lite: bool,
    control_tie_breaker: u64,
    max_pairs: usize,

    gathering_state: IceGatheringState,
    connection_state: IceConnectionState,

    last_ta_trigger: Option<Instant>,

    /// STUN messages received before the remote credentials are known
    backlog: Vec<ReceivedPkt>,

    events: VecDeque<IceEvent>,
}

impl IceAgent {
    pub fn new(local_credentials: IceCredentials, is_controlling: bool, lite: bool) -> Self {
        IceAgent {
            stun_config: StunConfig::new(),
            stun_server: vec![],
            local_credentials,
            remote_credentials: None,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: Vec::new(),
            triggered_check_queue: VecDeque::new(),
            is_controlling,
            lite,
            control_tie_breaker: rand::random(),
            max_pairs: 100,
            gathering_state: IceGatheringState::New,
            connection_state: IceConnectionState::New,
            last_ta_trigger: None,
            backlog: vec![],
            events: VecDeque::new(),
        }
    }

    /// Set the remote credentials and candidates in one step, usually after
    /// receiving the peer's SDP
    pub fn set_remote_data(&mut self, credentials: IceCredentials, candidates: &[IceCandidate]) {
        self.remote_credentials = Some(credentials);

        for candidate in candidates {
            self.add_remote_candidate(candidate);
        }

        for pkt in take(&mut self.backlog) {
            self.receive(pkt);
        }
    }

    pub fn credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    /// Register a local host address. All non-loopback addresses of the
    /// host should be provided.
    pub fn add_host_addr(&mut self, addr: SocketAddr) {
        if addr.ip().is_unspecified() {
            return;
        }

        self.add_local_candidate(CandidateKind::Host, addr, addr);
    }

    /// Add a STUN server used to gather a server-reflexive candidate
    pub fn add_stun_server(&mut self, server: SocketAddr) {
        self.stun_server.push(StunServerBinding::new(server));
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering_state
    }

    pub fn connection_state(&self) -> IceConnectionState {
        self.connection_state
    }

    /// Remote address of the nominated candidate pair
    pub fn discovered_addr(&self) -> Option<SocketAddr> {
        self.pairs
            .iter()
            .find(|pair| pair.state == CandidatePairState::Succeeded && pair.nominated)
            .map(|pair| self.remote_candidates[pair.remote].addr)
    }

    fn add_local_candidate(&mut self, kind: CandidateKind, base: SocketAddr, addr: SocketAddr) {
        let already_exists = self
            .local_candidates
            .values()
            .any(|c| c.kind == kind && c.base == base && c.addr == addr);

        if already_exists {
            return;
        }

        log::debug!("add local candidate {kind:?} {addr}");

        let kind_preference = (kind as u32) << 24;

        let local_preference = self
            .local_candidates
            .values()
            .filter(|c| c.kind == kind)
            .count() as u32
            + local_preference_offset(kind);

        let priority = kind_preference + (local_preference << 8) + 255;

        self.local_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation: compute_foundation(kind, base.ip()),
            base,
        });

        self.form_pairs();
    }

    /// Add a peer candidate received through signaling
    pub fn add_remote_candidate(&mut self, candidate: &IceCandidate) {
        let kind = match candidate.typ.as_str() {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            _ => return,
        };

        if !candidate.transport.eq_ignore_ascii_case("udp") {
            return;
        }

        if candidate.component != 1 {
            log::debug!("discarding candidate of unsupported component {candidate:?}");
            return;
        }

        let Ok(priority) = u32::try_from(candidate.priority) else {
            log::warn!("candidate priority larger than u32::MAX");
            return;
        };

        let ip = match candidate.address {
            UntaggedAddress::Fqdn(..) => return,
            UntaggedAddress::IpAddress(ip) => ip,
        };

        let addr = SocketAddr::new(ip, candidate.port);

        self.remote_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation: candidate.foundation.to_string(),
            base: addr,
        });

        self.form_pairs();
    }

    fn form_pairs(&mut self) {
        for (local_id, local_candidate) in &self.local_candidates {
            for (remote_id, remote_candidate) in &self.remote_candidates {
                // remote peer-reflexive candidates are paired by the
                // triggered check path
                if remote_candidate.kind == CandidateKind::PeerReflexive {
                    continue;
                }

                let already_exists = self
                    .pairs
                    .iter()
                    .any(|pair| pair.local == local_id && pair.remote == remote_id);

                if already_exists {
                    continue;
                }

                // only pair matching address families
                match (local_candidate.addr.ip(), remote_candidate.addr.ip()) {
                    (IpAddr::V4(..), IpAddr::V4(..)) => {}
                    (IpAddr::V6(l), IpAddr::V6(r))
                        if l.is_unicast_link_local() == r.is_unicast_link_local() => {}
                    _ => continue,
                }

                Self::add_candidate_pair(
                    local_id,
                    local_candidate,
                    remote_id,
                    remote_candidate,
                    self.is_controlling,
                    &mut self.pairs,
                    false,
                );
            }
        }

        self.pairs.sort_unstable_by_key(|p| p.priority);
        self.prune_pairs();
    }

    fn add_candidate_pair(
        local_id: LocalCandidateId,
        local_candidate: &Candidate,
        remote_id: RemoteCandidateId,
        remote_candidate: &Candidate,
        is_controlling: bool,
        pairs: &mut Vec<CandidatePair>,
        received_use_candidate: bool,
    ) {
        if pairs
            .iter()
            .any(|p| p.local == local_id && p.remote == remote_id)
        {
            return;
        }

        let priority = pair_priority(local_candidate, remote_candidate, is_controlling);

        log::debug!(
            "add pair {}, priority={priority}",
            DisplayPair(local_candidate, remote_candidate)
        );

        pairs.push(CandidatePair {
            local: local_id,
            remote: remote_id,
            priority,
            state: CandidatePairState::Waiting,
            received_use_candidate,
            nominated: false,
        });

        pairs.sort_unstable_by_key(|p| p.priority);
    }

    fn recompute_pair_priorities(&mut self) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
                self.is_controlling,
            );
        }

        self.pairs.sort_unstable_by_key(|p| p.priority);
    }

    /// Drop the lowest priority pairs until `max_pairs` is reached
    fn prune_pairs(&mut self) {
        while self.pairs.len() > self.max_pairs {
            let pair = self.pairs.pop().expect("len > max_pairs");

            log::debug!(
                "pruned pair {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );
        }
    }

    /// Feed a received datagram into the agent
    pub fn receive(&mut self, pkt: ReceivedPkt) {
        let stun_msg = match Message::parse(pkt.data) {
            Ok(stun_msg) => stun_msg,
            Err(e) => {
                log::debug!("failed to parse stun message, {e}");
                return;
            }
        };

        match stun_msg.class() {
            Class::Request => self.receive_stun_request(stun_msg, pkt.source, pkt.destination),
            Class::Indication => { /* ignore */ }
            Class::Success => self.receive_stun_success(stun_msg, pkt.source, pkt.destination),
            Class::Error => self.receive_stun_error(stun_msg),
        }
    }

    fn backlog_pkt(&mut self, msg: Message, source: SocketAddr, destination: SocketAddr) {
        if self.backlog.len() < 64 {
            self.backlog.push(ReceivedPkt {
                data: msg.into_bytes(),
                source,
                destination,
            });
        }
    }

    fn receive_stun_success(&mut self, msg: Message, source: SocketAddr, destination: SocketAddr) {
        // STUN server bindings are checked first, their responses carry no
        // message integrity
        for stun_server_binding in &mut self.stun_server {
            if !stun_server_binding.wants_stun_response(msg.transaction_id()) {
                continue;
            }

            let Some(addr) = stun_server_binding.receive_stun_response(&msg) else {
                log::debug!("STUN server response without XOR-MAPPED-ADDRESS");
                return;
            };

            self.add_local_candidate(CandidateKind::ServerReflexive, destination, addr);
            return;
        }

        let Some(remote_credentials) = &self.remote_credentials else {
            self.backlog_pkt(msg, source, destination);
            return;
        };

        if !msg.check_fingerprint()
            || !stun::verify_integrity(&self.local_credentials, remote_credentials, &msg)
        {
            log::debug!("incoming stun success failed the integrity check, discarding");
            return;
        }

        let Some(pair_idx) = self.pairs.iter().position(|p| {
            matches!(&p.state, CandidatePairState::InProgress { transaction_id, .. }
                if *transaction_id == msg.transaction_id())
        }) else {
            log::debug!("failed to find transaction for STUN success, discarding");
            return;
        };

        let pair = &mut self.pairs[pair_idx];

        let CandidatePairState::InProgress { target, .. } = &pair.state else {
            unreachable!()
        };

        // source and destination of request and response must be symmetric
        if source == *target {
            log::debug!(
                "got success response for pair {} nominated={}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                ),
                pair.nominated,
            );

            if pair.nominated {
                let target = self.remote_candidates[pair.remote].addr;
                self.events.push_back(IceEvent::DiscoveredAddr { target });
            }

            pair.state = CandidatePairState::Succeeded;
        } else {
            pair.nominated = false;
            pair.state = CandidatePairState::Failed;
        }

        // a differing mapped address reveals a peer-reflexive local candidate
        let pair_local = self.pairs[pair_idx].local;

        if let Some(mapped_addr) = msg.xor_mapped_address()
            && mapped_addr != self.local_candidates[pair_local].addr
        {
            self.add_local_candidate(CandidateKind::PeerReflexive, destination, mapped_addr);
        }
    }

    fn receive_stun_error(&mut self, msg: Message) {
        let Some(remote_credentials) = &self.remote_credentials else {
            // errors before remote credentials are known are meaningless
            return;
        };

        if !msg.check_fingerprint()
            || !stun::verify_integrity(&self.local_credentials, remote_credentials, &msg)
        {
            log::debug!("incoming stun error failed the integrity check, discarding");
            return;
        }

        let Some(pair) = self.pairs.iter_mut().find(|p| {
            matches!(&p.state, CandidatePairState::InProgress { transaction_id, .. }
                if *transaction_id == msg.transaction_id())
        }) else {
            log::debug!("failed to find transaction for STUN error, discarding");
            return;
        };

        if let Some((number, reason)) = msg.error_code() {
            log::debug!("candidate pair failed with code={number}, reason={reason}");

            if number == 487 {
                // role conflict, switch roles and retry the pair
                if msg.ice_controlled().is_some() {
                    self.is_controlling = true;
                } else if msg.ice_controlling().is_some() {
                    self.is_controlling = false;
                }

                pair.state = CandidatePairState::Waiting;
                let retry = (pair.local, pair.remote);
                self.triggered_check_queue.push_back(retry);

                self.recompute_pair_priorities();
                return;
            }
        }

        pair.state = CandidatePairState::Failed;
    }

    fn receive_stun_request(&mut self, msg: Message, source: SocketAddr, destination: SocketAddr) {
        let Some(remote_credentials) = self.remote_credentials.clone() else {
            self.backlog_pkt(msg, source, destination);
            return;
        };

        if !msg.check_fingerprint()
            || !stun::verify_integrity(&self.local_credentials, &remote_credentials, &msg)
        {
            log::debug!("incoming stun request failed the integrity check, discarding");
            return;
        }

        let Some(priority) = msg.priority() else {
            log::debug!("incoming stun request without PRIORITY attribute");
            return;
        };

        let use_candidate = msg.use_candidate();

        // role conflict detection (RFC 8445 section 7.3.1.1)
        if self.is_controlling {
            if let Some(tie_breaker) = msg.ice_controlling() {
                if self.control_tie_breaker >= tie_breaker {
                    let response = stun::make_role_error(
                        msg.transaction_id(),
                        &self.local_credentials,
                        source,
                        true,
                        self.control_tie_breaker,
                    );

                    self.events.push_back(IceEvent::SendData {
                        data: response,
                        target: source,
                    });

                    return;
                } else {
                    self.is_controlling = false;
                    self.recompute_pair_priorities();
                }
            }
        } else if let Some(tie_breaker) = msg.ice_controlled() {
            if self.control_tie_breaker >= tie_breaker {
                let response = stun::make_role_error(
                    msg.transaction_id(),
                    &self.local_credentials,
                    source,
                    false,
                    self.control_tie_breaker,
                );

                self.events.push_back(IceEvent::SendData {
                    data: response,
                    target: source,
                });

                return;
            } else {
                self.is_controlling = true;
                self.recompute_pair_priorities();
            }
        }

        let Some(local_id) = self
            .local_candidates
            .iter()
            .find(|(_, c)| c.kind == CandidateKind::Host && c.addr == destination)
            .map(|(id, _)| id)
        else {
            log::warn!("no matching local candidate for incoming STUN request ({destination})");
            return;
        };

        let remote_id = match self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == source)
            .map(|(id, _)| id)
        {
            Some(remote_id) => remote_id,
            None => {
                // unknown source address, create a peer-reflexive candidate
                let peer_reflexive_id = self.remote_candidates.insert(Candidate {
                    addr: source,
                    kind: CandidateKind::PeerReflexive,
                    priority,
                    foundation: "~".into(),
                    base: source,
                });

                Self::add_candidate_pair(
                    local_id,
                    &self.local_candidates[local_id],
                    peer_reflexive_id,
                    &self.remote_candidates[peer_reflexive_id],
                    self.is_controlling,
                    &mut self.pairs,
                    false,
                );

                self.triggered_check_queue
                    .push_back((local_id, peer_reflexive_id));

                peer_reflexive_id
            }
        };

        let pair = self
            .pairs
            .iter_mut()
            .find(|p| p.local == local_id && p.remote == remote_id)
            .expect("local_id & remote_id are valid");

        pair.received_use_candidate = use_candidate;

        // lite agents never send their own checks, a received check is the
        // only proof of connectivity they get
        if self.lite && !matches!(pair.state, CandidatePairState::Succeeded) {
            pair.state = CandidatePairState::Succeeded;
        }

        let response =
            stun::make_success_response(msg.transaction_id(), &self.local_credentials, source);

        self.events.push_back(IceEvent::SendData {
            data: response,
            target: source,
        });

        if use_candidate {
            self.poll_nomination();
        }
    }

    /// Drive the agent forward. Must be called after the duration returned
    /// by [`timeout`](IceAgent::timeout).
    pub fn poll(&mut self, now: Instant) {
        for stun_server_binding in &mut self.stun_server {
            stun_server_binding.poll(now, &self.stun_config, &mut self.events);
        }

        self.poll_retransmit(now);
        self.poll_state();
        self.poll_nomination();

        let Some(remote_credentials) = &self.remote_credentials else {
            return;
        };

        // lite agents only answer checks
        if self.lite {
            return;
        }

        // limit new checks to 1 per 50ms
        if let Some(it) = self.last_ta_trigger
            && it + Duration::from_millis(50) > now
        {
            return;
        }
        self.last_ta_trigger = Some(now);

        // triggered checks take precedence over the regular check order
        let pair = self
            .triggered_check_queue
            .pop_front()
            .and_then(|(local_id, remote_id)| {
                self.pairs
                    .iter_mut()
                    .find(|p| p.local == local_id && p.remote == remote_id)
            });

        let pair = match pair {
            Some(pair) => Some(pair),
            None => self
                .pairs
                .iter_mut()
                .find(|p| p.state == CandidatePairState::Waiting),
        };

        let Some(pair) = pair else {
            return;
        };

        log::debug!(
            "start connectivity check for pair {}",
            DisplayPair(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote]
            )
        );

        let transaction_id = TransactionId::random();

        let stun_request = stun::make_binding_request(
            transaction_id,
            &self.local_credentials,
            remote_credentials,
            &self.local_candidates[pair.local],
            self.is_controlling,
            self.control_tie_breaker,
            pair.nominated,
        );

        let target = self.remote_candidates[pair.remote].addr;

        pair.state = CandidatePairState::InProgress {
            transaction_id,
            stun_request: stun_request.clone(),
            retransmit_at: now + self.stun_config.retransmit_delta(0),
            retransmits: 0,
            target,
        };

        self.events.push_back(IceEvent::SendData {
            data: stun_request,
            target,
        });
    }

    /// Check all in-progress connectivity checks for pending retransmits
    fn poll_retransmit(&mut self, now: Instant) {
        for pair in &mut self.pairs {
            let CandidatePairState::InProgress {
                stun_request,
                retransmit_at,
                retransmits,
                target,
                ..
            } = &mut pair.state
            else {
                continue;
            };

            if *retransmit_at > now {
                continue;
            }

            if *retransmits >= self.stun_config.max_retransmits {
                pair.state = CandidatePairState::Failed;
                continue;
            }

            *retransmits += 1;
            *retransmit_at += self.stun_config.retransmit_delta(*retransmits);

            self.events.push_back(IceEvent::SendData {
                data: stun_request.clone(),
                target: *target,
            });
        }
    }

    fn poll_state(&mut self) {
        // gathering is complete once every STUN server binding finished
        let all_completed = self.stun_server.iter().all(StunServerBinding::is_completed);

        if all_completed && self.gathering_state != IceGatheringState::Complete {
            self.events.push_back(IceEvent::GatheringStateChanged {
                old: self.gathering_state,
                new: IceGatheringState::Complete,
            });

            self.gathering_state = IceGatheringState::Complete;
        } else if !all_completed && self.gathering_state != IceGatheringState::Gathering {
            self.events.push_back(IceEvent::GatheringStateChanged {
                old: self.gathering_state,
                new: IceGatheringState::Gathering,
            });

            self.gathering_state = IceGatheringState::Gathering;
        }

        let has_nomination = self
            .pairs
            .iter()
            .any(|p| p.nominated && matches!(p.state, CandidatePairState::Succeeded));

        let still_possible = self.pairs.iter().any(|p| {
            matches!(
                p.state,
                CandidatePairState::Waiting | CandidatePairState::InProgress { .. }
            )
        });

        if has_nomination {
            if self.connection_state != IceConnectionState::Connected {
                self.set_connection_state(IceConnectionState::Connected);
            }
        } else if still_possible || self.pairs.is_empty() {
            match self.connection_state {
                IceConnectionState::New if !self.pairs.is_empty() => {
                    self.set_connection_state(IceConnectionState::Checking);
                }
                IceConnectionState::Connected => {
                    self.set_connection_state(IceConnectionState::Disconnected);
                }
                _ => {}
            }
        } else {
            self.set_connection_state(IceConnectionState::Failed);
        }
    }

    fn set_connection_state(&mut self, new: IceConnectionState) {
        if self.connection_state != new {
            self.events.push_back(IceEvent::ConnectionStateChanged {
                old: self.connection_state,
                new,
            });
            self.connection_state = new;
        }
    }

    /// Progress the nomination state of the agent
    fn poll_nomination(&mut self) {
        if self.pairs.iter().any(|p| p.nominated) {
            return;
        }

        if self.is_controlling {
            let best_pair = self
                .pairs
                .iter_mut()
                .filter(|p| matches!(p.state, CandidatePairState::Succeeded))
                .max_by_key(|p| p.priority);

            let Some(pair) = best_pair else {
                return;
            };

            log::debug!(
                "nominating {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );

            pair.nominated = true;

            // re-check with use-candidate as soon as possible
            let nominate = (pair.local, pair.remote);
            self.triggered_check_queue.push_front(nominate);
        } else {
            // find the best succeeded pair the peer nominated
            let pair = self
                .pairs
                .iter_mut()
                .filter(|p| {
                    p.received_use_candidate && matches!(p.state, CandidatePairState::Succeeded)
                })
                .max_by_key(|p| p.priority);

            let Some(pair) = pair else {
                return;
            };

            log::debug!(
                "using pair {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );

            pair.nominated = true;

            let target = self.remote_candidates[pair.remote].addr;
            self.events.push_back(IceEvent::DiscoveredAddr { target });
        }
    }

    /// Next event to process. Must be called until it returns `None`.
    pub fn pop_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    /// Duration after which to call [`poll`](IceAgent::poll)
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let ta = if self.remote_credentials.is_some() && !self.lite {
            Some(
                self.last_ta_trigger
                    .map(|it| {
                        (it + Duration::from_millis(50))
                            .checked_duration_since(now)
                            .unwrap_or_default()
                    })
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        let stun_bindings = self.stun_server.iter().filter_map(|b| b.timeout(now)).min();

        let retransmits = self
            .pairs
            .iter()
            .filter_map(|p| match &p.state {
                CandidatePairState::InProgress { retransmit_at, .. } => {
                    Some(retransmit_at.saturating_duration_since(now))
                }
                _ => None,
            })
            .min();

        [ta, stun_bindings, retransmits].into_iter().flatten().min()
    }

    /// All gathered local candidates, excluding peer-reflexive ones
    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates
            .values()
            .filter(|c| matches!(c.kind, CandidateKind::Host | CandidateKind::ServerReflexive))
            .map(|c| {
                let rel_addr = (c.kind == CandidateKind::ServerReflexive).then_some(c.base);

                IceCandidate {
                    foundation: c.foundation.clone().into(),
                    component: 1,
                    transport: "UDP".into(),
                    priority: c.priority.into(),
                    address: UntaggedAddress::IpAddress(c.addr.ip()),
                    port: c.addr.port(),
                    typ: match c.kind {
                        CandidateKind::Host => "host".into(),
                        CandidateKind::ServerReflexive => "srflx".into(),
                        CandidateKind::PeerReflexive => unreachable!(),
                    },
                    rel_addr: rel_addr.map(|addr| UntaggedAddress::IpAddress(addr.ip())),
                    rel_port: rel_addr.map(|addr| addr.port()),
                }
            })
            .collect()
    }
}

fn local_preference_offset(kind: CandidateKind) -> u32 {
    match kind {
        CandidateKind::Host => (65535 / 4) * 3,
        CandidateKind::PeerReflexive => (65535 / 4) * 2,
        CandidateKind::ServerReflexive => 65535 / 4,
    }
}

/// RFC 8445 section 6.1.2.3
fn pair_priority(
    local_candidate: &Candidate,
    remote_candidate: &Candidate,
    is_controlling: bool,
) -> u64 {
    let (g, d) = if is_controlling {
        (local_candidate.priority, remote_candidate.priority)
    } else {
        (remote_candidate.priority, local_candidate.priority)
    };

    let (g, d) = (u64::from(g), u64::from(d));

    (1 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

fn compute_foundation(kind: CandidateKind, base: IpAddr) -> String {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    (kind, base, "udp").hash(&mut hasher);

    format!("{:x}", hasher.finish() & 0xFFFF_FFFF)
}

struct DisplayPair<'a>(&'a Candidate, &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}:{} -> {:?}:{}",
            self.0.kind, self.0.addr, self.1.kind, self.1.addr
        )
    }
}
