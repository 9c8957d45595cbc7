use crate::transaction::{
    ClientInvTsx, ClientTsx, Scheduler, ServerInvTsx, ServerTsx, TimerIntake, Transactions,
    TsxContext, TsxKey, TsxResponse, TsxState,
};
use crate::transport::{CompleteItem, Transport, TransportEvent, parse_complete};
use crate::{BaseHeaders, CoreEvent, Error, IncomingRequest, Request, Response, Result};
use bytes::{Bytes, BytesMut};
use sip_types::header::typed::Via;
use sip_types::host::Host;
use sip_types::msg::{MessageLine, StatusLine};
use sip_types::{Headers, Method, Name, StatusCode};
use std::collections::VecDeque;
use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use timer::TimerService;

/// Upper bound for one tick so retransmission timers are serviced promptly
const MAX_TICK: Duration = Duration::from_millis(500);

/// The protocol engine: one transport, the transaction layer and the
/// timers that drive it.
///
/// `SipCore` is not an endpoint on its own; registration and dialog state
/// live in the layer above, which drives this struct through
/// [`tick`](SipCore::tick) and reacts to the produced [`CoreEvent`]s.
pub struct SipCore {
    transport: Transport,
    transactions: Transactions,
    scheduler: Scheduler,
    intake: TimerIntake,
    timers: TimerService,
}

impl SipCore {
    pub fn new(transport: Transport, timers: TimerService) -> Self {
        let scheduler = Scheduler::new(timers.clone());
        let intake = scheduler.intake();

        Self {
            transport,
            transactions: Transactions::default(),
            scheduler,
            intake,
            timers,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Transport name for Via headers (`UDP` / `TCP`)
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// Number of live transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Drive the core: poll the transport (sleeping at most
    /// `min(timeout, 500ms)`), fire due timers and process the resulting
    /// retransmissions and timeouts.
    pub fn tick(&mut self, timeout: Duration, events: &mut VecDeque<CoreEvent>) -> Result<()> {
        self.transport.tick(timeout.min(MAX_TICK))?;

        while let Some(event) = self.transport.pop_event() {
            match event {
                TransportEvent::Data { bytes, source } => {
                    self.handle_datagram(&bytes, source, events);
                }
                TransportEvent::Connected { ok } => {
                    events.push_back(CoreEvent::TransportConnected { ok });
                }
                TransportEvent::Error { error } => {
                    events.push_back(CoreEvent::TransportError { error });
                }
            }
        }

        // fold the timer tick into this loop; a no-op when a worker thread
        // fires the queue
        self.timers.poll(Instant::now());

        loop {
            let Some((tsx_key, timer)) = self.intake.lock().pop_front() else {
                break;
            };

            let mut ctx = TsxContext {
                transport: &mut self.transport,
                scheduler: &self.scheduler,
                events: &mut *events,
            };

            // the transaction may be long gone, that is fine
            self.transactions.with(&tsx_key, &mut ctx, |state, key, ctx| match state {
                TsxState::Client(tsx) => tsx.timer(key, timer, ctx),
                TsxState::ClientInv(tsx) => tsx.timer(key, timer, ctx),
                TsxState::Server(tsx) => tsx.timer(timer),
                TsxState::ServerInv(tsx) => tsx.timer(key, timer, ctx),
            });
        }

        Ok(())
    }

    /// Send a non-INVITE request inside a new client transaction
    pub fn send_request(&mut self, request: Request, target: SocketAddr) -> Result<TsxKey> {
        let (key, mut request) = self.prepare_client_request(request);
        let bytes = print_request(&mut request);

        let mut ctx = TsxContext {
            transport: &mut self.transport,
            scheduler: &self.scheduler,
            events: &mut VecDeque::new(),
        };

        let tsx = ClientTsx::send(&key, bytes, target, &mut ctx);
        self.transactions.insert(key.clone(), TsxState::Client(tsx));

        Ok(key)
    }

    /// Send an INVITE inside a new client transaction
    pub fn send_invite(&mut self, request: Request, target: SocketAddr) -> Result<TsxKey> {
        let (key, mut request) = self.prepare_client_request(request);
        let bytes = print_request(&mut request);

        let mut ctx = TsxContext {
            transport: &mut self.transport,
            scheduler: &self.scheduler,
            events: &mut VecDeque::new(),
        };

        let tsx = ClientInvTsx::send(&key, request, bytes, target, &mut ctx);
        self.transactions
            .insert(key.clone(), TsxState::ClientInv(tsx));

        Ok(key)
    }

    /// Send a CANCEL against a running INVITE client transaction. The
    /// CANCEL forms its own transaction but reuses the INVITE's branch.
    pub fn send_cancel(&mut self, invite_key: &TsxKey, request: Request, target: SocketAddr) -> Result<TsxKey> {
        let key = TsxKey::client_with_branch(
            invite_key.branch().clone(),
            request.line.method.clone(),
        );

        let mut request = self.prepare_client_request_with_key(&key, request);
        let bytes = print_request(&mut request);

        let mut ctx = TsxContext {
            transport: &mut self.transport,
            scheduler: &self.scheduler,
            events: &mut VecDeque::new(),
        };

        let tsx = ClientTsx::send(&key, bytes, target, &mut ctx);
        self.transactions.insert(key.clone(), TsxState::Client(tsx));

        Ok(key)
    }

    /// Send a request outside any transaction (ACK for a 2xx)
    pub fn send_non_tsx_request(&mut self, request: Request, target: SocketAddr) -> Result<()> {
        let (_, mut request) = self.prepare_client_request(request);
        let bytes = print_request(&mut request);

        self.transport.send(&bytes, target)?;

        Ok(())
    }

    fn prepare_client_request(&self, request: Request) -> (TsxKey, Request) {
        let key = TsxKey::client(request.line.method.clone());
        let request = self.prepare_client_request_with_key(&key, request);

        (key, request)
    }

    fn prepare_client_request_with_key(&self, key: &TsxKey, request: Request) -> Request {
        let mut request = request;

        let via = Via::new(
            self.transport.name(),
            self.transport.local_addr().into(),
            key.branch().clone(),
        );

        request
            .headers
            .insert_front(Name::Via, via.to_string());

        if !request.headers.contains(&Name::MaxForwards) {
            request.headers.insert(Name::MaxForwards, "70");
        }

        request
    }

    /// Send a response inside the server transaction `tsx_key`
    pub fn respond(&mut self, tsx_key: &TsxKey, mut response: Response) -> Result<()> {
        let code = response.line.code;
        let bytes = print_response(&mut response);

        let mut ctx = TsxContext {
            transport: &mut self.transport,
            scheduler: &self.scheduler,
            events: &mut VecDeque::new(),
        };

        let found = self
            .transactions
            .with(tsx_key, &mut ctx, |state, key, ctx| match state {
                TsxState::Server(tsx) => tsx.respond(key, bytes.clone(), code.is_final(), ctx),
                TsxState::ServerInv(tsx) => tsx.respond(key, bytes.clone(), code, ctx),
                _ => {
                    log::error!("respond called on a client transaction {key}");
                    crate::transaction::TsxAction::Keep
                }
            });

        if !found {
            return Err(Error::UnknownTransaction(tsx_key.clone()));
        }

        Ok(())
    }

    /// Tell an INVITE server transaction in the accepted state that its
    /// 2xx was acknowledged. Driven by the dialog layer because the ACK of
    /// a 2xx carries a fresh branch and matches no transaction by itself.
    pub fn ack_received(&mut self, tsx_key: &TsxKey) {
        let mut ctx = TsxContext {
            transport: &mut self.transport,
            scheduler: &self.scheduler,
            events: &mut VecDeque::new(),
        };

        self.transactions.with(tsx_key, &mut ctx, |state, key, ctx| match state {
            TsxState::ServerInv(tsx) => tsx.ack_received(key, ctx),
            _ => crate::transaction::TsxAction::Keep,
        });
    }

    /// Create a response to an incoming request, copying the Via path and
    /// dialog identifiers
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<&str>,
    ) -> Response {
        debug_assert!(request.line.method != Method::Ack);

        let mut headers = Headers::with_capacity(5);

        for via in &request.base_headers.via {
            headers.insert(Name::Via, via.to_string());
        }

        headers.insert(Name::From, request.base_headers.from.to_string());
        headers.insert(Name::To, request.base_headers.to.to_string());
        headers.insert(Name::CallId, request.base_headers.call_id.clone());
        headers.insert(Name::CSeq, request.base_headers.cseq.to_string());

        Response {
            line: StatusLine {
                code,
                reason: reason
                    .map(bytesstr::BytesStr::from)
                    .or_else(|| code.text().map(bytesstr::BytesStr::from_static)),
            },
            headers,
            body: Bytes::new(),
        }
    }

    fn handle_datagram(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        events: &mut VecDeque<CoreEvent>,
    ) {
        match parse_complete(bytes) {
            Ok(CompleteItem::KeepAliveRequest) => {
                if let Err(e) = self.transport.send(b"\r\n", source) {
                    log::debug!("failed to answer keep-alive from {source}: {e}");
                }
            }
            Ok(CompleteItem::KeepAliveResponse) => { /* ignore */ }
            Ok(CompleteItem::Stun(_)) => {
                // STUN on the signaling socket is not used by this stack
                log::debug!("ignoring STUN message on signaling transport from {source}");
            }
            Ok(CompleteItem::Sip(message)) => {
                self.handle_message(message, source, events);
            }
            Err(e) => {
                // a malformed datagram never tears down the agent
                log::warn!("discarding unparseable datagram from {source}: {e}");
            }
        }
    }

    fn handle_message(
        &mut self,
        message: sip_types::parse::ParsedMessage,
        source: SocketAddr,
        events: &mut VecDeque<CoreEvent>,
    ) {
        let mut base_headers = match BaseHeaders::extract_from(&message.headers) {
            Ok(base_headers) => base_headers,
            Err(e) => {
                log::warn!("failed to get base headers of incoming message, {e}");
                return;
            }
        };

        let mut headers = message.headers;

        if message.line.is_request() {
            add_received_rport(&mut base_headers.via[0], source);

            // patch the raw headers so generated responses carry the
            // updated Via path
            headers.remove(&Name::Via);
            for via in base_headers.via.iter().rev() {
                headers.insert_front(Name::Via, via.to_string());
            }
        }

        let tsx_key = match TsxKey::from_message_parts(&message.line, &base_headers) {
            Ok(tsx_key) => tsx_key,
            Err(e) => {
                log::warn!("failed to derive transaction key for incoming message, {e}");
                return;
            }
        };

        match message.line {
            MessageLine::Response(line) => {
                let response = TsxResponse {
                    line,
                    base_headers,
                    headers,
                    body: message.body,
                };

                let mut ctx = TsxContext {
                    transport: &mut self.transport,
                    scheduler: &self.scheduler,
                    events: &mut *events,
                };

                let found =
                    self.transactions
                        .with(&tsx_key, &mut ctx, |state, key, ctx| match state {
                            TsxState::Client(tsx) => tsx.receive(key, response, ctx),
                            TsxState::ClientInv(tsx) => tsx.receive(key, response, ctx),
                            _ => crate::transaction::TsxAction::Keep,
                        });

                if !found {
                    log::debug!("dropping orphaned response from {source}");
                }
            }
            MessageLine::Request(line) => {
                if self.transactions.contains(&tsx_key) {
                    let mut ctx = TsxContext {
                        transport: &mut self.transport,
                        scheduler: &self.scheduler,
                        events: &mut *events,
                    };

                    self.transactions
                        .with(&tsx_key, &mut ctx, |state, key, ctx| match state {
                            TsxState::Server(tsx) => tsx.retransmission(ctx),
                            TsxState::ServerInv(tsx) => {
                                if line.method == Method::Ack {
                                    tsx.ack_received(key, ctx)
                                } else {
                                    tsx.retransmission(ctx)
                                }
                            }
                            _ => crate::transaction::TsxAction::Keep,
                        });

                    return;
                }

                if line.method == Method::Ack {
                    // the ACK of a 2xx, passed to the dialog layer
                    events.push_back(CoreEvent::Request(IncomingRequest {
                        tsx_key,
                        line,
                        base_headers,
                        headers,
                        body: message.body,
                        source,
                    }));

                    return;
                }

                let destination = response_destination(&base_headers.via[0], source);

                if line.method == Method::Invite {
                    let mut tsx = ServerInvTsx::new(destination);

                    // answer retransmissions immediately while the
                    // application decides
                    let mut trying = self.trying_response(&base_headers, &headers);
                    let bytes = print_response(&mut trying);

                    let mut ctx = TsxContext {
                        transport: &mut self.transport,
                        scheduler: &self.scheduler,
                        events: &mut *events,
                    };

                    tsx.respond(&tsx_key, bytes, StatusCode::TRYING, &mut ctx);

                    self.transactions
                        .insert(tsx_key.clone(), TsxState::ServerInv(tsx));
                } else {
                    self.transactions
                        .insert(tsx_key.clone(), TsxState::Server(ServerTsx::new(destination)));
                }

                events.push_back(CoreEvent::Request(IncomingRequest {
                    tsx_key,
                    line,
                    base_headers,
                    headers,
                    body: message.body,
                    source,
                }));
            }
        }
    }

    fn trying_response(&self, base_headers: &BaseHeaders, _headers: &Headers) -> Response {
        let mut headers = Headers::with_capacity(5);

        for via in &base_headers.via {
            headers.insert(Name::Via, via.to_string());
        }

        headers.insert(Name::From, base_headers.from.to_string());
        headers.insert(Name::To, base_headers.to.to_string());
        headers.insert(Name::CallId, base_headers.call_id.clone());
        headers.insert(Name::CSeq, base_headers.cseq.to_string());

        Response {
            line: StatusLine::new(StatusCode::TRYING),
            headers,
            body: Bytes::new(),
        }
    }
}

/// Fill `received` / `rport` of the topmost Via (RFC 3581)
fn add_received_rport(via: &mut Via, source: SocketAddr) {
    let source_host: Host = source.ip().into();

    if source_host != via.sent_by.host {
        via.params.push_or_edit("received", source.ip().to_string());
    }

    if via.params.contains("rport") {
        via.params.push_or_edit("rport", source.port().to_string());
    }
}

/// Where a response to a request with this Via should be sent
/// (RFC 3261 section 18.2.2 / RFC 3581)
fn response_destination(via: &Via, source: SocketAddr) -> SocketAddr {
    if let Some(maddr) = via
        .params
        .get_val("maddr")
        .and_then(|maddr| maddr.parse::<IpAddr>().ok())
    {
        return SocketAddr::new(maddr, via.sent_by.port.unwrap_or(5060));
    }

    if let Some(rport) = via
        .params
        .get_val("rport")
        .and_then(|rport| rport.parse::<u16>().ok())
    {
        return SocketAddr::new(source.ip(), rport);
    }

    source
}

/// Serialize a request, setting Content-Length
pub(crate) fn print_request(request: &mut Request) -> Bytes {
    request
        .headers
        .replace(Name::ContentLength, request.body.len().to_string());

    let mut buffer = BytesMut::new();

    let _ = write!(buffer, "{}\r\n{}\r\n", request.line, request.headers);

    buffer.extend_from_slice(&request.body);

    buffer.freeze()
}

/// Serialize a response, setting Content-Length
pub(crate) fn print_response(response: &mut Response) -> Bytes {
    response
        .headers
        .replace(Name::ContentLength, response.body.len().to_string());

    let mut buffer = BytesMut::new();

    let _ = write!(buffer, "{}\r\n{}\r\n", response.line, response.headers);

    buffer.extend_from_slice(&response.body);

    buffer.freeze()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn received_rport_patching() {
        let mut via = Via::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa;rport").unwrap();

        add_received_rport(&mut via, "203.0.113.9:31337".parse().unwrap());

        assert_eq!(via.params.get_val("received").unwrap(), "203.0.113.9");
        assert_eq!(via.params.get_val("rport").unwrap(), "31337");
    }

    #[test]
    fn received_not_added_when_host_matches() {
        let mut via = Via::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa").unwrap();

        add_received_rport(&mut via, "10.0.0.1:5060".parse().unwrap());

        assert!(via.params.get_val("received").is_none());
    }

    #[test]
    fn response_destination_prefers_rport() {
        let via = Via::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa;rport=7777;received=203.0.113.9")
            .unwrap();

        let destination = response_destination(&via, "203.0.113.9:31337".parse().unwrap());

        assert_eq!(destination, "203.0.113.9:7777".parse().unwrap());
    }

    #[test]
    fn print_sets_content_length() {
        let mut request = Request::new(Method::Options, "sip:example.com".parse().unwrap());
        request.body = Bytes::from_static(b"abcd");

        let bytes = print_request(&mut request);
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("OPTIONS sip:example.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\nabcd"));
    }
}
