use crate::config::{AgentConfig, TransportType};
use crate::dialog::{CallDirection, Dialog, DialogId, DialogState};
use crate::events::{AgentEvent, AgentHandler, AgentState, dispatch};
use crate::registration::{Registration, random_string};
use crate::{AgentError, Result};
use bytes::Bytes;
use media::{AudioCapture, AudioPlayback, MediaSession, SessionEvent, SessionState};
use sip_auth::{DigestAuthenticator, DigestCredentials, DigestUser, RequestParts, ResponseParts};
use sip_core::transport::{TcpTransport, Transport, UdpTransport};
use sip_core::{CoreEvent, IncomingRequest, Request, SipCore, TsxKey, TsxResponse};
use sip_types::header::typed::{Contact, FromTo};
use sip_types::host::Host;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name, StatusCode};
use slotmap::SlotMap;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timer::TimerService;

/// Internal agent-level timer tokens
enum AgentTimer {
    RegistrationRefresh,
}

/// Non-dialog UAC request awaiting its final response
struct PendingRequest {
    kind: PendingKind,
    request: Request,
    target: SocketAddr,
    authenticator: DigestAuthenticator,
    authenticated: bool,
}

enum PendingKind {
    Message,
    Bye,
}

/// The SIP endpoint of a host application.
///
/// Owns the signaling transport, the registration binding and all call
/// legs. Everything is driven by [`Agent::tick`]; callbacks fire on the
/// calling thread.
pub struct Agent {
    config: AgentConfig,
    core: SipCore,
    timers: TimerService,

    state: AgentState,
    registration: Option<Registration>,
    dialogs: SlotMap<DialogId, Dialog>,
    pending: HashMap<TsxKey, PendingRequest>,

    aor: NameAddr,
    contact: Contact,
    contact_addr: SocketAddr,

    handler: Box<dyn AgentHandler>,
    pending_events: VecDeque<AgentEvent>,
    timer_intake: Arc<Mutex<VecDeque<AgentTimer>>>,
}

impl Agent {
    /// Create an agent with the transport chosen by the configuration.
    ///
    /// The MQTT variant needs a broker client and must be constructed with
    /// [`Agent::with_transport`].
    pub fn new(config: AgentConfig, handler: Box<dyn AgentHandler>) -> Result<Self> {
        let transport = match config.transport_type {
            TransportType::Udp => Transport::Udp(
                UdpTransport::bind((Ipv4Addr::UNSPECIFIED, config.local_port))
                    .map_err(sip_core::Error::Io)?,
            ),
            TransportType::Tcp => {
                let target = resolve(config.registrar_host(), config.registrar_port)?;
                Transport::Tcp(TcpTransport::connect(target).map_err(sip_core::Error::Io)?)
            }
            TransportType::Mqtt => {
                return Err(AgentError::InvalidConfig(
                    "MQTT transport needs a broker client, use Agent::with_transport",
                ));
            }
        };

        Self::with_transport(config, transport, handler)
    }

    /// Create an agent on an already constructed transport
    pub fn with_transport(
        config: AgentConfig,
        transport: Transport,
        handler: Box<dyn AgentHandler>,
    ) -> Result<Self> {
        if config.username.is_empty() || config.domain.is_empty() {
            return Err(AgentError::InvalidConfig("username and domain are required"));
        }

        let timers = TimerService::new();

        let contact_addr = advertised_addr(transport.local_addr());

        let core = SipCore::new(transport, timers.clone());

        let aor_uri: SipUri = format!("sip:{}@{}", config.username, config.domain)
            .parse()
            .map_err(|_| AgentError::InvalidConfig("username or domain is not uri safe"))?;

        let aor = match &config.display_name {
            Some(display_name) => NameAddr::new(display_name.as_str(), aor_uri),
            None => NameAddr::uri(aor_uri),
        };

        let contact_uri: SipUri = format!("sip:{}@{}", config.username, contact_addr)
            .parse()
            .map_err(|_| AgentError::InvalidConfig("contact address is not uri safe"))?;

        let contact = Contact::new(NameAddr::uri(contact_uri));

        Ok(Self {
            config,
            core,
            timers,
            state: AgentState::Idle,
            registration: None,
            dialogs: SlotMap::with_key(),
            pending: HashMap::new(),
            aor,
            contact,
            contact_addr,
            handler,
            pending_events: VecDeque::new(),
            timer_intake: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// The timer service driving SIP retransmissions. Exposed so hosts can
    /// attach a worker thread with [`TimerService::init`]; without one the
    /// timers fire inside [`Agent::tick`].
    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// Number of live dialogs
    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn dialog_state(&self, dialog: DialogId) -> Result<DialogState> {
        Ok(self.get_dialog(dialog)?.state)
    }

    /// Transport mode of the dialog's media session, `None` until the
    /// first remote SDP decided it
    pub fn media_transport_mode(&self, dialog: DialogId) -> Result<Option<media::TransportMode>> {
        Ok(self.get_dialog(dialog)?.media.transport_mode())
    }

    /// Media counters of a dialog
    pub fn media_stats(&self, dialog: DialogId) -> Result<media::SessionStats> {
        Ok(self.get_dialog(dialog)?.media.stats())
    }

    /// Send the initial REGISTER
    pub fn start(&mut self) -> Result<()> {
        let target = resolve(self.config.registrar_host(), self.config.registrar_port)?;

        let registrar_uri = registrar_uri(self.config.registrar_host(), self.config.registrar_port)?;

        let mut registration = Registration::new(
            self.aor.clone(),
            self.contact.clone(),
            registrar_uri,
            target,
            self.config.register_expires,
            &self.config.username,
            &self.config.password,
        );

        let request = registration.create_register(false);
        registration.last_request = Some(request.clone());
        registration.tsx = Some(self.core.send_request(request, target)?);

        self.registration = Some(registration);
        self.set_state(AgentState::Registering);

        Ok(())
    }

    /// Remove the registration binding. The agent reaches `Unregistered`
    /// even if the registrar rejects the removal.
    pub fn stop(&mut self) -> Result<()> {
        let Some(registration) = &mut self.registration else {
            self.set_state(AgentState::Unregistered);
            return Ok(());
        };

        let target = registration.target;
        let request = registration.create_register(true);
        registration.last_request = Some(request.clone());
        registration.tsx = Some(self.core.send_request(request, target)?);

        self.set_state(AgentState::Unregistering);

        Ok(())
    }

    /// Start an outgoing call. The INVITE goes out once the media session
    /// produced its offer.
    pub fn make_call(&mut self, target: &str) -> Result<DialogId> {
        let target_uri: SipUri = target.parse().map_err(|_| AgentError::InvalidTarget)?;
        let target_addr = resolve_uri(&target_uri)?;

        let mut media_config = self.config.media.clone();
        media_config.ice_controlling = true;

        let mut media = MediaSession::new(media_config);
        media.gather()?;

        let local = FromTo::with_tag(self.aor.clone(), random_string(8));
        let remote = FromTo::new(NameAddr::uri(target_uri));

        let dialog = Dialog {
            call_id: random_string(20).into(),
            local,
            remote,
            direction: CallDirection::Outgoing,
            state: DialogState::Null,
            remote_target: None,
            target_addr,
            local_cseq: 0,
            invite_tsx: None,
            invite_request: None,
            authenticator: self.new_authenticator(),
            server_inv_tsx: None,
            incoming_invite: None,
            last_ack: None,
            media,
            remote_sdp_reported: false,
            answer_requested: false,
            cancelled: false,
            authenticated: false,
        };

        let id = self.dialogs.insert(dialog);
        self.set_dialog_state(id, DialogState::Calling);

        Ok(id)
    }

    /// Answer an incoming call. The 200 OK goes out once the media session
    /// produced its answer.
    pub fn answer_call(&mut self, dialog: DialogId) -> Result<()> {
        let dialog_ref = self.get_dialog_mut(dialog)?;

        if dialog_ref.state != DialogState::Incoming {
            return Err(AgentError::InvalidDialogState(dialog_ref.state));
        }

        dialog_ref.answer_requested = true;

        if dialog_ref.media.state() == SessionState::Idle {
            dialog_ref.media.gather()?;
        }

        // the offer may already be complete when the application answers
        // after a slow decision
        if dialog_ref.media.local_sdp().is_some() {
            self.send_uas_answer(dialog)?;
        }

        Ok(())
    }

    /// Reject an incoming call with a failure code
    pub fn reject_call(&mut self, dialog: DialogId, code: u16, reason: Option<&str>) -> Result<()> {
        let dialog_ref = self.get_dialog(dialog)?;

        if dialog_ref.state != DialogState::Incoming {
            return Err(AgentError::InvalidDialogState(dialog_ref.state));
        }

        let code = StatusCode::new(code.clamp(400, 699)).unwrap_or(StatusCode::DECLINE);

        let invite = dialog_ref
            .incoming_invite
            .as_ref()
            .ok_or(AgentError::UnknownDialog)?;

        let mut response = self.core.create_response(invite, code, reason);
        response
            .headers
            .replace(Name::To, dialog_ref.local.to_string());

        let tsx_key = invite.tsx_key.clone();

        self.core.respond(&tsx_key, response)?;

        self.set_dialog_state(dialog, DialogState::Failed);
        self.destroy_dialog(dialog);

        Ok(())
    }

    /// Terminate a confirmed (or early) call with BYE
    pub fn hangup(&mut self, dialog: DialogId) -> Result<()> {
        let dialog_ref = self.get_dialog_mut(dialog)?;

        if !matches!(dialog_ref.state, DialogState::Confirmed | DialogState::Early) {
            return Err(AgentError::InvalidDialogState(dialog_ref.state));
        }

        let request = dialog_ref.create_request(Method::Bye);
        let target = dialog_ref.target_addr;

        dialog_ref.media.stop();

        let tsx = self.core.send_request(request.clone(), target)?;

        self.pending.insert(
            tsx,
            PendingRequest {
                kind: PendingKind::Bye,
                request,
                target,
                authenticator: self.new_authenticator(),
                authenticated: false,
            },
        );

        self.set_dialog_state(dialog, DialogState::Terminated);
        self.destroy_dialog(dialog);

        Ok(())
    }

    /// Abort an outgoing call that was not answered yet
    pub fn cancel_call(&mut self, dialog: DialogId) -> Result<()> {
        let dialog_ref = self.get_dialog_mut(dialog)?;

        if dialog_ref.direction != CallDirection::Outgoing
            || !matches!(dialog_ref.state, DialogState::Calling | DialogState::Early)
        {
            return Err(AgentError::InvalidDialogState(dialog_ref.state));
        }

        let (invite_tsx, cancel, target) = {
            let invite_tsx = dialog_ref
                .invite_tsx
                .clone()
                .ok_or(AgentError::InvalidDialogState(dialog_ref.state))?;

            let invite = dialog_ref
                .invite_request
                .as_ref()
                .ok_or(AgentError::InvalidDialogState(dialog_ref.state))?;

            // a CANCEL mirrors the INVITE's identifiers (RFC 3261 section 9.1)
            let mut cancel = Request::new(Method::Cancel, invite.line.uri.clone());
            invite.headers.clone_into(&mut cancel.headers, Name::From);
            invite.headers.clone_into(&mut cancel.headers, Name::To);
            invite
                .headers
                .clone_into(&mut cancel.headers, Name::CallId);
            cancel.headers.insert(
                Name::CSeq,
                format!("{} CANCEL", dialog_ref.local_cseq),
            );
            cancel.headers.insert(Name::MaxForwards, "70");

            (invite_tsx, cancel, dialog_ref.target_addr)
        };

        dialog_ref.cancelled = true;
        dialog_ref.media.stop();

        self.core.send_cancel(&invite_tsx, cancel, target)?;

        self.set_dialog_state(dialog, DialogState::Terminated);

        // the dialog lingers until the 487 for the INVITE is absorbed

        Ok(())
    }

    /// Send a MESSAGE request outside any dialog
    pub fn send_message(&mut self, target: &str, content: &str) -> Result<()> {
        let target_uri: SipUri = target.parse().map_err(|_| AgentError::InvalidTarget)?;
        let target_addr = resolve_uri(&target_uri)?;

        let mut request = Request::new(Method::Message, target_uri.clone());

        let from = FromTo::with_tag(self.aor.clone(), random_string(8));
        let to = FromTo::new(NameAddr::uri(target_uri));

        request.headers.insert(Name::From, from.to_string());
        request.headers.insert(Name::To, to.to_string());
        request
            .headers
            .insert(Name::CallId, random_string(20));
        request.headers.insert(Name::CSeq, "1 MESSAGE");
        request.headers.insert(Name::MaxForwards, "70");
        request
            .headers
            .insert(Name::ContentType, "text/plain");
        request.body = Bytes::copy_from_slice(content.as_bytes());

        let tsx = self.core.send_request(request.clone(), target_addr)?;

        self.pending.insert(
            tsx,
            PendingRequest {
                kind: PendingKind::Message,
                request,
                target: target_addr,
                authenticator: self.new_authenticator(),
                authenticated: false,
            },
        );

        Ok(())
    }

    /// Attach a capture device to a dialog's media session
    pub fn set_capture_device(
        &mut self,
        dialog: DialogId,
        device: Box<dyn AudioCapture>,
    ) -> Result<()> {
        self.get_dialog_mut(dialog)?.media.set_capture_device(device);
        Ok(())
    }

    /// Attach a playback device to a dialog's media session
    pub fn set_playback_device(
        &mut self,
        dialog: DialogId,
        device: Box<dyn AudioPlayback>,
    ) -> Result<()> {
        self.get_dialog_mut(dialog)?.media.set_playback_device(device);
        Ok(())
    }

    /// Drive a single dialog's media session, for deployments that run
    /// media on its own thread cadence
    pub fn tick_media(&mut self, dialog: DialogId, timeout: Duration) -> Result<()> {
        let dialog_ref = self.get_dialog_mut(dialog)?;
        dialog_ref.media.tick(timeout)?;

        self.drain_media_events(dialog)?;
        self.flush_events();

        Ok(())
    }

    /// Drive the agent: signaling transport, SIP timers and the control
    /// plane of every media session. Sleeps at most `min(timeout, 500ms)`.
    pub fn tick(&mut self, timeout: Duration) -> Result<()> {
        let mut core_events = VecDeque::new();

        if let Err(e) = self.core.tick(timeout, &mut core_events) {
            self.push_error(503, &e.to_string());
            self.flush_events();
            return Err(e.into());
        }

        while let Some(event) = core_events.pop_front() {
            self.handle_core_event(event)?;
        }

        self.drain_agent_timers()?;
        self.drive_media()?;
        self.flush_events();

        Ok(())
    }

    fn handle_core_event(&mut self, event: CoreEvent) -> Result<()> {
        match event {
            CoreEvent::Request(request) => self.dispatch_request(request),
            CoreEvent::Response { tsx_key, response } => self.dispatch_response(tsx_key, response),
            CoreEvent::TsxTimeout { tsx_key } => self.dispatch_timeout(tsx_key),
            CoreEvent::TransportConnected { ok } => {
                if !ok {
                    self.push_error(503, "signaling transport disconnected");
                }
                Ok(())
            }
            CoreEvent::TransportError { error } => {
                self.push_error(503, &error);
                Ok(())
            }
        }
    }

    // === UAS: incoming requests ===

    fn dispatch_request(&mut self, request: IncomingRequest) -> Result<()> {
        log::debug!("incoming request {} from {}", request, request.source);

        match request.line.method.clone() {
            Method::Register => {
                // this stack is only ever a registration client
                let response =
                    self.core
                        .create_response(&request, StatusCode::METHOD_NOT_ALLOWED, None);
                self.core.respond(&request.tsx_key, response)?;
                Ok(())
            }
            Method::Invite => self.handle_incoming_invite(request),
            Method::Ack => self.handle_incoming_ack(request),
            Method::Bye => self.handle_incoming_bye(request),
            Method::Cancel => self.handle_incoming_cancel(request),
            other => {
                // PRACK/UPDATE/INFO/SUBSCRIBE/... are acknowledged without
                // any state change
                log::debug!("answering {other} with 200 without further processing");

                let response = self.core.create_response(&request, StatusCode::OK, None);
                self.core.respond(&request.tsx_key, response)?;
                Ok(())
            }
        }
    }

    fn handle_incoming_invite(&mut self, request: IncomingRequest) -> Result<()> {
        if self
            .find_dialog_by_call_id(&request.base_headers.call_id)
            .is_some()
        {
            // session modification is not supported
            let response = self
                .core
                .create_response(&request, StatusCode::new(488).expect("488 is valid"), None);
            self.core.respond(&request.tsx_key, response)?;
            return Ok(());
        }

        let mut media_config = self.config.media.clone();
        media_config.ice_controlling = false;

        let mut media = MediaSession::new(media_config);

        if !request.body.is_empty() {
            let remote_sdp = String::from_utf8_lossy(&request.body).into_owned();

            if let Err(e) = media.set_remote_sdp(&remote_sdp) {
                log::warn!("rejecting INVITE with unusable SDP: {e}");

                let response = self.core.create_response(
                    &request,
                    StatusCode::new(488).expect("488 is valid"),
                    None,
                );
                self.core.respond(&request.tsx_key, response)?;
                return Ok(());
            }
        }

        let local = FromTo::with_tag(request.base_headers.to.addr.clone(), random_string(8));
        let remote = request.base_headers.from.clone();
        let from = remote.addr.to_string();

        let remote_target = request
            .headers
            .get(&Name::Contact)
            .and_then(|value| Contact::parse(value).ok())
            .map(|contact| contact.addr.uri);

        let dialog = Dialog {
            call_id: request.base_headers.call_id.clone(),
            local,
            remote,
            direction: CallDirection::Incoming,
            state: DialogState::Null,
            remote_target,
            target_addr: request.source,
            local_cseq: 0,
            invite_tsx: None,
            invite_request: None,
            authenticator: self.new_authenticator(),
            server_inv_tsx: Some(request.tsx_key.clone()),
            incoming_invite: Some(request),
            last_ack: None,
            media,
            remote_sdp_reported: false,
            answer_requested: false,
            cancelled: false,
            authenticated: false,
        };

        let id = self.dialogs.insert(dialog);
        self.set_dialog_state(id, DialogState::Incoming);

        self.pending_events
            .push_back(AgentEvent::IncomingCall { dialog: id, from });

        Ok(())
    }

    fn handle_incoming_ack(&mut self, request: IncomingRequest) -> Result<()> {
        let Some(id) = self.find_dialog_by_call_id(&request.base_headers.call_id) else {
            log::debug!("ACK for unknown dialog, dropping");
            return Ok(());
        };

        let dialog = &mut self.dialogs[id];

        if dialog.direction != CallDirection::Incoming || dialog.state != DialogState::Incoming {
            // retransmitted ACK of an established dialog
            return Ok(());
        }

        if let Some(server_inv_tsx) = dialog.server_inv_tsx.clone() {
            self.core.ack_received(&server_inv_tsx);
        }

        let dialog = &mut self.dialogs[id];

        if dialog.media.state() == SessionState::Gathered {
            dialog.media.start()?;
        }

        self.set_dialog_state(id, DialogState::Confirmed);

        Ok(())
    }

    fn handle_incoming_bye(&mut self, request: IncomingRequest) -> Result<()> {
        let response = self.core.create_response(&request, StatusCode::OK, None);
        self.core.respond(&request.tsx_key, response)?;

        let Some(id) = self.find_dialog_by_call_id(&request.base_headers.call_id) else {
            log::debug!("BYE for unknown dialog, answered 200 anyway");
            return Ok(());
        };

        self.dialogs[id].media.stop();
        self.set_dialog_state(id, DialogState::Terminated);
        self.destroy_dialog(id);

        Ok(())
    }

    fn handle_incoming_cancel(&mut self, request: IncomingRequest) -> Result<()> {
        let response = self.core.create_response(&request, StatusCode::OK, None);
        self.core.respond(&request.tsx_key, response)?;

        let sibling = request.tsx_key.invite_sibling();

        let Some(id) = self
            .dialogs
            .iter()
            .find(|(_, dialog)| dialog.server_inv_tsx.as_ref() == Some(&sibling))
            .map(|(id, _)| id)
        else {
            log::debug!("CANCEL without a matching INVITE transaction");
            return Ok(());
        };

        // answer the INVITE with 487 through its own transaction
        let (tsx_key, response) = {
            let dialog = &self.dialogs[id];
            let invite = dialog
                .incoming_invite
                .as_ref()
                .ok_or(AgentError::UnknownDialog)?;

            let mut response =
                self.core
                    .create_response(invite, StatusCode::REQUEST_TERMINATED, None);
            response
                .headers
                .replace(Name::To, dialog.local.to_string());

            (sibling, response)
        };

        self.core.respond(&tsx_key, response)?;

        self.dialogs[id].media.stop();
        self.set_dialog_state(id, DialogState::Terminated);
        self.destroy_dialog(id);

        Ok(())
    }

    // === UAC: responses ===

    fn dispatch_response(&mut self, tsx_key: TsxKey, response: TsxResponse) -> Result<()> {
        if self
            .registration
            .as_ref()
            .is_some_and(|registration| registration.tsx.as_ref() == Some(&tsx_key))
        {
            return self.handle_register_response(response);
        }

        if let Some(id) = self.find_dialog_by_invite_tsx(&tsx_key) {
            return self.handle_invite_response(id, response);
        }

        if self.pending.contains_key(&tsx_key) {
            return self.handle_pending_response(tsx_key, response);
        }

        log::debug!("response for unknown transaction {tsx_key}");
        Ok(())
    }

    fn handle_register_response(&mut self, response: TsxResponse) -> Result<()> {
        let code = response.line.code;

        if code.is_provisional() {
            return Ok(());
        }

        let registration = self.registration.as_mut().expect("checked by caller");
        registration.tsx = None;

        let code_u16 = code.into_u16();
        let reason = response
            .line
            .reason
            .as_ref()
            .map(|reason| reason.to_string())
            .unwrap_or_default();

        if code.is_success() {
            if registration.removing {
                self.registration = None;
                self.set_state(AgentState::Unregistered);
                return Ok(());
            }

            let granted = response
                .headers
                .get(&Name::Expires)
                .and_then(|value| value.parse().ok());

            let refresh_after = registration.refresh_after(granted);

            let intake = self.timer_intake.clone();
            self.timers
                .start(Duration::from_secs(u64::from(refresh_after)), move || {
                    intake
                        .lock()
                        .expect("agent timer intake lock")
                        .push_back(AgentTimer::RegistrationRefresh);
                });

            self.set_state(AgentState::Registered);
            self.pending_events.push_back(AgentEvent::RegisterResult {
                success: true,
                code: code_u16,
                reason,
            });

            return Ok(());
        }

        if matches!(code_u16, 401 | 407) && !registration.authenticated {
            let request = registration
                .last_request
                .clone()
                .expect("a request is in flight");

            let rejection = registration.authenticator.handle_rejection(
                RequestParts {
                    line: &request.line,
                    headers: &request.headers,
                    body: &request.body,
                },
                ResponseParts {
                    headers: &response.headers,
                },
            );

            match rejection {
                Ok(()) => {
                    let target = registration.target;
                    let request = registration.create_authenticated_register();
                    registration.last_request = Some(request.clone());
                    registration.tsx = Some(self.core.send_request(request, target)?);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("REGISTER authentication failed: {e}");
                }
            }
        }

        // terminal failure
        let removing = registration.removing;
        if removing {
            // the binding is gone either way
            self.registration = None;
            self.set_state(AgentState::Unregistered);
        } else {
            self.set_state(AgentState::RegisterFailed);
        }

        self.pending_events.push_back(AgentEvent::RegisterResult {
            success: false,
            code: code_u16,
            reason,
        });

        Ok(())
    }

    fn handle_invite_response(&mut self, id: DialogId, response: TsxResponse) -> Result<()> {
        let code = response.line.code;
        let code_u16 = code.into_u16();

        if code.is_provisional() {
            if code_u16 > 100 && self.dialogs[id].state == DialogState::Calling {
                // remember the peer's tag from the provisional response
                self.dialogs[id].remote = response.base_headers.to.clone();
                self.set_dialog_state(id, DialogState::Early);
            }
            return Ok(());
        }

        if code.is_success() {
            return self.handle_invite_success(id, response);
        }

        // digest challenge, answered at most once
        if matches!(code_u16, 401 | 407) && !self.dialogs[id].authenticated {
            if self.retry_invite_with_auth(id, &response)? {
                return Ok(());
            }
        }

        let dialog = &mut self.dialogs[id];

        if dialog.cancelled {
            // the expected 487 after our CANCEL, already terminated
            log::debug!("absorbing {code_u16} for a cancelled INVITE");
            self.destroy_dialog(id);
            return Ok(());
        }

        dialog.media.stop();
        self.set_dialog_state(id, DialogState::Failed);
        self.push_error(code_u16, "call failed");
        self.destroy_dialog(id);

        Ok(())
    }

    fn handle_invite_success(&mut self, id: DialogId, response: TsxResponse) -> Result<()> {
        let dialog = &mut self.dialogs[id];

        if dialog.cancelled {
            // the 2xx won the race against our CANCEL: acknowledge and
            // immediately tear down
            dialog.remote = response.base_headers.to.clone();
            let ack = dialog.create_request(Method::Ack);
            let bye = dialog.create_request(Method::Bye);
            let target = dialog.target_addr;

            self.core.send_non_tsx_request(ack, target)?;
            self.core.send_request(bye, target)?;
            self.destroy_dialog(id);
            return Ok(());
        }

        if dialog.state == DialogState::Confirmed {
            // retransmitted 2xx: answer with the stored ACK
            if let Some(ack) = dialog.last_ack.clone() {
                let target = dialog.target_addr;
                self.core.send_non_tsx_request(ack, target)?;
            }
            return Ok(());
        }

        dialog.remote = response.base_headers.to.clone();

        dialog.remote_target = response
            .headers
            .get(&Name::Contact)
            .and_then(|value| Contact::parse(value).ok())
            .map(|contact| contact.addr.uri);

        let remote_sdp = (!response.body.is_empty())
            .then(|| String::from_utf8_lossy(&response.body).into_owned());

        if let Some(remote_sdp) = &remote_sdp {
            dialog.media.set_remote_sdp(remote_sdp)?;
        }

        if dialog.media.state() == SessionState::Gathered {
            dialog.media.start()?;
        }

        // the ACK of a 2xx forms its own "transaction" end-to-end
        let ack = dialog.create_request(Method::Ack);
        let target = dialog.target_addr;
        dialog.last_ack = Some(ack.clone());

        self.core.send_non_tsx_request(ack, target)?;

        if let Some(remote_sdp) = remote_sdp
            && !self.dialogs[id].remote_sdp_reported
        {
            self.dialogs[id].remote_sdp_reported = true;
            self.pending_events.push_back(AgentEvent::RemoteSdp {
                dialog: id,
                sdp: remote_sdp,
            });
        }

        self.set_dialog_state(id, DialogState::Confirmed);

        Ok(())
    }

    fn retry_invite_with_auth(&mut self, id: DialogId, response: &TsxResponse) -> Result<bool> {
        let dialog = &mut self.dialogs[id];

        let Some(original) = dialog.invite_request.clone() else {
            return Ok(false);
        };

        let rejection = dialog.authenticator.handle_rejection(
            RequestParts {
                line: &original.line,
                headers: &original.headers,
                body: &original.body,
            },
            ResponseParts {
                headers: &response.headers,
            },
        );

        if let Err(e) = rejection {
            log::warn!("INVITE authentication failed: {e}");
            return Ok(false);
        }

        let mut request = original;
        let cseq = dialog.next_cseq();
        request
            .headers
            .replace(Name::CSeq, format!("{cseq} INVITE"));
        dialog.authenticator.authorize_request(&mut request.headers);

        dialog.invite_request = Some(request.clone());
        dialog.authenticated = true;

        let target = dialog.target_addr;
        let tsx = self.core.send_invite(request, target)?;
        self.dialogs[id].invite_tsx = Some(tsx);

        Ok(true)
    }

    fn handle_pending_response(&mut self, tsx_key: TsxKey, response: TsxResponse) -> Result<()> {
        let code = response.line.code;

        if code.is_provisional() {
            return Ok(());
        }

        let mut pending = self.pending.remove(&tsx_key).expect("checked by caller");

        if matches!(code.into_u16(), 401 | 407) && !pending.authenticated {
            let rejection = pending.authenticator.handle_rejection(
                RequestParts {
                    line: &pending.request.line,
                    headers: &pending.request.headers,
                    body: &pending.request.body,
                },
                ResponseParts {
                    headers: &response.headers,
                },
            );

            if rejection.is_ok() {
                let mut request = pending.request.clone();

                // bump the CSeq for the retried request
                if let Some(cseq) = response.base_headers.cseq.cseq.checked_add(1) {
                    request.headers.replace(
                        Name::CSeq,
                        format!("{} {}", cseq, request.line.method),
                    );
                }

                pending
                    .authenticator
                    .authorize_request(&mut request.headers);
                pending.authenticated = true;
                pending.request = request.clone();

                let target = pending.target;
                let tsx = self.core.send_request(request, target)?;
                self.pending.insert(tsx, pending);

                return Ok(());
            }
        }

        if !code.is_success() {
            let what = match pending.kind {
                PendingKind::Message => "MESSAGE rejected",
                PendingKind::Bye => "BYE rejected",
            };

            self.push_error(code.into_u16(), what);
        }

        Ok(())
    }

    fn dispatch_timeout(&mut self, tsx_key: TsxKey) -> Result<()> {
        if self
            .registration
            .as_ref()
            .is_some_and(|registration| registration.tsx.as_ref() == Some(&tsx_key))
        {
            let removing = self
                .registration
                .as_ref()
                .map(|registration| registration.removing)
                .unwrap_or(false);

            if removing {
                self.registration = None;
                self.set_state(AgentState::Unregistered);
            } else {
                self.set_state(AgentState::RegisterFailed);
            }

            self.pending_events.push_back(AgentEvent::RegisterResult {
                success: false,
                code: 408,
                reason: "Request Timeout".into(),
            });

            return Ok(());
        }

        if let Some(id) = self.find_dialog_by_invite_tsx(&tsx_key) {
            self.dialogs[id].media.stop();

            if self.dialogs[id].cancelled {
                self.destroy_dialog(id);
            } else {
                self.set_dialog_state(id, DialogState::Failed);
                self.push_error(408, "call timed out");
                self.destroy_dialog(id);
            }

            return Ok(());
        }

        if let Some(id) = self.find_dialog_by_server_inv_tsx(&tsx_key) {
            // our final response was never acknowledged
            self.dialogs[id].media.stop();
            self.set_dialog_state(id, DialogState::Failed);
            self.destroy_dialog(id);
            return Ok(());
        }

        if self.pending.remove(&tsx_key).is_some() {
            self.push_error(408, "request timed out");
        }

        Ok(())
    }

    // === media plumbing ===

    fn drive_media(&mut self) -> Result<()> {
        let ids: Vec<DialogId> = self.dialogs.keys().collect();

        for id in ids {
            // a short tick keeps the control plane moving; media threads
            // can pump packets with `tick_media` at their own cadence
            if let Err(e) = self.dialogs[id].media.tick(Duration::ZERO) {
                log::warn!("media session tick failed: {e}");
            }

            self.drain_media_events(id)?;
        }

        Ok(())
    }

    fn drain_media_events(&mut self, id: DialogId) -> Result<()> {
        loop {
            let Some(dialog) = self.dialogs.get_mut(id) else {
                return Ok(());
            };

            let Some(event) = dialog.media.pop_event() else {
                return Ok(());
            };

            match event {
                SessionEvent::SdpReady(_) => match dialog.direction {
                    CallDirection::Outgoing => self.send_uac_invite(id)?,
                    CallDirection::Incoming => {
                        if dialog.answer_requested {
                            self.send_uas_answer(id)?;
                        }
                    }
                },
                SessionEvent::Connected => {
                    log::debug!("media connected for dialog {:?}", id);
                }
                SessionEvent::Disconnected { reason } => {
                    // media failure does not tear down the dialog, the
                    // application decides based on the error
                    self.push_error(487, &format!("media disconnected: {reason}"));
                }
                SessionEvent::StateChanged { old, new } => {
                    log::trace!("media session {:?} state {old:?} -> {new:?}", id);
                }
            }
        }
    }

    /// The media offer is ready: send the INVITE of an outgoing dialog
    fn send_uac_invite(&mut self, id: DialogId) -> Result<()> {
        let dialog = &mut self.dialogs[id];

        if dialog.invite_tsx.is_some() || dialog.state != DialogState::Calling {
            return Ok(());
        }

        let Some(sdp) = dialog.media.local_sdp().map(str::to_owned) else {
            return Ok(());
        };

        let cseq = dialog.next_cseq();

        let mut request = Request::new(Method::Invite, dialog.remote.addr.uri.clone());

        request
            .headers
            .insert(Name::From, dialog.local.to_string());
        request.headers.insert(Name::To, dialog.remote.to_string());
        request
            .headers
            .insert(Name::CallId, dialog.call_id.clone());
        request
            .headers
            .insert(Name::CSeq, format!("{cseq} INVITE"));
        request.headers.insert(Name::MaxForwards, "70");
        request
            .headers
            .insert(Name::Contact, self.contact.to_string());
        request
            .headers
            .insert(Name::ContentType, "application/sdp");
        request.body = Bytes::copy_from_slice(sdp.as_bytes());

        dialog.invite_request = Some(request.clone());

        let target = dialog.target_addr;
        let tsx = self.core.send_invite(request, target)?;
        self.dialogs[id].invite_tsx = Some(tsx);

        Ok(())
    }

    /// The media answer is ready: send the 200 OK of an incoming dialog
    fn send_uas_answer(&mut self, id: DialogId) -> Result<()> {
        let (tsx_key, response) = {
            let dialog = &mut self.dialogs[id];

            if dialog.state != DialogState::Incoming {
                return Ok(());
            }

            let Some(sdp) = dialog.media.local_sdp().map(str::to_owned) else {
                return Ok(());
            };

            let Some(tsx_key) = dialog.server_inv_tsx.clone() else {
                return Ok(());
            };

            let invite = dialog
                .incoming_invite
                .as_ref()
                .ok_or(AgentError::UnknownDialog)?;

            let mut response = self.core.create_response(invite, StatusCode::OK, None);

            response
                .headers
                .replace(Name::To, dialog.local.to_string());
            response
                .headers
                .insert(Name::Contact, self.contact.to_string());
            response
                .headers
                .insert(Name::ContentType, "application/sdp");
            response.body = Bytes::copy_from_slice(sdp.as_bytes());

            (tsx_key, response)
        };

        self.core.respond(&tsx_key, response)?;

        Ok(())
    }

    // === plumbing ===

    fn drain_agent_timers(&mut self) -> Result<()> {
        loop {
            let timer = {
                self.timer_intake
                    .lock()
                    .expect("agent timer intake lock")
                    .pop_front()
            };

            match timer {
                Some(AgentTimer::RegistrationRefresh) => {
                    // re-check that a binding still exists, the agent may
                    // have been stopped since the timer was armed
                    let Some(registration) = &mut self.registration else {
                        continue;
                    };

                    if self.state != AgentState::Registered {
                        continue;
                    }

                    let target = registration.target;
                    let request = registration.create_register(false);
                    registration.last_request = Some(request.clone());
                    registration.tsx = Some(self.core.send_request(request, target)?);
                }
                None => return Ok(()),
            }
        }
    }

    fn new_authenticator(&self) -> DigestAuthenticator {
        let mut credentials = DigestCredentials::new();
        credentials.set_default(DigestUser::new(
            self.config.username.as_str(),
            self.config.password.as_str(),
        ));

        DigestAuthenticator::new(credentials)
    }

    fn get_dialog(&self, id: DialogId) -> Result<&Dialog> {
        self.dialogs.get(id).ok_or(AgentError::UnknownDialog)
    }

    fn get_dialog_mut(&mut self, id: DialogId) -> Result<&mut Dialog> {
        self.dialogs.get_mut(id).ok_or(AgentError::UnknownDialog)
    }

    fn find_dialog_by_call_id(&self, call_id: &str) -> Option<DialogId> {
        self.dialogs
            .iter()
            .find(|(_, dialog)| dialog.matches_call_id(call_id))
            .map(|(id, _)| id)
    }

    fn find_dialog_by_invite_tsx(&self, tsx_key: &TsxKey) -> Option<DialogId> {
        self.dialogs
            .iter()
            .find(|(_, dialog)| dialog.invite_tsx.as_ref() == Some(tsx_key))
            .map(|(id, _)| id)
    }

    fn find_dialog_by_server_inv_tsx(&self, tsx_key: &TsxKey) -> Option<DialogId> {
        self.dialogs
            .iter()
            .find(|(_, dialog)| dialog.server_inv_tsx.as_ref() == Some(tsx_key))
            .map(|(id, _)| id)
    }

    fn set_state(&mut self, new: AgentState) {
        if self.state == new {
            return;
        }

        log::info!("agent state {} -> {}", self.state, new);

        let old = std::mem::replace(&mut self.state, new);
        self.pending_events
            .push_back(AgentEvent::StateChanged { old, new });
    }

    fn set_dialog_state(&mut self, id: DialogId, new: DialogState) {
        let Some(dialog) = self.dialogs.get_mut(id) else {
            return;
        };

        if dialog.state == new {
            return;
        }

        log::info!("dialog {} state {} -> {}", dialog.call_id, dialog.state, new);

        let old = std::mem::replace(&mut dialog.state, new);
        self.pending_events.push_back(AgentEvent::DialogStateChanged {
            dialog: id,
            old,
            new,
        });
    }

    /// Stop the media session and drop the dialog. Transactions owned by
    /// the core finish on their own.
    fn destroy_dialog(&mut self, id: DialogId) {
        if let Some(mut dialog) = self.dialogs.remove(id) {
            dialog.media.close();
        }
    }

    fn push_error(&mut self, code: u16, message: &str) {
        log::warn!("agent error {code}: {message}");

        self.pending_events.push_back(AgentEvent::Error {
            code,
            message: message.to_string(),
        });
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.pending_events.pop_front() {
            dispatch(self.handler.as_mut(), event);
        }
    }
}

/// Resolve `host:port`, accepting both numeric addresses and names
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| AgentError::Resolve(format!("{host}:{port}")))
}

fn resolve_uri(uri: &SipUri) -> Result<SocketAddr> {
    let port = uri.host_port.port_or_default();

    match &uri.host_port.host {
        Host::Ip(ip) => Ok(SocketAddr::new(*ip, port)),
        Host::Name(name) => resolve(name, port),
    }
}

fn registrar_uri(host: &str, port: u16) -> Result<SipUri> {
    let uri = if port == 5060 {
        format!("sip:{host}")
    } else {
        format!("sip:{host}:{port}")
    };

    uri.parse()
        .map_err(|_| AgentError::InvalidConfig("registrar is not a valid host"))
}

/// The address to advertise in Contact headers; an unspecified bind
/// address is replaced by a routable local address
fn advertised_addr(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }

    let ip = local_ip_address::local_ip()
        .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::LOCALHOST));

    SocketAddr::new(ip, bound.port())
}
