//! End-to-end call flows against a scripted UDP responder on loopback.

use lark_sip_ua::{
    Agent, AgentConfig, AgentHandler, AgentState, DialogId, DialogState, TransportMode,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    State(AgentState, AgentState),
    RegisterResult(bool, u16),
    IncomingCall(DialogId, String),
    DialogState(DialogId, DialogState, DialogState),
    RemoteSdp(DialogId),
    Error(u16),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl AgentHandler for Recorder {
    fn on_state_changed(&mut self, old: AgentState, new: AgentState) {
        self.push(Recorded::State(old, new));
    }

    fn on_register_result(&mut self, success: bool, code: u16, _reason: &str) {
        self.push(Recorded::RegisterResult(success, code));
    }

    fn on_incoming_call(&mut self, dialog: DialogId, from: &str) {
        self.push(Recorded::IncomingCall(dialog, from.to_string()));
    }

    fn on_dialog_state_changed(&mut self, dialog: DialogId, old: DialogState, new: DialogState) {
        self.push(Recorded::DialogState(dialog, old, new));
    }

    fn on_remote_sdp(&mut self, dialog: DialogId, _sdp: &str) {
        self.push(Recorded::RemoteSdp(dialog));
    }

    fn on_error(&mut self, code: u16, _message: &str) {
        self.push(Recorded::Error(code));
    }
}

/// Scripted remote peer
struct Stub {
    socket: UdpSocket,
}

impl Stub {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        Self { socket }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn try_recv(&self) -> Option<(String, SocketAddr)> {
        let mut buffer = [0u8; 65535];

        match self.socket.recv_from(&mut buffer) {
            Ok((len, source)) => Some((
                String::from_utf8_lossy(&buffer[..len]).into_owned(),
                source,
            )),
            Err(_) => None,
        }
    }

    /// Tick the agent until a message starting with `prefix` arrives
    fn expect(&self, agent: &mut Agent, prefix: &str) -> (String, SocketAddr) {
        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            agent.tick(Duration::from_millis(5)).unwrap();

            if let Some((message, source)) = self.try_recv() {
                if message.starts_with(prefix) {
                    return (message, source);
                }

                // unrelated traffic (100 Trying, retransmits) is skipped
                continue;
            }

            assert!(
                Instant::now() < deadline,
                "never received a message starting with {prefix:?}"
            );
        }
    }

    fn send(&self, message: &str, target: SocketAddr) {
        self.socket.send_to(message.as_bytes(), target).unwrap();
    }
}

fn header<'m>(message: &'m str, name: &str) -> &'m str {
    message
        .lines()
        .find_map(|line| {
            let (line_name, value) = line.split_once(':')?;
            line_name.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
        .unwrap_or_else(|| panic!("message has no {name} header:\n{message}"))
}

/// Build a response copying the dialog identifiers from `request`
fn response_for(
    request: &str,
    code: u16,
    reason: &str,
    to_tag: Option<&str>,
    extra_headers: &[String],
    body: &str,
) -> String {
    let mut to = header(request, "To").to_string();

    if let Some(tag) = to_tag
        && !to.contains("tag=")
    {
        to = format!("{to};tag={tag}");
    }

    let mut response = format!(
        "SIP/2.0 {code} {reason}\r\nVia: {}\r\nFrom: {}\r\nTo: {to}\r\nCall-ID: {}\r\nCSeq: {}\r\n",
        header(request, "Via"),
        header(request, "From"),
        header(request, "Call-ID"),
        header(request, "CSeq"),
    );

    for extra in extra_headers {
        response.push_str(extra);
        response.push_str("\r\n");
    }

    response.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));

    response
}

fn direct_sdp(port: u16) -> String {
    format!(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\na=sendrecv\r\n"
    )
}

fn test_agent(registrar: SocketAddr) -> (Agent, Recorder) {
    let recorder = Recorder::default();

    let config = AgentConfig {
        username: "alice".into(),
        password: "secret".into(),
        domain: "example.com".into(),
        registrar: registrar.ip().to_string(),
        registrar_port: registrar.port(),
        register_expires: 3600,
        ..AgentConfig::default()
    };

    let agent = Agent::new(config, Box::new(recorder.clone())).unwrap();

    (agent, recorder)
}

fn tick_until<F>(agent: &mut Agent, mut done: F)
where
    F: FnMut(&Agent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);

    while !done(agent) {
        agent.tick(Duration::from_millis(5)).unwrap();

        assert!(Instant::now() < deadline, "condition never became true");
    }
}

// Scenario: REGISTER answered with 200 OK
#[test]
fn register_success() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    agent.start().unwrap();

    let (register, source) = stub.expect(&mut agent, "REGISTER");
    assert_eq!(header(&register, "Expires"), "3600");

    stub.send(&response_for(&register, 200, "OK", None, &[], ""), source);

    tick_until(&mut agent, |agent| agent.state() == AgentState::Registered);

    let events = recorder.events();

    assert!(events.contains(&Recorded::State(AgentState::Idle, AgentState::Registering)));
    assert!(events.contains(&Recorded::State(
        AgentState::Registering,
        AgentState::Registered
    )));
    assert!(events.contains(&Recorded::RegisterResult(true, 200)));
}

// Scenario: REGISTER challenged with a qop=auth digest, answered on retry
#[test]
fn register_with_digest_challenge() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    agent.start().unwrap();

    let (first, source) = stub.expect(&mut agent, "REGISTER");

    stub.send(
        &response_for(
            &first,
            401,
            "Unauthorized",
            None,
            &["WWW-Authenticate: Digest realm=\"ex\", nonce=\"abc\", qop=\"auth\"".into()],
            "",
        ),
        source,
    );

    let (second, source) = stub.expect(&mut agent, "REGISTER");
    let authorization = header(&second, "Authorization");

    // verify the digest law over the generated header
    let field = |name: &str| -> String {
        let start = authorization
            .find(name)
            .unwrap_or_else(|| panic!("no {name} in {authorization}"))
            + name.len();
        let rest = &authorization[start..];
        let rest = rest.trim_start_matches('=').trim_start_matches('"');
        rest.split(['"', ','])
            .next()
            .unwrap()
            .to_string()
    };

    let cnonce = field("cnonce");
    let uri = field("uri");
    let response_field = field("response");

    let md5 = |input: String| format!("{:x}", md5::compute(input.as_bytes()));

    let ha1 = md5("alice:ex:secret".into());
    let ha2 = md5(format!("REGISTER:{uri}"));
    let expected = md5(format!("{ha1}:abc:00000001:{cnonce}:auth:{ha2}"));

    assert_eq!(response_field, expected);

    stub.send(&response_for(&second, 200, "OK", None, &[], ""), source);

    tick_until(&mut agent, |agent| agent.state() == AgentState::Registered);

    assert!(recorder
        .events()
        .contains(&Recorded::RegisterResult(true, 200)));
}

// Scenario: outgoing call against a peer without ICE (direct RTP)
#[test]
fn outgoing_call_rtp_direct() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    let dialog = agent
        .make_call(&format!("sip:bob@{}", stub.addr()))
        .unwrap();

    // the INVITE goes out only once the offer is ready
    let (invite, source) = stub.expect(&mut agent, "INVITE");

    assert!(invite.contains("m=audio"), "INVITE carries no SDP offer");
    assert_eq!(header(&invite, "Content-Type"), "application/sdp");

    stub.send(
        &response_for(&invite, 180, "Ringing", Some("bob1"), &[], ""),
        source,
    );

    tick_until(&mut agent, |agent| {
        agent.dialog_state(dialog).unwrap() == DialogState::Early
    });

    let contact = format!("Contact: <sip:bob@{}>", stub.addr());
    stub.send(
        &response_for(
            &invite,
            200,
            "OK",
            Some("bob1"),
            &[contact, "Content-Type: application/sdp".into()],
            &direct_sdp(40000),
        ),
        source,
    );

    // the 200 is acknowledged end-to-end
    let (ack, _) = stub.expect(&mut agent, "ACK");
    assert_eq!(header(&ack, "Call-ID"), header(&invite, "Call-ID"));

    tick_until(&mut agent, |agent| {
        agent.dialog_state(dialog).unwrap() == DialogState::Confirmed
    });

    assert_eq!(
        agent.media_transport_mode(dialog).unwrap(),
        Some(TransportMode::RtpDirect)
    );

    let events = recorder.events();

    assert!(events.contains(&Recorded::DialogState(
        dialog,
        DialogState::Null,
        DialogState::Calling
    )));
    assert!(events.contains(&Recorded::DialogState(
        dialog,
        DialogState::Calling,
        DialogState::Early
    )));
    assert!(events.contains(&Recorded::DialogState(
        dialog,
        DialogState::Early,
        DialogState::Confirmed
    )));

    // remote SDP is reported exactly once
    let remote_sdp_count = events
        .iter()
        .filter(|event| matches!(event, Recorded::RemoteSdp(_)))
        .count();
    assert_eq!(remote_sdp_count, 1);
}

// Scenario: incoming INVITE, answered by the application
#[test]
fn incoming_call_answered() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    let agent_target = SocketAddr::new("127.0.0.1".parse().unwrap(), agent.local_addr().port());

    let invite = format!(
        "INVITE sip:alice@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKstub1;rport\r\n\
         From: \"Bob\" <sip:bob@127.0.0.1>;tag=b1\r\n\
         To: <sip:alice@127.0.0.1>\r\n\
         Call-ID: C123\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:bob@127.0.0.1:{port}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{sdp}",
        port = stub.addr().port(),
        len = direct_sdp(40000).len(),
        sdp = direct_sdp(40000),
    );

    stub.send(&invite, agent_target);

    // wait for the incoming call report
    let mut dialog = None;

    tick_until(&mut agent, |_| {
        dialog = recorder.events().iter().find_map(|event| match event {
            Recorded::IncomingCall(dialog, _) => Some(*dialog),
            _ => None,
        });
        dialog.is_some()
    });

    let dialog = dialog.unwrap();

    assert_eq!(agent.dialog_state(dialog).unwrap(), DialogState::Incoming);

    let from = recorder
        .events()
        .iter()
        .find_map(|event| match event {
            Recorded::IncomingCall(_, from) => Some(from.clone()),
            _ => None,
        })
        .unwrap();
    assert!(from.contains("bob@127.0.0.1"));

    agent.answer_call(dialog).unwrap();

    // the answer goes out once gathering finished
    let (ok, _) = stub.expect(&mut agent, "SIP/2.0 200");
    assert!(ok.contains("m=audio"), "200 OK carries no SDP answer");

    let to = header(&ok, "To");
    assert!(to.contains("tag="), "200 OK To has no local tag");

    // acknowledge to confirm the dialog
    let ack = format!(
        "ACK sip:alice@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKstub2\r\n\
         From: \"Bob\" <sip:bob@127.0.0.1>;tag=b1\r\n\
         To: {to}\r\n\
         Call-ID: C123\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n",
        port = stub.addr().port(),
    );

    stub.send(&ack, agent_target);

    tick_until(&mut agent, |agent| {
        agent.dialog_state(dialog).unwrap() == DialogState::Confirmed
    });

    assert_eq!(
        agent.media_transport_mode(dialog).unwrap(),
        Some(TransportMode::RtpDirect)
    );
}

// Scenario: CANCEL after a provisional response, late 487 is absorbed
#[test]
fn cancel_race() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    let dialog = agent
        .make_call(&format!("sip:bob@{}", stub.addr()))
        .unwrap();

    let (invite, source) = stub.expect(&mut agent, "INVITE");

    stub.send(
        &response_for(&invite, 180, "Ringing", Some("bob1"), &[], ""),
        source,
    );

    tick_until(&mut agent, |agent| {
        agent.dialog_state(dialog).unwrap() == DialogState::Early
    });

    agent.cancel_call(dialog).unwrap();

    let (cancel, source) = stub.expect(&mut agent, "CANCEL");

    // the CANCEL reuses the INVITE's branch and CSeq number
    assert_eq!(header(&cancel, "Via"), header(&invite, "Via"));
    assert_eq!(
        header(&cancel, "CSeq").replace("CANCEL", "INVITE"),
        header(&invite, "CSeq")
    );

    assert_eq!(agent.dialog_state(dialog).unwrap(), DialogState::Terminated);

    // answer the CANCEL and fail the INVITE
    stub.send(&response_for(&cancel, 200, "OK", None, &[], ""), source);
    stub.send(
        &response_for(&invite, 487, "Request Terminated", Some("bob1"), &[], ""),
        source,
    );

    // the 487 tears the dialog down without further state changes
    tick_until(&mut agent, |agent| agent.dialog_count() == 0);

    let events = recorder.events();

    assert!(events.contains(&Recorded::DialogState(
        dialog,
        DialogState::Early,
        DialogState::Terminated
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, Recorded::DialogState(_, _, DialogState::Failed))));
}

// Scenario: established call torn down with BYE
#[test]
fn bye_teardown() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    let dialog = agent
        .make_call(&format!("sip:bob@{}", stub.addr()))
        .unwrap();

    let (invite, source) = stub.expect(&mut agent, "INVITE");

    let contact = format!("Contact: <sip:bob@{}>", stub.addr());
    stub.send(
        &response_for(
            &invite,
            200,
            "OK",
            Some("bob1"),
            &[contact, "Content-Type: application/sdp".into()],
            &direct_sdp(40000),
        ),
        source,
    );

    stub.expect(&mut agent, "ACK");

    tick_until(&mut agent, |agent| {
        agent.dialog_state(dialog).unwrap() == DialogState::Confirmed
    });

    agent.hangup(dialog).unwrap();

    let (bye, source) = stub.expect(&mut agent, "BYE");
    assert_eq!(header(&bye, "Call-ID"), header(&invite, "Call-ID"));

    stub.send(&response_for(&bye, 200, "OK", None, &[], ""), source);

    assert_eq!(agent.dialog_count(), 0);

    assert!(recorder.events().contains(&Recorded::DialogState(
        dialog,
        DialogState::Confirmed,
        DialogState::Terminated
    )));
}

// Feeding the same request twice must not diverge any state
#[test]
fn duplicate_invite_is_absorbed() {
    let _ = env_logger::builder().is_test(true).try_init();

    let stub = Stub::new();
    let (mut agent, recorder) = test_agent(stub.addr());

    let agent_target = SocketAddr::new("127.0.0.1".parse().unwrap(), agent.local_addr().port());

    let invite = format!(
        "INVITE sip:alice@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKdup\r\n\
         From: <sip:bob@127.0.0.1>;tag=b1\r\n\
         To: <sip:alice@127.0.0.1>\r\n\
         Call-ID: DUP1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:bob@127.0.0.1:{port}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{sdp}",
        port = stub.addr().port(),
        len = direct_sdp(40000).len(),
        sdp = direct_sdp(40000),
    );

    stub.send(&invite, agent_target);
    stub.send(&invite, agent_target);

    tick_until(&mut agent, |_| {
        !recorder.events().is_empty()
    });

    // give the agent time to process the duplicate as well
    for _ in 0..20 {
        agent.tick(Duration::from_millis(5)).unwrap();
    }

    let incoming_calls = recorder
        .events()
        .iter()
        .filter(|event| matches!(event, Recorded::IncomingCall(..)))
        .count();

    assert_eq!(incoming_calls, 1, "duplicate INVITE created a second call");
    assert_eq!(agent.dialog_count(), 1);
}
