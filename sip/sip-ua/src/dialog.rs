use bytesstr::BytesStr;
use media::MediaSession;
use sip_core::{IncomingRequest, Request, TsxKey};
use sip_types::header::typed::FromTo;
use sip_types::uri::SipUri;
use sip_types::{Method, Name};
use slotmap::new_key_type;
use std::fmt;
use std::net::SocketAddr;

new_key_type! {
    /// Stable handle to a dialog inside the agent's arena
    pub struct DialogId;
}

/// Who initiated the call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Call leg state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Null,
    Calling,
    Incoming,
    Early,
    Confirmed,
    Terminated,
    Failed,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DialogState::Null => "null",
            DialogState::Calling => "calling",
            DialogState::Incoming => "incoming",
            DialogState::Early => "early",
            DialogState::Confirmed => "confirmed",
            DialogState::Terminated => "terminated",
            DialogState::Failed => "failed",
        };

        f.write_str(name)
    }
}

/// One call leg: the SIP dialog identifiers, the transactions the agent
/// explicitly retains and the owned media session
pub(crate) struct Dialog {
    pub(crate) call_id: BytesStr,
    pub(crate) local: FromTo,
    pub(crate) remote: FromTo,
    pub(crate) direction: CallDirection,
    pub(crate) state: DialogState,

    /// Request target for in-dialog requests, from the peer's Contact
    pub(crate) remote_target: Option<SipUri>,
    /// Where requests of this dialog go on the wire
    pub(crate) target_addr: SocketAddr,

    pub(crate) local_cseq: u32,

    /// UAC INVITE transaction, kept for CANCEL
    pub(crate) invite_tsx: Option<TsxKey>,
    /// Copy of the sent INVITE, used for CANCEL and digest retries
    pub(crate) invite_request: Option<Request>,
    pub(crate) authenticator: sip_auth::DigestAuthenticator,
    /// UAS INVITE transaction, kept for the final response and ACK
    pub(crate) server_inv_tsx: Option<TsxKey>,
    /// The unanswered incoming INVITE
    pub(crate) incoming_invite: Option<IncomingRequest>,

    /// ACK of the final 2xx, resent on retransmitted 2xx
    pub(crate) last_ack: Option<Request>,

    pub(crate) media: MediaSession,
    pub(crate) remote_sdp_reported: bool,
    /// The application asked to answer; the 200 goes out once the local
    /// SDP is ready
    pub(crate) answer_requested: bool,
    /// A CANCEL is in flight, the pending 487 is absorbed quietly
    pub(crate) cancelled: bool,
    /// The INVITE was already re-sent with credentials once
    pub(crate) authenticated: bool,
}

impl Dialog {
    /// Next CSeq number for an in-dialog request
    pub(crate) fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Build an in-dialog request (BYE, ACK for 2xx)
    pub(crate) fn create_request(&mut self, method: Method) -> Request {
        let uri = self
            .remote_target
            .clone()
            .unwrap_or_else(|| self.remote.addr.uri.clone());

        let cseq = if method == Method::Ack {
            // the ACK of a 2xx uses the CSeq number of the INVITE
            self.local_cseq
        } else {
            self.next_cseq()
        };

        let mut request = Request::new(method.clone(), uri);

        request
            .headers
            .insert(Name::From, self.local.to_string());
        request.headers.insert(Name::To, self.remote.to_string());
        request
            .headers
            .insert(Name::CallId, self.call_id.clone());
        request
            .headers
            .insert(Name::CSeq, format!("{cseq} {method}"));
        request.headers.insert(Name::MaxForwards, "70");

        request
    }

    /// Matches responses/requests of this dialog by Call-ID
    pub(crate) fn matches_call_id(&self, call_id: &str) -> bool {
        self.call_id == call_id
    }
}
