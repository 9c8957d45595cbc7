#![deny(unsafe_code)]

//! Core of the lark SIP stack.
//!
//! Provides the unified packet [`transport`] and the RFC 3261
//! [`transaction`] layer, tied together by [`SipCore`]. The crate is
//! sans-io in spirit: a single blocking [`SipCore::tick`] drives socket
//! reads, retransmission timers and transaction state, surfacing anything
//! of interest as [`CoreEvent`]s.

use bytes::Bytes;
use bytesstr::BytesStr;
use sip_types::header::typed::{CSeq, FromTo, Via};
use sip_types::msg::{RequestLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{HeaderError, Headers, Method, Name};
use std::fmt;
use std::net::SocketAddr;

mod core;
mod error;
pub mod transaction;
pub mod transport;

pub use core::SipCore;
pub use error::{Error, Result};
pub use transaction::{TsxKey, TsxResponse};

/// Basic request
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Create an empty request
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            line: RequestLine { method, uri },
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Basic response
#[derive(Debug, Clone)]
pub struct Response {
    pub line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Headers that are part of every SIP message
#[derive(Debug, Clone)]
pub struct BaseHeaders {
    /// All Via headers, guaranteed non-empty
    pub via: Vec<Via>,
    pub from: FromTo,
    pub to: FromTo,
    pub call_id: BytesStr,
    pub cseq: CSeq,
}

impl BaseHeaders {
    pub fn extract_from(headers: &Headers) -> Result<Self, HeaderError> {
        let mut via = vec![];

        for value in headers.get_all(&Name::Via) {
            for part in sip_types::header::split_commas(value) {
                via.push(Via::parse(part)?);
            }
        }

        if via.is_empty() {
            return Err(HeaderError::Missing(Name::Via));
        }

        let from = FromTo::parse(&Name::From, headers.get_required(&Name::From)?)?;
        let to = FromTo::parse(&Name::To, headers.get_required(&Name::To)?)?;
        let call_id = headers.get_required(&Name::CallId)?.clone();
        let cseq = CSeq::parse(headers.get_required(&Name::CSeq)?)?;

        Ok(BaseHeaders {
            via,
            from,
            to,
            call_id,
            cseq,
        })
    }
}

/// Request received by the core and handed to the next layer.
///
/// Unless the method is ACK, a matching server transaction exists under
/// `tsx_key` and must be answered through [`SipCore::respond`].
#[derive(Debug)]
pub struct IncomingRequest {
    pub tsx_key: TsxKey,
    pub line: RequestLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
    pub source: SocketAddr,
}

impl fmt::Display for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Events produced by [`SipCore::tick`]
#[derive(Debug)]
pub enum CoreEvent {
    /// A request outside of any existing transaction
    Request(IncomingRequest),
    /// A response arrived inside a client transaction
    Response {
        tsx_key: TsxKey,
        response: TsxResponse,
    },
    /// A client transaction timed out (timer B/F), or a server INVITE
    /// transaction gave up waiting for an ACK
    TsxTimeout { tsx_key: TsxKey },
    /// Streaming transport connect finished or the connection dropped
    TransportConnected { ok: bool },
    /// Transport hit a non-recoverable error
    TransportError { error: String },
}
