//! Request / status lines of a SIP message

use crate::code::StatusCode;
use crate::method::Method;
use crate::uri::SipUri;
use bytesstr::BytesStr;
use std::fmt;

/// First line of a request
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// First line of a response
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Option<BytesStr>,
}

impl StatusLine {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            reason: code.text().map(BytesStr::from_static),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code)?;

        if let Some(reason) = &self.reason {
            write!(f, " {reason}")?;
        }

        Ok(())
    }
}

/// First line of any SIP message
#[derive(Debug, Clone)]
pub enum MessageLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl MessageLine {
    pub fn is_request(&self) -> bool {
        matches!(self, MessageLine::Request(_))
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLine::Request(line) => line.fmt(f),
            MessageLine::Response(line) => line.fmt(f),
        }
    }
}
