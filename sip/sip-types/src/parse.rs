use crate::code::StatusCode;
use crate::header::{Headers, Name};
use crate::method::Method;
use crate::msg::{MessageLine, RequestLine, StatusLine};
use bytes::Bytes;
use bytesstr::BytesStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is not SIP")]
    NotSip,
    #[error("malformed first line")]
    InvalidLine,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("malformed uri")]
    InvalidUri,
    #[error("message head is not valid utf8")]
    Utf8,
}

/// A SIP message parsed from a single datagram or framed stream segment
#[derive(Debug)]
pub struct ParsedMessage {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Bytes,
}

/// Parse a complete SIP message.
///
/// The head must be terminated by an empty line; everything after it is the
/// body, truncated to Content-Length when the header is present and smaller
/// than the remaining bytes.
pub fn parse_message(bytes: &[u8]) -> Result<ParsedMessage, ParseError> {
    let (head, body) = match find_head_end(bytes) {
        Some(at) => (&bytes[..at], &bytes[at + 4..]),
        None => (bytes, &[][..]),
    };

    let head = std::str::from_utf8(head).map_err(|_| ParseError::Utf8)?;

    let mut lines = head.split("\r\n");

    let first = lines.next().ok_or(ParseError::NotSip)?;
    let line = parse_first_line(first)?;

    let mut headers = Headers::with_capacity(8);

    for line in lines {
        if line.is_empty() {
            continue;
        }

        // folded continuation lines are obsolete (RFC 3261 section 7.3.1)
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::InvalidHeader);
        }

        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        headers.insert(Name::from_wire(name), BytesStr::from(value.trim()));
    }

    let body_len = headers
        .get(&Name::ContentLength)
        .and_then(|value| value.parse::<usize>().ok())
        .map(|len| len.min(body.len()))
        .unwrap_or(body.len());

    Ok(ParsedMessage {
        line,
        headers,
        body: Bytes::copy_from_slice(&body[..body_len]),
    })
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_first_line(line: &str) -> Result<MessageLine, ParseError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, Some(reason)),
            None => (rest, None),
        };

        let code = code
            .parse()
            .ok()
            .and_then(StatusCode::new)
            .ok_or(ParseError::InvalidLine)?;

        return Ok(MessageLine::Response(StatusLine {
            code,
            reason: reason.map(BytesStr::from),
        }));
    }

    // request line: Method SP Request-URI SP SIP/2.0
    let rest = line.strip_suffix(" SIP/2.0").ok_or(ParseError::NotSip)?;

    let (method, uri) = rest.split_once(' ').ok_or(ParseError::InvalidLine)?;

    let method = Method::from_token(method).ok_or(ParseError::NotSip)?;

    let uri = uri.parse().map_err(|_| ParseError::InvalidUri)?;

    Ok(MessageLine::Request(RequestLine { method, uri }))
}

#[cfg(test)]
mod test {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc\r\n\
        From: <sip:alice@example.com>;tag=1\r\n\
        To: <sip:alice@example.com>\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 1 REGISTER\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn parse_request() {
        let msg = parse_message(REGISTER).unwrap();

        let MessageLine::Request(line) = msg.line else {
            panic!("expected request");
        };

        assert_eq!(line.method, Method::Register);
        assert_eq!(msg.headers.get(&Name::CallId).unwrap(), "a84b4c76e66710");
        assert!(msg.body.is_empty());
    }

    #[test]
    fn parse_response_with_body() {
        let bytes = b"SIP/2.0 200 OK\r\n\
            Content-Type: application/sdp\r\n\
            Content-Length: 4\r\n\
            \r\nv=0\n";

        let msg = parse_message(bytes).unwrap();

        let MessageLine::Response(line) = msg.line else {
            panic!("expected response");
        };

        assert_eq!(line.code, StatusCode::OK);
        assert_eq!(&msg.body[..], b"v=0\n");
    }

    #[test]
    fn content_length_truncates_body() {
        let bytes = b"SIP/2.0 200 OK\r\nContent-Length: 2\r\n\r\nabcdef";
        let msg = parse_message(bytes).unwrap();

        assert_eq!(&msg.body[..], b"ab");
    }

    #[test]
    fn garbage_is_not_sip() {
        assert!(matches!(
            parse_message(b"hello world\r\n\r\n"),
            Err(ParseError::NotSip)
        ));
    }

    #[test]
    fn duplicate_parse_is_deterministic() {
        let first = parse_message(REGISTER).unwrap();
        let second = parse_message(REGISTER).unwrap();

        assert_eq!(
            first.headers.get(&Name::CSeq).unwrap(),
            second.headers.get(&Name::CSeq).unwrap()
        );
    }
}
