use sip_types::{ParseError, parse_message};
use sip_types::parse::ParsedMessage;

/// Result of classifying one datagram by content
pub enum CompleteItem {
    /// CRLF CRLF keep-alive ping
    KeepAliveRequest,
    /// CRLF keep-alive pong
    KeepAliveResponse,
    /// A STUN message (first-byte class bits and magic cookie matched)
    Stun(Vec<u8>),
    /// A parsed SIP message
    Sip(ParsedMessage),
}

/// Classify a complete datagram.
///
/// Detection is by content, not port: `SIP/2.0` responses and known
/// request lines parse as SIP, STUN is recognized by its leading byte and
/// magic cookie, bare CRLF sequences are keep-alives.
pub fn parse_complete(bytes: &[u8]) -> Result<CompleteItem, ParseError> {
    match bytes {
        b"\r\n\r\n" => return Ok(CompleteItem::KeepAliveRequest),
        b"\r\n" => return Ok(CompleteItem::KeepAliveResponse),
        _ => {}
    }

    if stun_types::is_stun_message(bytes) {
        return Ok(CompleteItem::Stun(bytes.to_vec()));
    }

    parse_message(bytes).map(CompleteItem::Sip)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_keepalive() {
        assert!(matches!(
            parse_complete(b"\r\n\r\n"),
            Ok(CompleteItem::KeepAliveRequest)
        ));
        assert!(matches!(
            parse_complete(b"\r\n"),
            Ok(CompleteItem::KeepAliveResponse)
        ));
    }

    #[test]
    fn classify_sip_response() {
        let item = parse_complete(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();

        let CompleteItem::Sip(message) = item else {
            panic!("expected sip");
        };

        assert!(!message.line.is_request());
    }

    #[test]
    fn classify_stun() {
        let mut stun = vec![0u8; 20];
        stun[4..8].copy_from_slice(&0x2112_A442u32.to_be_bytes());

        assert!(matches!(
            parse_complete(&stun),
            Ok(CompleteItem::Stun(_))
        ));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_complete(b"not a sip message\r\n\r\n").is_err());
    }
}
