use crate::not_whitespace;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while1;
use nom::character::complete::digit1;
use nom::combinator::{map, map_res};
use nom::multi::many1;
use std::fmt;
use std::str::FromStr;

/// Type of a media stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Other(BytesStr),
}

impl MediaType {
    fn from_token(token: &str) -> Self {
        match token {
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            other => MediaType::Other(BytesStr::from(other)),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
            MediaType::Other(other) => f.write_str(other),
        }
    }
}

/// Transport protocol of a media stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportProtocol {
    RtpAvp,
    Other(BytesStr),
}

impl TransportProtocol {
    fn from_token(token: &str) -> Self {
        match token {
            "RTP/AVP" => TransportProtocol::RtpAvp,
            other => TransportProtocol::Other(BytesStr::from(other)),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::RtpAvp => f.write_str("RTP/AVP"),
            TransportProtocol::Other(other) => f.write_str(other),
        }
    }
}

/// Media line (`m=`)
#[derive(Debug, Clone)]
pub struct Media {
    pub media_type: MediaType,
    pub port: u16,
    pub proto: TransportProtocol,
    /// RTP payload numbers
    pub fmts: Vec<u8>,
}

impl Media {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            ws((
                map(take_while1(not_whitespace), MediaType::from_token),
                map_res(digit1, u16::from_str),
                map(take_while1(not_whitespace), TransportProtocol::from_token),
                many1(ws((map_res(digit1, u8::from_str),))),
            )),
            |(media_type, port, proto, fmts)| Media {
                media_type,
                port,
                proto,
                fmts: fmts.into_iter().map(|(fmt,)| fmt).collect(),
            },
        )(i)
    }
}

impl fmt::Display for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.media_type, self.port, self.proto)?;

        for fmt in &self.fmts {
            write!(f, " {fmt}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let (rem, media) = Media::parse("audio 40000 RTP/AVP 0 8 101").unwrap();

        assert!(rem.is_empty());
        assert_eq!(media.media_type, MediaType::Audio);
        assert_eq!(media.port, 40000);
        assert_eq!(media.proto, TransportProtocol::RtpAvp);
        assert_eq!(media.fmts, vec![0, 8, 101]);
    }

    #[test]
    fn roundtrip() {
        let input = "m=video 51000 RTP/AVP 96";
        let (_, media) = Media::parse(&input[2..]).unwrap();

        assert_eq!(media.to_string(), input);
    }
}
