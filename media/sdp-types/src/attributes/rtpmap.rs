use crate::{not_whitespace, slash_num};
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt};
use nom::sequence::tuple;
use std::fmt;
use std::str::FromStr;

/// Rtpmap attribute (`a=rtpmap`)
///
/// Maps an RTP payload number of the media description to an encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload: u8,
    pub encoding: BytesStr,
    pub clock_rate: u32,
    /// Encoding parameters (channel count for audio)
    pub params: Option<u32>,
}

impl RtpMap {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                map_res(digit1, u8::from_str),
                ws((map(
                    take_while1(|c: char| not_whitespace(c) && c != '/'),
                    BytesStr::from,
                ),)),
                nom::sequence::preceded(char('/'), map_res(digit1, u32::from_str)),
                opt(slash_num),
            )),
            |(payload, (encoding,), clock_rate, params)| RtpMap {
                payload,
                encoding,
                clock_rate,
                params,
            },
        )(i)
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.payload, self.encoding, self.clock_rate)?;

        if let Some(params) = self.params {
            write!(f, "/{params}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rtpmap() {
        let (rem, rtpmap) = RtpMap::parse("0 PCMU/8000").unwrap();

        assert!(rem.is_empty());
        assert_eq!(rtpmap.payload, 0);
        assert_eq!(rtpmap.encoding, "PCMU");
        assert_eq!(rtpmap.clock_rate, 8000);
        assert_eq!(rtpmap.params, None);
    }

    #[test]
    fn rtpmap_channels() {
        let (_, rtpmap) = RtpMap::parse("111 opus/48000/2").unwrap();

        assert_eq!(rtpmap.payload, 111);
        assert_eq!(rtpmap.params, Some(2));
    }

    #[test]
    fn rtpmap_print() {
        let rtpmap = RtpMap {
            payload: 8,
            encoding: "PCMA".into(),
            clock_rate: 8000,
            params: None,
        };

        assert_eq!(rtpmap.to_string(), "8 PCMA/8000");
    }
}
