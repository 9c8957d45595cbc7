use crate::header::{HeaderError, Name};
use crate::host::HostPort;
use crate::uri::{Param, Params};
use bytesstr::BytesStr;
use internal::{Finish, IResult, ws};
use nom::bytes::complete::{tag, take_while1};
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// A single Via header field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: BytesStr,
    pub sent_by: HostPort,
    pub params: Params,
}

impl Via {
    /// Create a Via with the given branch parameter
    pub fn new<T, B>(transport: T, sent_by: HostPort, branch: B) -> Self
    where
        T: Into<BytesStr>,
        B: Into<BytesStr>,
    {
        let mut params = Params::new();
        params.push(Param::value("branch", branch.into()));

        Via {
            transport: transport.into(),
            sent_by,
            params,
        }
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get_val("branch")
    }

    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let (rem, via) = parse_via(value)
            .finish()
            .map_err(|_| HeaderError::Malformed(Name::Via))?;

        if !rem.trim().is_empty() {
            return Err(HeaderError::Malformed(Name::Via));
        }

        Ok(via)
    }
}

fn parse_via(i: &str) -> IResult<&str, Via> {
    map(
        tuple((
            ws((
                tag("SIP"),
                tag("/"),
                tag("2.0"),
                tag("/"),
                take_while1(|c: char| c.is_ascii_alphanumeric()),
            )),
            ws((HostPort::parse,)),
            Params::parse,
        )),
        |((_, _, _, _, transport), (sent_by,), params)| Via {
            transport: BytesStr::from(transport),
            sent_by,
            params,
        },
    )(i)
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;

    #[test]
    fn parse_with_rport() {
        let via = Via::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc;rport").unwrap();

        assert_eq!(via.transport, "UDP");
        assert_eq!(via.sent_by.host, Host::Ip("10.0.0.1".parse().unwrap()));
        assert_eq!(via.branch().unwrap(), "z9hG4bKabc");
        assert!(via.params.contains("rport"));
    }

    #[test]
    fn roundtrip() {
        let input = "SIP/2.0/TCP example.com;branch=z9hG4bKxyz";
        let via = Via::parse(input).unwrap();

        assert_eq!(via.to_string(), input);
    }

    #[test]
    fn reject_wrong_version() {
        assert!(Via::parse("SIP/1.0/UDP host").is_err());
    }
}
