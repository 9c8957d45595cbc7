use crate::UntaggedAddress;
use internal::{IResult, ws};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::map;
use std::fmt;

/// Connection line (`c=`)
#[derive(Debug, Clone)]
pub struct Connection {
    pub address: UntaggedAddress,
}

impl Connection {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(parse_nettype_addr, |address| Connection { address })(i)
    }
}

/// Parse `IN IP4 <addr>` / `IN IP6 <addr>` as used by origin and connection
pub(crate) fn parse_nettype_addr(i: &str) -> IResult<&str, UntaggedAddress> {
    map(
        ws((tag("IN"), alt((tag("IP4"), tag("IP6"))), UntaggedAddress::parse)),
        |(_, _, address)| address,
    )(i)
}

/// Print `IN IP4 <addr>` / `IN IP6 <addr>`
pub(crate) struct NettypeAddr<'a>(pub(crate) &'a UntaggedAddress);

impl fmt::Display for NettypeAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IN {} {}", self.0.addrtype(), self.0)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c={}", NettypeAddr(&self.address))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let (rem, connection) = Connection::parse("IN IP4 127.0.0.1").unwrap();

        assert!(rem.is_empty());
        assert_eq!(
            connection.address,
            UntaggedAddress::IpAddress("127.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn roundtrip() {
        let (_, connection) = Connection::parse("IN IP4 10.1.2.3").unwrap();

        assert_eq!(connection.to_string(), "c=IN IP4 10.1.2.3");
    }
}
