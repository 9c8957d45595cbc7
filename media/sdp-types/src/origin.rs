use crate::{UntaggedAddress, not_whitespace};
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while1;
use nom::character::complete::digit1;
use nom::combinator::{map, map_res};
use std::fmt;
use std::str::FromStr;

/// Origin line (`o=`)
#[derive(Debug, Clone)]
pub struct Origin {
    pub username: BytesStr,
    pub session_id: u64,
    pub session_version: u64,
    pub address: UntaggedAddress,
}

impl Origin {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            ws((
                take_while1(not_whitespace),
                map_res(digit1, u64::from_str),
                map_res(digit1, u64::from_str),
                crate::connection::parse_nettype_addr,
            )),
            |(username, session_id, session_version, address)| Origin {
                username: BytesStr::from(username),
                session_id,
                session_version,
                address,
            },
        )(i)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "o={} {} {} {}",
            self.username,
            self.session_id,
            self.session_version,
            crate::connection::NettypeAddr(&self.address)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let (rem, origin) = Origin::parse("- 1687425326 1 IN IP4 192.168.1.5").unwrap();

        assert!(rem.is_empty());
        assert_eq!(origin.username, "-");
        assert_eq!(origin.session_id, 1687425326);
        assert_eq!(origin.session_version, 1);
        assert_eq!(
            origin.address,
            UntaggedAddress::IpAddress("192.168.1.5".parse().unwrap())
        );
    }

    #[test]
    fn print() {
        let origin = Origin {
            username: "-".into(),
            session_id: 42,
            session_version: 2,
            address: UntaggedAddress::IpAddress("10.0.0.1".parse().unwrap()),
        };

        assert_eq!(origin.to_string(), "o=- 42 2 IN IP4 10.0.0.1");
    }
}
