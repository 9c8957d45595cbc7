use bytesstr::BytesStr;
use internal::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt};
use nom::sequence::{delimited, preceded, tuple};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Either a DNS name or an IP address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Name(BytesStr),
    Ip(IpAddr),
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Host::Ip(ip)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Name(name) => f.write_str(name),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{ip}"),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
        }
    }
}

/// Host with an optional port, as it appears in URIs and Via headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// The port, or the SIP default port 5060
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((parse_host, opt(preceded(char(':'), parse_port)))),
            |(host, port)| HostPort { host, port },
        )(i)
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().into(),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

fn parse_port(i: &str) -> IResult<&str, u16> {
    map_res(digit1, FromStr::from_str)(i)
}

fn host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')
}

fn parse_host(i: &str) -> IResult<&str, Host> {
    alt((
        // IPv6 reference
        map(
            map_res(
                delimited(tag("["), take_while1(|c: char| c != ']'), tag("]")),
                Ipv6Addr::from_str,
            ),
            |ip| Host::Ip(ip.into()),
        ),
        // IPv4 or name; names may start with a digit so try the address first
        map(take_while1(host_char), |name: &str| {
            match IpAddr::from_str(name) {
                Ok(ip) => Host::Ip(ip),
                Err(_) => Host::Name(BytesStr::from(name)),
            }
        }),
    ))(i)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_name_with_port() {
        let (rem, hp) = HostPort::parse("example.com:5080;x=y").unwrap();

        assert_eq!(rem, ";x=y");
        assert_eq!(hp.host, Host::Name(BytesStr::from_static("example.com")));
        assert_eq!(hp.port, Some(5080));
    }

    #[test]
    fn parse_ipv4() {
        let (rem, hp) = HostPort::parse("192.168.1.2").unwrap();

        assert!(rem.is_empty());
        assert_eq!(hp.host, Host::Ip("192.168.1.2".parse().unwrap()));
        assert_eq!(hp.port, None);
        assert_eq!(hp.port_or_default(), 5060);
    }

    #[test]
    fn parse_ipv6_roundtrip() {
        let (_, hp) = HostPort::parse("[::1]:5060").unwrap();

        assert_eq!(hp.host, Host::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(hp.to_string(), "[::1]:5060");
    }
}
