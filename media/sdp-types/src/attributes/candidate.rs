use crate::not_whitespace;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, opt};
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address as it appears in candidate, origin and connection lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedAddress {
    Fqdn(BytesStr),
    IpAddress(IpAddr),
}

impl UntaggedAddress {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(take_while1(not_whitespace), |token: &str| {
            match IpAddr::from_str(token) {
                Ok(ip) => UntaggedAddress::IpAddress(ip),
                Err(_) => UntaggedAddress::Fqdn(BytesStr::from(token)),
            }
        })(i)
    }

    /// `IP4` / `IP6` addrtype token for nettype lines
    pub(crate) fn addrtype(&self) -> &'static str {
        match self {
            UntaggedAddress::IpAddress(IpAddr::V6(_)) => "IP6",
            _ => "IP4",
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            UntaggedAddress::IpAddress(ip) => Some(*ip),
            UntaggedAddress::Fqdn(_) => None,
        }
    }
}

impl fmt::Display for UntaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntaggedAddress::Fqdn(name) => f.write_str(name),
            UntaggedAddress::IpAddress(ip) => write!(f, "{ip}"),
        }
    }
}

/// Candidate attribute (`a=candidate`), RFC 8839 grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: BytesStr,
    pub component: u8,
    pub transport: BytesStr,
    pub priority: u64,
    pub address: UntaggedAddress,
    pub port: u16,
    /// `host`, `srflx`, `prflx` or `relay`
    pub typ: BytesStr,
    pub rel_addr: Option<UntaggedAddress>,
    pub rel_port: Option<u16>,
}

impl IceCandidate {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                ws((
                    take_while1(not_whitespace),
                    map_res(digit1, u8::from_str),
                    take_while1(not_whitespace),
                    map_res(digit1, u64::from_str),
                    UntaggedAddress::parse,
                )),
                ws((map_res(digit1, u16::from_str),)),
                ws((preceded(tuple((tag("typ"), tag(" "))), take_while1(not_whitespace)),)),
                opt(ws((preceded(
                    tuple((tag("raddr"), tag(" "))),
                    UntaggedAddress::parse,
                ),))),
                opt(ws((preceded(
                    tuple((tag("rport"), tag(" "))),
                    map_res(digit1, u16::from_str),
                ),))),
            )),
            |(
                (foundation, component, transport, priority, address),
                (port,),
                (typ,),
                rel_addr,
                rel_port,
            )| {
                IceCandidate {
                    foundation: BytesStr::from(foundation),
                    component,
                    transport: BytesStr::from(transport),
                    priority,
                    address,
                    port,
                    typ: BytesStr::from(typ),
                    rel_addr: rel_addr.map(|(addr,)| addr),
                    rel_port: rel_port.map(|(port,)| port),
                }
            },
        )(i)
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.typ
        )?;

        if let Some(rel_addr) = &self.rel_addr {
            write!(f, " raddr {rel_addr}")?;
        }

        if let Some(rel_port) = self.rel_port {
            write!(f, " rport {rel_port}")?;
        }

        Ok(())
    }
}
