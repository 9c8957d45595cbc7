use crate::header::{HeaderError, Name};
use crate::uri::{NameAddr, Params};
use bytesstr::BytesStr;
use internal::Finish;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// Value of a From or To header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromTo {
    pub addr: NameAddr,
    pub params: Params,
}

impl FromTo {
    pub fn new(addr: NameAddr) -> Self {
        Self {
            addr,
            params: Params::new(),
        }
    }

    pub fn with_tag<T>(addr: NameAddr, tag: T) -> Self
    where
        T: Into<BytesStr>,
    {
        let mut this = Self::new(addr);
        this.set_tag(tag);
        this
    }

    pub fn tag(&self) -> Option<&BytesStr> {
        self.params.get_val("tag")
    }

    pub fn set_tag<T>(&mut self, tag: T)
    where
        T: Into<BytesStr>,
    {
        self.params.push_or_edit("tag", tag.into());
    }

    pub fn parse(name: &Name, value: &str) -> Result<Self, HeaderError> {
        let (rem, from_to) = map(
            tuple((NameAddr::parse, Params::parse)),
            |(addr, params)| FromTo { addr, params },
        )(value.trim())
        .finish()
        .map_err(|_| HeaderError::Malformed(name.clone()))?;

        if !rem.trim().is_empty() {
            return Err(HeaderError::Malformed(name.clone()));
        }

        Ok(from_to)
    }
}

impl From<NameAddr> for FromTo {
    fn from(addr: NameAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for FromTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.addr, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_with_tag() {
        let from = FromTo::parse(&Name::From, "\"Alice\" <sip:alice@example.com>;tag=88sja8x").unwrap();

        assert_eq!(from.tag().unwrap(), "88sja8x");
        assert_eq!(from.addr.uri.user.as_ref().unwrap(), "alice");
    }

    #[test]
    fn parse_bare_uri_tag() {
        let to = FromTo::parse(&Name::To, "sip:bob@10.0.0.2;tag=1").unwrap();

        assert_eq!(to.tag().unwrap(), "1");
        assert!(to.addr.uri.params.is_empty());
    }

    #[test]
    fn set_tag_roundtrip() {
        let mut to = FromTo::new(NameAddr::uri("sip:bob@example.com".parse().unwrap()));
        assert_eq!(to.tag(), None);

        to.set_tag("abcd");
        assert_eq!(to.to_string(), "<sip:bob@example.com>;tag=abcd");
    }
}
