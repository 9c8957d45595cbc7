use crate::header::{HeaderError, Name};
use crate::uri::{NameAddr, Params};
use internal::Finish;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// Value of a Contact header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub addr: NameAddr,
    pub params: Params,
}

impl Contact {
    pub fn new(addr: NameAddr) -> Self {
        Self {
            addr,
            params: Params::new(),
        }
    }

    /// The `expires` contact parameter, if present and well-formed
    pub fn expires(&self) -> Option<u32> {
        self.params.get_val("expires")?.parse().ok()
    }

    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let (rem, contact) = map(
            tuple((NameAddr::parse, Params::parse)),
            |(addr, params)| Contact { addr, params },
        )(value.trim())
        .finish()
        .map_err(|_| HeaderError::Malformed(Name::Contact))?;

        if !rem.trim().is_empty() {
            return Err(HeaderError::Malformed(Name::Contact));
        }

        Ok(contact)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.addr, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_with_expires() {
        let contact = Contact::parse("<sip:alice@10.0.0.1:5062>;expires=3600").unwrap();

        assert_eq!(contact.expires(), Some(3600));
        assert_eq!(contact.addr.uri.host_port.port, Some(5062));
    }

    #[test]
    fn roundtrip() {
        let input = "<sip:bob@192.168.0.5:5060;transport=udp>";
        let contact = Contact::parse(input).unwrap();

        assert_eq!(contact.to_string(), input);
    }
}
