mod candidate;
mod direction;
mod ice;
mod rtpmap;

pub use candidate::{IceCandidate, UntaggedAddress};
pub use direction::Direction;
pub use ice::{IcePassword, IceUsernameFragment};
pub use rtpmap::RtpMap;

use bytesstr::BytesStr;
use std::fmt;

/// An attribute that is not interpreted by this crate (`a=name` or
/// `a=name:value`)
#[derive(Debug, Clone)]
pub struct UnknownAttribute {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl UnknownAttribute {
    pub(crate) fn parse(line: &str) -> Self {
        match line.split_once(':') {
            Some((name, value)) => Self {
                name: BytesStr::from(name),
                value: Some(BytesStr::from(value)),
            },
            None => Self {
                name: BytesStr::from(line),
                value: None,
            },
        }
    }
}

impl fmt::Display for UnknownAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a={}", self.name)?;

        if let Some(value) = &self.value {
            write!(f, ":{value}")?;
        }

        Ok(())
    }
}
