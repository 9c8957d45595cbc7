use crate::header::{HeaderError, Name};
use crate::method::Method;
use std::fmt;

/// Value of a CSeq header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }

    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let mut split = value.trim().split_ascii_whitespace();

        let cseq = split
            .next()
            .and_then(|num| num.parse().ok())
            .ok_or(HeaderError::Malformed(Name::CSeq))?;

        let method = split
            .next()
            .and_then(Method::from_token)
            .ok_or(HeaderError::Malformed(Name::CSeq))?;

        if split.next().is_some() {
            return Err(HeaderError::Malformed(Name::CSeq));
        }

        Ok(Self { cseq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let cseq = CSeq::parse("314159 INVITE").unwrap();

        assert_eq!(cseq.cseq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn reject_garbage() {
        assert!(CSeq::parse("INVITE").is_err());
        assert!(CSeq::parse("1 INVITE extra").is_err());
    }
}
