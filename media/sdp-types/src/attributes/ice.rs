use crate::ice_char;
use bytesstr::BytesStr;
use internal::IResult;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use std::fmt;

/// `a=ice-ufrag` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceUsernameFragment {
    pub ufrag: BytesStr,
}

impl IceUsernameFragment {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(take_while1(ice_char), |ufrag: &str| IceUsernameFragment {
            ufrag: BytesStr::from(ufrag),
        })(i)
    }
}

impl fmt::Display for IceUsernameFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=ice-ufrag:{}", self.ufrag)
    }
}

/// `a=ice-pwd` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcePassword {
    pub pwd: BytesStr,
}

impl IcePassword {
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(take_while1(ice_char), |pwd: &str| IcePassword {
            pwd: BytesStr::from(pwd),
        })(i)
    }
}

impl fmt::Display for IcePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=ice-pwd:{}", self.pwd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ufrag() {
        let (rem, ufrag) = IceUsernameFragment::parse("aB3+").unwrap();

        assert!(rem.is_empty());
        assert_eq!(ufrag.ufrag, "aB3+");
        assert_eq!(ufrag.to_string(), "a=ice-ufrag:aB3+");
    }

    #[test]
    fn pwd() {
        let (_, pwd) = IcePassword::parse("asd90238japaskjdi238/aa").unwrap();

        assert_eq!(pwd.pwd, "asd90238japaskjdi238/aa");
    }
}
