use crate::host::HostPort;
use bytesstr::BytesStr;
use internal::IResult;
use nom::Finish;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;
use std::str::FromStr;

mod name_addr;
mod params;

pub use name_addr::NameAddr;
pub use params::{Param, Params};

/// A `sip:` / `sips:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<BytesStr>,
    pub host_port: HostPort,
    pub params: Params,
    /// Raw `?`-headers part, kept verbatim
    pub headers: Option<BytesStr>,
}

impl SipUri {
    pub fn new(host_port: HostPort) -> Self {
        Self {
            sips: false,
            user: None,
            host_port,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn user<U>(mut self, user: U) -> Self
    where
        U: Into<BytesStr>,
    {
        self.user = Some(user.into());
        self
    }

    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                alt((map(tag("sips:"), |_| true), map(tag("sip:"), |_| false))),
                opt(terminated(take_while1(user_char), char('@'))),
                HostPort::parse,
                Params::parse,
                opt(preceded(char('?'), take_while1(|c| c != ' ' && c != '>'))),
            )),
            |(sips, user, host_port, params, headers)| SipUri {
                sips,
                user: user.map(BytesStr::from),
                host_port,
                params,
                headers: headers.map(BytesStr::from),
            },
        )(i)
    }

    /// Parse an addr-spec without consuming trailing `;` parameters.
    ///
    /// Used for un-bracketed URIs in From/To/Contact, where parameters
    /// belong to the header rather than the URI.
    pub(crate) fn parse_without_params(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                alt((map(tag("sips:"), |_| true), map(tag("sip:"), |_| false))),
                opt(terminated(take_while1(user_char), char('@'))),
                HostPort::parse,
            )),
            |(sips, user, host_port)| SipUri {
                sips,
                user: user.map(BytesStr::from),
                host_port,
                params: Params::new(),
                headers: None,
            },
        )(i)
    }
}

fn user_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '&' | '=' | '+' | '$' | ',' | '%'
        )
}

impl FromStr for SipUri {
    type Err = crate::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rem, uri) = Self::parse(s.trim())
            .finish()
            .map_err(|_| crate::ParseError::InvalidUri)?;

        if !rem.is_empty() {
            return Err(crate::ParseError::InvalidUri);
        }

        Ok(uri)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.sips { "sips:" } else { "sip:" })?;

        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }

        self.host_port.fmt(f)?;
        self.params.fmt(f)?;

        if let Some(headers) = &self.headers {
            write!(f, "?{headers}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;

    #[test]
    fn parse_full() {
        let uri: SipUri = "sip:alice@example.com:5080;transport=tcp".parse().unwrap();

        assert!(!uri.sips);
        assert_eq!(uri.user.unwrap(), "alice");
        assert_eq!(
            uri.host_port.host,
            Host::Name(BytesStr::from_static("example.com"))
        );
        assert_eq!(uri.host_port.port, Some(5080));
        assert_eq!(uri.params.get_val("transport").unwrap(), "tcp");
    }

    #[test]
    fn parse_no_user() {
        let uri: SipUri = "sip:127.0.0.1".parse().unwrap();

        assert_eq!(uri.user, None);
        assert_eq!(uri.host_port.host, Host::Ip("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn roundtrip() {
        let input = "sips:bob@10.0.0.1:5061;lr";
        let uri: SipUri = input.parse().unwrap();

        assert_eq!(uri.to_string(), input);
    }

    #[test]
    fn reject_trailing_garbage() {
        assert!("sip:bob@example.com whoops".parse::<SipUri>().is_err());
        assert!("mailto:bob@example.com".parse::<SipUri>().is_err());
    }
}
