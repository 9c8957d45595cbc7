use super::SipUri;
use bytesstr::BytesStr;
use internal::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{delimited, terminated, tuple};
use std::fmt;

/// URI with an optional display name, as used in From, To and Contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<BytesStr>,
    pub uri: SipUri,
}

impl NameAddr {
    pub fn new<N>(display_name: N, uri: SipUri) -> Self
    where
        N: Into<BytesStr>,
    {
        Self {
            display_name: Some(display_name.into()),
            uri,
        }
    }

    pub fn uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
        }
    }

    /// Parse either `"Name" <uri>`, `Name <uri>`, `<uri>` or a bare `uri`.
    ///
    /// The bare form cannot carry URI parameters, any `;` after it belongs
    /// to the header (RFC 3261 section 20.10), so the returned URI's params
    /// stay empty in that case.
    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        alt((
            map(
                tuple((opt(parse_display_name), parse_bracketed_uri)),
                |(display_name, uri)| NameAddr { display_name, uri },
            ),
            // addr-spec form without brackets; parameters after a bare URI
            // belong to the header and are left unparsed here
            map(SipUri::parse_without_params, |uri| NameAddr {
                display_name: None,
                uri,
            }),
        ))(i)
    }
}

fn parse_bracketed_uri(i: &str) -> IResult<&str, SipUri> {
    delimited(char('<'), SipUri::parse, char('>'))(i)
}

fn parse_display_name(i: &str) -> IResult<&str, BytesStr> {
    map(
        terminated(
            alt((
                delimited(tag("\""), take_while(|c| c != '"'), tag("\"")),
                take_while1(|c: char| {
                    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ' ')
                }),
            )),
            take_while(|c| c == ' '),
        ),
        |name: &str| BytesStr::from(name.trim_end()),
    )(i)
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "\"{display_name}\" ")?;
        }

        write!(f, "<{}>", self.uri)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_quoted_display_name() {
        let (rem, addr) = NameAddr::parse("\"Alice Example\" <sip:alice@example.com>;tag=1").unwrap();

        assert_eq!(rem, ";tag=1");
        assert_eq!(addr.display_name.unwrap(), "Alice Example");
        assert_eq!(addr.uri.user.as_ref().unwrap(), "alice");
    }

    #[test]
    fn parse_unquoted_display_name() {
        let (_, addr) = NameAddr::parse("Bob <sip:bob@example.com>").unwrap();

        assert_eq!(addr.display_name.unwrap(), "Bob");
    }

    #[test]
    fn parse_bare_uri_leaves_header_params() {
        let (rem, addr) = NameAddr::parse("sip:carol@10.1.1.1;tag=xyz").unwrap();

        assert_eq!(rem, ";tag=xyz");
        assert!(addr.uri.params.is_empty());
        assert_eq!(addr.display_name, None);
    }

    #[test]
    fn bracketed_uri_keeps_uri_params() {
        let (rem, addr) = NameAddr::parse("<sip:carol@10.1.1.1;transport=udp>;tag=xyz").unwrap();

        assert_eq!(rem, ";tag=xyz");
        assert_eq!(addr.uri.params.get_val("transport").unwrap(), "udp");
    }

    #[test]
    fn print() {
        let addr = NameAddr::new("Alice", "sip:alice@example.com".parse().unwrap());

        assert_eq!(addr.to_string(), "\"Alice\" <sip:alice@example.com>");
    }
}
