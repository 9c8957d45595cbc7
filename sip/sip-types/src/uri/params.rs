use bytesstr::BytesStr;
use internal::IResult;
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use std::fmt;

/// A single `;name` or `;name=value` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl Param {
    pub fn new<N>(name: N) -> Self
    where
        N: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn value<N, V>(name: N, value: V) -> Self
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ";{}", self.name)?;

        if let Some(value) = &self.value {
            write!(f, "={value}")?;
        }

        Ok(())
    }
}

/// Ordered `;`-separated parameter list used by URIs, Via and From/To headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    params: Vec<Param>,
}

impl Params {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    pub fn push(&mut self, param: Param) {
        self.params.push(param);
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params
            .iter()
            .find(|param| param.name.eq_ignore_ascii_case(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.params
            .iter_mut()
            .find(|param| param.name.eq_ignore_ascii_case(name))
    }

    /// Value of the parameter `name`, if present with a value
    pub fn get_val(&self, name: &str) -> Option<&BytesStr> {
        self.get(name).and_then(|param| param.value.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name=value`, replacing the value of an existing parameter
    pub fn push_or_edit<N, V>(&mut self, name: N, value: V)
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        let name = name.into();
        let value = value.into();

        match self.get_mut(&name) {
            Some(param) => param.value = Some(value),
            None => self.push(Param {
                name,
                value: Some(value),
            }),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Param> {
        let at = self
            .params
            .iter()
            .position(|param| param.name.eq_ignore_ascii_case(name))?;

        Some(self.params.remove(at))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub(crate) fn parse(i: &str) -> IResult<&str, Self> {
        map(
            many0(preceded(
                char(';'),
                tuple((
                    take_while1(param_char),
                    opt(preceded(char('='), take_while1(param_char))),
                )),
            )),
            |params| Params {
                params: params
                    .into_iter()
                    .map(|(name, value)| Param {
                        name: BytesStr::from(name),
                        value: value.map(BytesStr::from),
                    })
                    .collect(),
            },
        )(i)
    }
}

fn param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~' | '[' | ']' | ':')
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.params {
            param.fmt(f)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_print() {
        let (rem, params) = Params::parse(";transport=udp;lr").unwrap();

        assert!(rem.is_empty());
        assert_eq!(params.get_val("transport").unwrap(), "udp");
        assert!(params.contains("lr"));
        assert_eq!(params.to_string(), ";transport=udp;lr");
    }

    #[test]
    fn push_or_edit_replaces() {
        let (_, mut params) = Params::parse(";rport").unwrap();

        params.push_or_edit("rport", "5060");
        params.push_or_edit("received", "1.2.3.4");

        assert_eq!(params.to_string(), ";rport=5060;received=1.2.3.4");
    }

    #[test]
    fn stops_at_header_params() {
        let (rem, params) = Params::parse(";tag=abc?x=y").unwrap();

        assert_eq!(rem, "?x=y");
        assert_eq!(params.get_val("tag").unwrap(), "abc");
    }
}
