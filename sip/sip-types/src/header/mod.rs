use bytesstr::BytesStr;
use std::fmt;

pub mod typed;

/// Error raised when reading typed values out of [`Headers`]
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("missing header {0}")]
    Missing(Name),
    #[error("malformed header {0}")]
    Malformed(Name),
}

/// A header field name.
///
/// Known names compare independent of representation, so a message using
/// the compact form `v:` still yields [`Name::Via`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    MaxForwards,
    Expires,
    ContentLength,
    ContentType,
    Authorization,
    ProxyAuthorization,
    WwwAuthenticate,
    ProxyAuthenticate,
    Allow,
    Supported,
    UserAgent,
    Route,
    RecordRoute,
    Other(BytesStr),
}

impl Name {
    pub fn from_wire(name: &str) -> Self {
        let lower = name.trim();

        if lower.len() == 1 {
            // compact forms (RFC 3261 section 7.3.3)
            return match lower.to_ascii_lowercase().as_str() {
                "v" => Name::Via,
                "f" => Name::From,
                "t" => Name::To,
                "i" => Name::CallId,
                "m" => Name::Contact,
                "l" => Name::ContentLength,
                "c" => Name::ContentType,
                other => Name::Other(BytesStr::from(other)),
            };
        }

        match lower.to_ascii_lowercase().as_str() {
            "via" => Name::Via,
            "from" => Name::From,
            "to" => Name::To,
            "call-id" => Name::CallId,
            "cseq" => Name::CSeq,
            "contact" => Name::Contact,
            "max-forwards" => Name::MaxForwards,
            "expires" => Name::Expires,
            "content-length" => Name::ContentLength,
            "content-type" => Name::ContentType,
            "authorization" => Name::Authorization,
            "proxy-authorization" => Name::ProxyAuthorization,
            "www-authenticate" => Name::WwwAuthenticate,
            "proxy-authenticate" => Name::ProxyAuthenticate,
            "allow" => Name::Allow,
            "supported" => Name::Supported,
            "user-agent" => Name::UserAgent,
            "route" => Name::Route,
            "record-route" => Name::RecordRoute,
            other => Name::Other(BytesStr::from(other)),
        }
    }

    pub fn as_print_str(&self) -> &str {
        match self {
            Name::Via => "Via",
            Name::From => "From",
            Name::To => "To",
            Name::CallId => "Call-ID",
            Name::CSeq => "CSeq",
            Name::Contact => "Contact",
            Name::MaxForwards => "Max-Forwards",
            Name::Expires => "Expires",
            Name::ContentLength => "Content-Length",
            Name::ContentType => "Content-Type",
            Name::Authorization => "Authorization",
            Name::ProxyAuthorization => "Proxy-Authorization",
            Name::WwwAuthenticate => "WWW-Authenticate",
            Name::ProxyAuthenticate => "Proxy-Authenticate",
            Name::Allow => "Allow",
            Name::Supported => "Supported",
            Name::UserAgent => "User-Agent",
            Name::Route => "Route",
            Name::RecordRoute => "Record-Route",
            Name::Other(other) => other.as_str(),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_print_str())
    }
}

/// Ordered multimap of header fields.
///
/// Values are kept as the raw field value; typed accessors parse on demand.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(Name, BytesStr)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a header field
    pub fn insert<V>(&mut self, name: Name, value: V)
    where
        V: HeaderWrite,
    {
        self.entries.push((name, value.into_value()));
    }

    /// Prepend a header field, used for Via on forwarded/created requests
    pub fn insert_front<V>(&mut self, name: Name, value: V)
    where
        V: HeaderWrite,
    {
        self.entries.insert(0, (name, value.into_value()));
    }

    /// Replace all fields `name` with a single value
    pub fn replace<V>(&mut self, name: Name, value: V)
    where
        V: HeaderWrite,
    {
        self.remove(&name);
        self.insert(name, value);
    }

    /// First value of `name`
    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, value)| value)
    }

    /// First value of `name`, as a [`HeaderError`] on absence
    pub fn get_required(&self, name: &Name) -> Result<&BytesStr, HeaderError> {
        self.get(name).ok_or(HeaderError::Missing(name.clone()))
    }

    pub fn get_all<'h>(&'h self, name: &'h Name) -> impl Iterator<Item = &'h BytesStr> {
        self.entries
            .iter()
            .filter(move |(entry_name, _)| entry_name == name)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, name: &Name) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(entry_name, _)| entry_name != name);
        before - self.entries.len()
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.get(name).is_some()
    }

    /// Copy all fields `name` into `dst`, returns how many were copied
    pub fn clone_into(&self, dst: &mut Headers, name: Name) -> usize {
        let mut copied = 0;

        for value in self.get_all(&name) {
            dst.insert(name.clone(), value.clone());
            copied += 1;
        }

        copied
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> {
        self.entries.iter().map(|(name, value)| (name, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name.as_print_str(), value)?;
        }

        Ok(())
    }
}

/// Conversion of typed or plain values into a raw header field value
pub trait HeaderWrite {
    fn into_value(self) -> BytesStr;
}

impl HeaderWrite for BytesStr {
    fn into_value(self) -> BytesStr {
        self
    }
}

impl HeaderWrite for &BytesStr {
    fn into_value(self) -> BytesStr {
        self.clone()
    }
}

impl HeaderWrite for &str {
    fn into_value(self) -> BytesStr {
        BytesStr::from(self)
    }
}

impl HeaderWrite for String {
    fn into_value(self) -> BytesStr {
        BytesStr::from(self)
    }
}

/// Split a header field value at top level commas, honoring quoted strings
/// and `<>` enclosures. Used for Via and challenge lists.
pub fn split_commas(value: &str) -> impl Iterator<Item = &str> {
    let mut items = Vec::new();

    let mut depth_quote = false;
    let mut depth_angle = 0usize;
    let mut start = 0;

    for (at, c) in value.char_indices() {
        match c {
            '"' => depth_quote = !depth_quote,
            '<' if !depth_quote => depth_angle += 1,
            '>' if !depth_quote => depth_angle = depth_angle.saturating_sub(1),
            ',' if !depth_quote && depth_angle == 0 => {
                items.push(value[start..at].trim());
                start = at + 1;
            }
            _ => {}
        }
    }

    items.push(value[start..].trim());

    items.into_iter().filter(|item| !item.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_and_full_names_compare_equal() {
        assert_eq!(Name::from_wire("v"), Name::Via);
        assert_eq!(Name::from_wire("VIA"), Name::Via);
        assert_eq!(Name::from_wire("Call-ID"), Name::CallId);
        assert_eq!(
            Name::from_wire("X-Custom"),
            Name::Other(BytesStr::from_static("x-custom"))
        );
    }

    #[test]
    fn multimap_ordering() {
        let mut headers = Headers::new();

        headers.insert(Name::Via, "SIP/2.0/UDP a;branch=1");
        headers.insert(Name::Via, "SIP/2.0/UDP b;branch=2");
        headers.insert_front(Name::Via, "SIP/2.0/UDP front;branch=0");

        let all: Vec<_> = headers.get_all(&Name::Via).collect();
        assert_eq!(all.len(), 3);
        assert!(all[0].starts_with("SIP/2.0/UDP front"));
    }

    #[test]
    fn split_commas_honors_quotes() {
        let items: Vec<_> =
            split_commas("Digest realm=\"a, b\", nonce=\"x\"").collect();

        // the quoted comma must not split
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], "Digest realm=\"a, b\"");
    }

    #[test]
    fn print_format() {
        let mut headers = Headers::new();
        headers.insert(Name::MaxForwards, "70");

        assert_eq!(headers.to_string(), "Max-Forwards: 70\r\n");
    }
}
