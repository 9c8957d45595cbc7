use crate::header::{HeaderError, Name};
use bytesstr::BytesStr;
use std::fmt;

/// Digest algorithm advertised in a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
    Other(BytesStr),
}

impl Algorithm {
    fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("MD5") {
            Algorithm::Md5
        } else if token.eq_ignore_ascii_case("SHA-256") {
            Algorithm::Sha256
        } else {
            Algorithm::Other(BytesStr::from(token))
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Md5 => f.write_str("MD5"),
            Algorithm::Sha256 => f.write_str("SHA-256"),
            Algorithm::Other(other) => f.write_str(other),
        }
    }
}

/// qop option from a challenge / chosen in a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QopOption {
    Auth,
    AuthInt,
    Other(BytesStr),
}

impl QopOption {
    fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("auth") {
            QopOption::Auth
        } else if token.eq_ignore_ascii_case("auth-int") {
            QopOption::AuthInt
        } else {
            QopOption::Other(BytesStr::from(token))
        }
    }
}

impl fmt::Display for QopOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QopOption::Auth => f.write_str("auth"),
            QopOption::AuthInt => f.write_str("auth-int"),
            QopOption::Other(other) => f.write_str(other),
        }
    }
}

/// Challenge carried in WWW-Authenticate / Proxy-Authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Digest(DigestChallenge),
    Other { scheme: BytesStr, value: BytesStr },
}

/// Parsed digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub opaque: Option<BytesStr>,
    pub stale: bool,
    pub algorithm: Algorithm,
    pub qop: Vec<QopOption>,
}

impl AuthChallenge {
    pub fn parse(name: &Name, value: &str) -> Result<Self, HeaderError> {
        let value = value.trim();

        let (scheme, rest) = value
            .split_once(char::is_whitespace)
            .ok_or(HeaderError::Malformed(name.clone()))?;

        if !scheme.eq_ignore_ascii_case("Digest") {
            return Ok(AuthChallenge::Other {
                scheme: BytesStr::from(scheme),
                value: BytesStr::from(rest.trim()),
            });
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut stale = false;
        let mut algorithm = Algorithm::Md5;
        let mut qop = Vec::new();

        for (param, param_value) in parse_auth_params(rest) {
            if param.eq_ignore_ascii_case("realm") {
                realm = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("nonce") {
                nonce = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("opaque") {
                opaque = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("stale") {
                stale = param_value.eq_ignore_ascii_case("true");
            } else if param.eq_ignore_ascii_case("algorithm") {
                algorithm = Algorithm::from_token(param_value);
            } else if param.eq_ignore_ascii_case("qop") {
                qop = param_value
                    .split(',')
                    .map(|option| QopOption::from_token(option.trim()))
                    .collect();
            }
        }

        Ok(AuthChallenge::Digest(DigestChallenge {
            realm: realm.ok_or(HeaderError::Malformed(name.clone()))?,
            nonce: nonce.ok_or(HeaderError::Malformed(name.clone()))?,
            opaque,
            stale,
            algorithm,
            qop,
        }))
    }
}

/// qop parts of a digest response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QopResponse {
    pub qop: QopOption,
    pub cnonce: BytesStr,
    pub nc: u32,
}

/// Authorization / Proxy-Authorization digest response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: BytesStr,
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub uri: BytesStr,
    pub response: BytesStr,
    pub algorithm: Algorithm,
    pub opaque: Option<BytesStr>,
    pub qop_response: Option<QopResponse>,
}

impl DigestResponse {
    /// Parse an Authorization header value. Mostly used by tests and stub
    /// servers; the stack itself only generates these.
    pub fn parse(name: &Name, value: &str) -> Result<Self, HeaderError> {
        let value = value.trim();

        let rest = value
            .split_once(char::is_whitespace)
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("Digest"))
            .map(|(_, rest)| rest)
            .ok_or(HeaderError::Malformed(name.clone()))?;

        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut algorithm = Algorithm::Md5;
        let mut opaque = None;
        let mut qop = None;
        let mut cnonce = None;
        let mut nc = None;

        for (param, param_value) in parse_auth_params(rest) {
            if param.eq_ignore_ascii_case("username") {
                username = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("realm") {
                realm = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("nonce") {
                nonce = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("uri") {
                uri = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("response") {
                response = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("algorithm") {
                algorithm = Algorithm::from_token(param_value);
            } else if param.eq_ignore_ascii_case("opaque") {
                opaque = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("qop") {
                qop = Some(QopOption::from_token(param_value));
            } else if param.eq_ignore_ascii_case("cnonce") {
                cnonce = Some(BytesStr::from(param_value));
            } else if param.eq_ignore_ascii_case("nc") {
                nc = u32::from_str_radix(param_value, 16).ok();
            }
        }

        let qop_response = match (qop, cnonce, nc) {
            (Some(qop), Some(cnonce), Some(nc)) => Some(QopResponse { qop, cnonce, nc }),
            _ => None,
        };

        Ok(DigestResponse {
            username: username.ok_or(HeaderError::Malformed(name.clone()))?,
            realm: realm.ok_or(HeaderError::Malformed(name.clone()))?,
            nonce: nonce.ok_or(HeaderError::Malformed(name.clone()))?,
            uri: uri.ok_or(HeaderError::Malformed(name.clone()))?,
            response: response.ok_or(HeaderError::Malformed(name.clone()))?,
            algorithm,
            opaque,
            qop_response,
        })
    }
}

impl fmt::Display for DigestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username, self.realm, self.nonce, self.uri, self.response, self.algorithm
        )?;

        if let Some(qop_response) = &self.qop_response {
            write!(
                f,
                ", qop={}, cnonce=\"{}\", nc={:08x}",
                qop_response.qop, qop_response.cnonce, qop_response.nc
            )?;
        }

        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{opaque}\"")?;
        }

        Ok(())
    }
}

/// Iterate `name=value` pairs of an auth header, unquoting quoted values
fn parse_auth_params(i: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut params = Vec::new();
    let mut rest = i.trim();

    while !rest.is_empty() {
        let Some((name, after_eq)) = rest.split_once('=') else {
            break;
        };

        let name = name.trim();
        let after_eq = after_eq.trim_start();

        let (value, remaining) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, remaining)) => (value, remaining),
                None => (quoted, ""),
            }
        } else {
            match after_eq.split_once(',') {
                Some((value, remaining)) => {
                    params.push((name, value.trim()));
                    rest = remaining.trim_start();
                    continue;
                }
                None => (after_eq.trim(), ""),
            }
        };

        params.push((name, value));

        rest = remaining
            .trim_start()
            .strip_prefix(',')
            .unwrap_or(remaining)
            .trim_start();
    }

    params.into_iter()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_challenge() {
        let challenge = AuthChallenge::parse(
            &Name::WwwAuthenticate,
            "Digest realm=\"ex\", nonce=\"abc\", qop=\"auth\", algorithm=MD5",
        )
        .unwrap();

        let AuthChallenge::Digest(digest) = challenge else {
            panic!("expected digest challenge");
        };

        assert_eq!(digest.realm, "ex");
        assert_eq!(digest.nonce, "abc");
        assert_eq!(digest.qop, vec![QopOption::Auth]);
        assert_eq!(digest.algorithm, Algorithm::Md5);
        assert!(!digest.stale);
    }

    #[test]
    fn parse_challenge_unquoted_tokens() {
        let challenge = AuthChallenge::parse(
            &Name::WwwAuthenticate,
            "Digest realm=\"a, b\", nonce=\"n\", stale=TRUE, algorithm=SHA-256",
        )
        .unwrap();

        let AuthChallenge::Digest(digest) = challenge else {
            panic!("expected digest challenge");
        };

        // quoted comma must survive
        assert_eq!(digest.realm, "a, b");
        assert!(digest.stale);
        assert_eq!(digest.algorithm, Algorithm::Sha256);
    }

    #[test]
    fn non_digest_scheme() {
        let challenge =
            AuthChallenge::parse(&Name::WwwAuthenticate, "Bearer realm=\"x\"").unwrap();

        assert!(matches!(challenge, AuthChallenge::Other { .. }));
    }

    #[test]
    fn response_roundtrip() {
        let response = DigestResponse {
            username: "alice".into(),
            realm: "ex".into(),
            nonce: "abc".into(),
            uri: "sip:example.com".into(),
            response: "0123456789abcdef0123456789abcdef".into(),
            algorithm: Algorithm::Md5,
            opaque: None,
            qop_response: Some(QopResponse {
                qop: QopOption::Auth,
                cnonce: "ffffffffffffffffffffffffffffffff".into(),
                nc: 1,
            }),
        };

        let printed = response.to_string();
        assert!(printed.contains("nc=00000001"));

        let reparsed = DigestResponse::parse(&Name::Authorization, &printed).unwrap();
        assert_eq!(reparsed, response);
    }
}
