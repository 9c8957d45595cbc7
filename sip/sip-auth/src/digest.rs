use crate::{DigestError, RequestParts, ResponseParts, read_challenges};
use bytesstr::BytesStr;
use sha2::Digest;
use sip_types::{Headers, Name};
use sip_types::header::typed::{
    Algorithm, DigestChallenge, DigestResponse, QopOption, QopResponse,
};
use std::collections::HashMap;

/// Credentials of a single user
#[derive(Clone)]
pub struct DigestUser {
    user: String,
    password: Vec<u8>,
}

impl DigestUser {
    pub fn new<U, P>(user: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<Vec<u8>>,
    {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Credentials mapped to their respective realm, with optional default
/// credentials for unknown realms
#[derive(Default, Clone)]
pub struct DigestCredentials {
    default: Option<DigestUser>,
    map: HashMap<String, DigestUser>,
}

impl DigestCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default credentials used for realms without an explicit entry
    pub fn set_default(&mut self, credentials: DigestUser) {
        self.default = Some(credentials)
    }

    /// Add credentials used when authenticating for `realm`
    pub fn add_for_realm<R>(&mut self, realm: R, credentials: DigestUser)
    where
        R: Into<String>,
    {
        self.map.insert(realm.into(), credentials);
    }

    pub fn get_for_realm(&self, realm: &str) -> Option<&DigestUser> {
        self.map.get(realm).or(self.default.as_ref())
    }
}

/// Cached response re-applied (with an incremented nonce count) to requests
struct ResponseEntry {
    header: DigestResponse,
    ha1: String,
    ha2: String,
    hash: HashFn,
    use_count: u32,
    is_proxy: bool,
}

/// Solves digest challenges from 401 / 407 responses
pub struct DigestAuthenticator {
    pub credentials: DigestCredentials,
    responses: Vec<ResponseEntry>,
}

impl DigestAuthenticator {
    pub fn new(credentials: DigestCredentials) -> Self {
        Self {
            credentials,
            responses: vec![],
        }
    }

    /// Stamp all cached authorization responses onto the request headers.
    ///
    /// For qop responses the nonce count is incremented and the digest is
    /// recalculated on each use.
    pub fn authorize_request(&mut self, request_headers: &mut Headers) {
        for entry in &mut self.responses {
            let name = if entry.is_proxy {
                Name::ProxyAuthorization
            } else {
                Name::Authorization
            };

            if entry.use_count > 0
                && let Some(qop_response) = &mut entry.header.qop_response
            {
                qop_response.nc += 1;

                let response = (entry.hash)(
                    format!(
                        "{}:{}:{:08x}:{}:{}:{}",
                        entry.ha1,
                        entry.header.nonce,
                        qop_response.nc,
                        qop_response.cnonce,
                        qop_response.qop,
                        entry.ha2
                    )
                    .as_bytes(),
                );

                entry.header.response = response.into();
            }

            entry.use_count += 1;

            request_headers.insert(name, entry.header.to_string());
        }
    }

    /// Read the challenges of a 401 / 407 response and compute authorization
    /// responses for them.
    ///
    /// Returns an error if a challenge for an already-answered realm carries
    /// the same nonce again, which means the credentials were rejected.
    pub fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), DigestError> {
        let mut challenges = read_challenges(false, reject_response.headers)?;
        challenges.extend(read_challenges(true, reject_response.headers)?);

        if challenges.is_empty() {
            return Err(DigestError::FailedToAuthenticate(vec![]));
        }

        let mut failed_realms = vec![];

        for (is_proxy, challenge) in challenges {
            let realm = challenge.realm.clone();

            // An unchanged nonce for an answered realm means our previous
            // response was wrong, not stale
            let previous = self
                .responses
                .iter()
                .position(|entry| entry.header.realm == realm);

            if let Some(at) = previous {
                if self.responses[at].header.nonce == challenge.nonce {
                    failed_realms.push(realm);
                    continue;
                }

                self.responses.remove(at);
            }

            match self.respond_to_challenge(challenge, is_proxy, rejected_request) {
                Ok(entry) => self.responses.push(entry),
                Err(e) => {
                    log::warn!("failed to handle challenge for realm {realm}: {e}");
                    failed_realms.push(realm);
                }
            }
        }

        if !failed_realms.is_empty() {
            return Err(DigestError::FailedToAuthenticate(failed_realms));
        }

        Ok(())
    }

    fn respond_to_challenge(
        &self,
        challenge: DigestChallenge,
        is_proxy: bool,
        request_parts: RequestParts<'_>,
    ) -> Result<ResponseEntry, DigestError> {
        let hash: HashFn = match &challenge.algorithm {
            Algorithm::Md5 => hash_md5,
            Algorithm::Sha256 => hash_sha256,
            Algorithm::Other(other) => {
                return Err(DigestError::UnsupportedAlgorithm(other.clone()));
            }
        };

        let user = self
            .credentials
            .get_for_realm(&challenge.realm)
            .ok_or_else(|| DigestError::MissingCredentials(challenge.realm.clone()))?;

        let ha1 = hash(
            [
                format!("{}:{}:", user.user, challenge.realm).as_bytes(),
                &user.password[..],
            ]
            .concat()
            .as_slice(),
        );

        let uri = request_parts.line.uri.to_string();

        let ha2 = hash(format!("{}:{}", request_parts.line.method, uri).as_bytes());

        let (response, qop_response) = if challenge.qop.is_empty() {
            let response = hash(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes());

            (response, None)
        } else if challenge.qop.contains(&QopOption::Auth) {
            let cnonce = BytesStr::from(uuid::Uuid::new_v4().simple().to_string());
            let nc = 1;

            let response = hash(
                format!(
                    "{}:{}:{:08x}:{}:auth:{}",
                    ha1, challenge.nonce, nc, cnonce, ha2
                )
                .as_bytes(),
            );

            let qop_response = QopResponse {
                qop: QopOption::Auth,
                cnonce,
                nc,
            };

            (response, Some(qop_response))
        } else {
            return Err(DigestError::UnsupportedQop);
        };

        let header = DigestResponse {
            username: BytesStr::from(user.user.as_str()),
            realm: challenge.realm,
            nonce: challenge.nonce,
            uri: uri.into(),
            response: response.into(),
            algorithm: challenge.algorithm,
            opaque: challenge.opaque,
            qop_response,
        };

        Ok(ResponseEntry {
            header,
            ha1,
            ha2,
            hash,
            use_count: 0,
            is_proxy,
        })
    }
}

fn hash_md5(i: &[u8]) -> String {
    format!("{:x}", md5::compute(i))
}

fn hash_sha256(i: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(i);
    format!("{:x}", hasher.finalize())
}

type HashFn = fn(&[u8]) -> String;

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::Method;
    use sip_types::msg::RequestLine;
    use sip_types::uri::SipUri;

    fn test_authenticator() -> DigestAuthenticator {
        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("example.org", DigestUser::new("user123", "password123"));

        DigestAuthenticator::new(credentials)
    }

    fn register_line() -> RequestLine {
        RequestLine {
            method: Method::Register,
            uri: "sip:example.org".parse::<SipUri>().unwrap(),
        }
    }

    fn challenge_headers(value: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(Name::WwwAuthenticate, value);
        headers
    }

    #[test]
    fn legacy_challenge() {
        let mut authenticator = test_authenticator();

        let headers = challenge_headers(
            "Digest realm=\"example.org\", nonce=\"YWmh5GFpoLjiTDCA1hTSSygkgdj99aHE\", algorithm=MD5",
        );

        let line = register_line();
        let empty = Headers::new();

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &empty,
                    body: &[],
                },
                ResponseParts { headers: &headers },
            )
            .unwrap();

        let mut request_headers = Headers::new();
        authenticator.authorize_request(&mut request_headers);

        let authorization = DigestResponse::parse(
            &Name::Authorization,
            request_headers.get(&Name::Authorization).unwrap(),
        )
        .unwrap();

        assert_eq!(authorization.username, "user123");
        assert_eq!(authorization.uri, "sip:example.org");
        assert_eq!(authorization.response, "bc185e4893f17f12dc53153d2a62e6a6");
        assert_eq!(authorization.qop_response, None);
    }

    #[test]
    fn qop_auth_challenge_satisfies_digest_law() {
        let mut authenticator = test_authenticator();

        let headers = challenge_headers(
            "Digest realm=\"example.org\", nonce=\"YWmh5GFpoLjiTDCA1hTSSygkgdj99aHE\", qop=\"auth\"",
        );

        let line = register_line();
        let empty = Headers::new();

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &empty,
                    body: &[],
                },
                ResponseParts { headers: &headers },
            )
            .unwrap();

        let mut request_headers = Headers::new();
        authenticator.authorize_request(&mut request_headers);

        let authorization = DigestResponse::parse(
            &Name::Authorization,
            request_headers.get(&Name::Authorization).unwrap(),
        )
        .unwrap();

        // recompute the digest from the header fields (round-trip law)
        let qop = authorization.qop_response.as_ref().unwrap();
        assert_eq!(qop.nc, 1);
        assert_eq!(qop.cnonce.len(), 32);

        let ha1 = hash_md5(b"user123:example.org:password123");
        let ha2 = hash_md5(b"REGISTER:sip:example.org");
        let expected = hash_md5(
            format!(
                "{}:{}:{:08x}:{}:auth:{}",
                ha1, authorization.nonce, qop.nc, qop.cnonce, ha2
            )
            .as_bytes(),
        );

        assert_eq!(authorization.response, expected.as_str());
    }

    #[test]
    fn nc_increments_on_reuse() {
        let mut authenticator = test_authenticator();

        let headers = challenge_headers(
            "Digest realm=\"example.org\", nonce=\"n1\", qop=\"auth\"",
        );

        let line = register_line();
        let empty = Headers::new();

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &empty,
                    body: &[],
                },
                ResponseParts { headers: &headers },
            )
            .unwrap();

        let mut first = Headers::new();
        authenticator.authorize_request(&mut first);
        let mut second = Headers::new();
        authenticator.authorize_request(&mut second);

        let first =
            DigestResponse::parse(&Name::Authorization, first.get(&Name::Authorization).unwrap())
                .unwrap();
        let second = DigestResponse::parse(
            &Name::Authorization,
            second.get(&Name::Authorization).unwrap(),
        )
        .unwrap();

        assert_eq!(first.qop_response.unwrap().nc, 1);
        assert_eq!(second.qop_response.unwrap().nc, 2);
        assert_ne!(first.response, second.response);
    }

    #[test]
    fn repeated_nonce_is_terminal() {
        let mut authenticator = test_authenticator();

        let headers = challenge_headers("Digest realm=\"example.org\", nonce=\"same\"");

        let line = register_line();
        let empty = Headers::new();

        let request = RequestParts {
            line: &line,
            headers: &empty,
            body: &[],
        };

        authenticator
            .handle_rejection(request, ResponseParts { headers: &headers })
            .unwrap();

        // second challenge with an unchanged nonce: credentials are wrong
        let result = authenticator.handle_rejection(request, ResponseParts { headers: &headers });

        assert!(matches!(
            result,
            Err(DigestError::FailedToAuthenticate(realms)) if realms == vec![BytesStr::from_static("example.org")]
        ));
    }

    #[test]
    fn missing_credentials() {
        let mut authenticator = DigestAuthenticator::new(DigestCredentials::new());

        let headers = challenge_headers("Digest realm=\"nowhere\", nonce=\"x\"");

        let line = register_line();
        let empty = Headers::new();

        let result = authenticator.handle_rejection(
            RequestParts {
                line: &line,
                headers: &empty,
                body: &[],
            },
            ResponseParts { headers: &headers },
        );

        assert!(result.is_err());
    }
}
