#![deny(unsafe_code)]

//! Digest authentication (RFC 2617 / RFC 8760) for SIP requests.
//!
//! The [`DigestAuthenticator`] solves challenges received in 401 / 407
//! responses and stamps `Authorization` / `Proxy-Authorization` headers
//! onto outgoing requests. One authenticator instance accompanies one
//! request through its (single) authentication retry.

use bytesstr::BytesStr;
use sip_types::header::typed::{AuthChallenge, DigestChallenge};
use sip_types::msg::RequestLine;
use sip_types::{HeaderError, Headers, Name};

mod digest;

pub use digest::{DigestAuthenticator, DigestCredentials, DigestUser};

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("failed to authenticate realms: {0:?}")]
    FailedToAuthenticate(Vec<BytesStr>),
    #[error("encountered unsupported algorithm {0}")]
    UnsupportedAlgorithm(BytesStr),
    #[error("missing credentials for realm {0}")]
    MissingCredentials(BytesStr),
    #[error("unsupported qop")]
    UnsupportedQop,
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Borrowed view of the request being authorized
#[derive(Clone, Copy)]
pub struct RequestParts<'s> {
    pub line: &'s RequestLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}

/// Borrowed view of the rejection response carrying the challenges
#[derive(Clone, Copy)]
pub struct ResponseParts<'s> {
    pub headers: &'s Headers,
}

pub(crate) fn read_challenges(
    is_proxy: bool,
    headers: &Headers,
) -> Result<Vec<(bool, DigestChallenge)>, DigestError> {
    let challenge_name = if is_proxy {
        Name::ProxyAuthenticate
    } else {
        Name::WwwAuthenticate
    };

    let mut challenges = vec![];

    for value in headers.get_all(&challenge_name) {
        match AuthChallenge::parse(&challenge_name, value)? {
            AuthChallenge::Digest(digest) => challenges.push((is_proxy, digest)),
            AuthChallenge::Other { scheme, .. } => {
                log::debug!("skipping challenge with unsupported scheme {scheme}");
            }
        }
    }

    Ok(challenges)
}
