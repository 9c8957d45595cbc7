use bytesstr::BytesStr;
use sip_auth::{DigestAuthenticator, DigestCredentials, DigestUser};
use sip_core::{Request, TsxKey};
use sip_types::header::typed::{Contact, FromTo};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name};
use std::net::SocketAddr;

/// UAC registration binding against a single registrar
pub(crate) struct Registration {
    pub(crate) aor: NameAddr,
    pub(crate) contact: Contact,
    pub(crate) registrar_uri: SipUri,
    pub(crate) target: SocketAddr,

    call_id: BytesStr,
    cseq: u32,
    from_tag: BytesStr,

    /// Binding lifetime we request
    pub(crate) expires: u32,

    pub(crate) tsx: Option<TsxKey>,
    pub(crate) authenticator: DigestAuthenticator,
    /// At most one digest retry per REGISTER
    pub(crate) authenticated: bool,
    /// The in-flight request removes the binding (Expires: 0)
    pub(crate) removing: bool,
    /// Copy of the in-flight request, used to answer digest challenges
    pub(crate) last_request: Option<Request>,
}

impl Registration {
    pub(crate) fn new(
        aor: NameAddr,
        contact: Contact,
        registrar_uri: SipUri,
        target: SocketAddr,
        expires: u32,
        username: &str,
        password: &str,
    ) -> Self {
        let mut credentials = DigestCredentials::new();
        credentials.set_default(DigestUser::new(username, password));

        Self {
            aor,
            contact,
            registrar_uri,
            target,
            call_id: random_string(20).into(),
            cseq: 0,
            from_tag: random_string(8).into(),
            expires,
            tsx: None,
            authenticator: DigestAuthenticator::new(credentials),
            authenticated: false,
            removing: false,
            last_request: None,
        }
    }

    /// Build the next REGISTER request
    pub(crate) fn create_register(&mut self, remove_binding: bool) -> Request {
        self.cseq += 1;
        self.removing = remove_binding;
        self.authenticated = false;

        let mut request = self.build_request(remove_binding);
        self.authenticator.authorize_request(&mut request.headers);

        request
    }

    /// Rebuild the request with a fresh CSeq after a digest challenge
    pub(crate) fn create_authenticated_register(&mut self) -> Request {
        self.cseq += 1;
        self.authenticated = true;

        let mut request = self.build_request(self.removing);
        self.authenticator.authorize_request(&mut request.headers);

        request
    }

    fn build_request(&self, remove_binding: bool) -> Request {
        let mut request = Request::new(Method::Register, self.registrar_uri.clone());

        let from = FromTo::with_tag(self.aor.clone(), self.from_tag.clone());
        let to = FromTo::new(self.aor.clone());

        request.headers.insert(Name::From, from.to_string());
        request.headers.insert(Name::To, to.to_string());
        request
            .headers
            .insert(Name::CallId, self.call_id.clone());
        request
            .headers
            .insert(Name::CSeq, format!("{} REGISTER", self.cseq));
        request
            .headers
            .insert(Name::Contact, self.contact.to_string());

        let expires = if remove_binding { 0 } else { self.expires };
        request
            .headers
            .insert(Name::Expires, expires.to_string());

        request.headers.insert(Name::MaxForwards, "70");

        request
    }

    /// Seconds until the binding should be refreshed, honoring the expiry
    /// granted by the server
    pub(crate) fn refresh_after(&self, granted: Option<u32>) -> u32 {
        let expires = granted.unwrap_or(self.expires).max(2);

        // refresh well before the binding lapses
        expires - (expires / 4).min(30)
    }
}

pub(crate) fn random_string(len: usize) -> String {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_registration() -> Registration {
        Registration::new(
            NameAddr::uri("sip:alice@example.com".parse().unwrap()),
            Contact::new(NameAddr::uri("sip:alice@10.0.0.1:5060".parse().unwrap())),
            "sip:example.com".parse().unwrap(),
            "127.0.0.1:5060".parse().unwrap(),
            3600,
            "alice",
            "secret",
        )
    }

    #[test]
    fn register_carries_binding_headers() {
        let mut registration = test_registration();

        let request = registration.create_register(false);

        assert_eq!(request.line.method, Method::Register);
        assert_eq!(request.headers.get(&Name::Expires).unwrap(), "3600");
        assert!(request.headers.get(&Name::Contact).is_some());

        let from = FromTo::parse(&Name::From, request.headers.get(&Name::From).unwrap()).unwrap();
        let to = FromTo::parse(&Name::To, request.headers.get(&Name::To).unwrap()).unwrap();

        assert!(from.tag().is_some());
        assert!(to.tag().is_none());
    }

    #[test]
    fn remove_binding_sets_expires_zero() {
        let mut registration = test_registration();

        let request = registration.create_register(true);

        assert_eq!(request.headers.get(&Name::Expires).unwrap(), "0");
        assert!(registration.removing);
    }

    #[test]
    fn cseq_increments_per_request() {
        let mut registration = test_registration();

        let first = registration.create_register(false);
        let second = registration.create_authenticated_register();

        let first_cseq = first.headers.get(&Name::CSeq).unwrap().clone();
        let second_cseq = second.headers.get(&Name::CSeq).unwrap().clone();

        assert_eq!(first_cseq, "1 REGISTER");
        assert_eq!(second_cseq, "2 REGISTER");
    }

    #[test]
    fn refresh_is_before_expiry() {
        let registration = test_registration();

        assert!(registration.refresh_after(Some(3600)) < 3600);
        assert!(registration.refresh_after(Some(60)) < 60);
        assert!(registration.refresh_after(None) < 3600);
    }
}
