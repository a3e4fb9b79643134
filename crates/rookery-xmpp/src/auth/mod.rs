//! SASL authentication mechanisms.
//!
//! Implements SASL authentication for C2S streams:
//! - SASL PLAIN (RFC 4616), verified against the stored SCRAM keys
//! - SASL SCRAM-SHA-1/256/512 and SCRAM-SHA3-512 (RFC 5802, RFC 7677),
//!   each with a `-PLUS` channel binding variant

pub mod scram;

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use minidom::Element;
use thiserror::Error;
use tracing::debug;

pub use scram::{
    encode_sasl_name, generate_salt, generate_scram_keys, ScramHash, ScramServer, ScramState,
    DEFAULT_ITERATIONS,
};

use crate::config::SaslMechanismName;
use crate::parser::ns;
use crate::storage::{Repository, User};

/// SASL failure reasons (RFC 6120 Section 6.5).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SaslError {
    /// The client aborted the exchange
    #[error("aborted")]
    Aborted,
    /// Payload was not valid base64
    #[error("incorrect-encoding")]
    IncorrectEncoding,
    /// Authorization identity not permitted
    #[error("invalid-authzid")]
    InvalidAuthzid,
    /// Mechanism not offered
    #[error("invalid-mechanism")]
    InvalidMechanism,
    /// Payload did not follow the mechanism's grammar
    #[error("malformed-request")]
    MalformedRequest,
    /// Credentials rejected
    #[error("not-authorized")]
    NotAuthorized,
    /// Server-side failure; the client may retry
    #[error("temporary-auth-failure")]
    TemporaryAuthFailure,
}

impl SaslError {
    /// Reason element name.
    pub fn reason(&self) -> &'static str {
        match self {
            SaslError::Aborted => "aborted",
            SaslError::IncorrectEncoding => "incorrect-encoding",
            SaslError::InvalidAuthzid => "invalid-authzid",
            SaslError::InvalidMechanism => "invalid-mechanism",
            SaslError::MalformedRequest => "malformed-request",
            SaslError::NotAuthorized => "not-authorized",
            SaslError::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    /// `<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><reason/></failure>`
    pub fn to_element(&self) -> Element {
        Element::builder("failure", ns::SASL)
            .append(Element::builder(self.reason(), ns::SASL).build())
            .build()
    }
}

/// One side of a SASL exchange driven by the session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Mechanism name.
    fn mechanism(&self) -> &'static str;

    /// Whether the mechanism binds to the TLS channel.
    fn uses_channel_binding(&self) -> bool;

    /// Feed an `<auth/>` or `<response/>` element. Returns the challenge
    /// or success element to send back.
    async fn process_element(&mut self, element: &Element) -> Result<Option<Element>, SaslError>;

    /// The exchange completed successfully.
    fn authenticated(&self) -> bool;

    /// Authenticated account node.
    fn username(&self) -> &str;

    /// Forget any exchange state.
    fn reset(&mut self);
}

/// A mechanism that can be offered on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// PLAIN
    Plain,
    /// SCRAM over `hash`, optionally channel bound
    Scram {
        /// Digest
        hash: ScramHash,
        /// `-PLUS` variant
        plus: bool,
    },
}

impl Mechanism {
    /// IANA mechanism name.
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Scram { hash, plus } => hash.mechanism(*plus),
        }
    }

    /// Whether the mechanism needs channel binding data.
    pub fn uses_channel_binding(&self) -> bool {
        matches!(self, Mechanism::Scram { plus: true, .. })
    }

    /// Mechanisms to advertise for `configured`, in preference order.
    /// `-PLUS` variants are only offered when the transport can bind.
    pub fn offered(configured: &[SaslMechanismName], channel_binding: bool) -> Vec<Mechanism> {
        let mut offered = Vec::new();
        for name in configured {
            let hash = match name {
                SaslMechanismName::Plain => {
                    offered.push(Mechanism::Plain);
                    continue;
                }
                SaslMechanismName::ScramSha1 => ScramHash::Sha1,
                SaslMechanismName::ScramSha256 => ScramHash::Sha256,
                SaslMechanismName::ScramSha512 => ScramHash::Sha512,
                SaslMechanismName::ScramSha3_512 => ScramHash::Sha3_512,
            };
            if channel_binding {
                offered.push(Mechanism::Scram { hash, plus: true });
            }
            offered.push(Mechanism::Scram { hash, plus: false });
        }
        offered
    }

    /// Build the server side of this mechanism.
    pub fn authenticator(
        &self,
        domain: &str,
        repository: Arc<dyn Repository>,
        channel_binding: Option<Vec<u8>>,
    ) -> Box<dyn Authenticator> {
        match *self {
            Mechanism::Plain => Box::new(PlainAuthenticator::new(domain, repository)),
            Mechanism::Scram { hash, plus } => Box::new(ScramAuthenticator::new(
                hash,
                plus,
                domain,
                repository,
                channel_binding,
            )),
        }
    }
}

fn decode_payload(element: &Element) -> Result<Vec<u8>, SaslError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|_| SaslError::IncorrectEncoding)
}

fn sasl_element(name: &str, payload: Option<&[u8]>) -> Element {
    let mut builder = Element::builder(name, ns::SASL);
    if let Some(payload) = payload {
        builder = builder.append(BASE64_STANDARD.encode(payload));
    }
    builder.build()
}

/// Accept an authzid only when it names the authenticating account.
fn check_authzid(authzid: Option<&str>, username: &str, domain: &str) -> Result<(), SaslError> {
    match authzid {
        None | Some("") => Ok(()),
        Some(id) if id == username || id == format!("{}@{}", username, domain) => Ok(()),
        Some(_) => Err(SaslError::InvalidAuthzid),
    }
}

async fn fetch_user(repository: &dyn Repository, username: &str) -> Result<User, SaslError> {
    match repository.fetch_user(username).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(SaslError::NotAuthorized),
        Err(e) => {
            debug!(error = %e, "User lookup failed during SASL");
            Err(SaslError::TemporaryAuthFailure)
        }
    }
}

/// SASL PLAIN.
pub struct PlainAuthenticator {
    domain: String,
    repository: Arc<dyn Repository>,
    username: String,
    authenticated: bool,
}

impl PlainAuthenticator {
    /// Create a PLAIN exchange for `domain`.
    pub fn new(domain: &str, repository: Arc<dyn Repository>) -> Self {
        Self {
            domain: domain.to_string(),
            repository,
            username: String::new(),
            authenticated: false,
        }
    }
}

/// Split `authzid \0 authcid \0 password`.
fn parse_plain(data: &[u8]) -> Result<(Option<String>, String, String), SaslError> {
    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(SaslError::MalformedRequest);
    }
    let text = |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|_| SaslError::MalformedRequest);
    let authzid = text(parts[0])?;
    let authcid = text(parts[1])?;
    let password = text(parts[2])?;
    if authcid.is_empty() {
        return Err(SaslError::MalformedRequest);
    }
    Ok((
        (!authzid.is_empty()).then_some(authzid),
        authcid,
        password,
    ))
}

#[async_trait]
impl Authenticator for PlainAuthenticator {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
    }

    fn uses_channel_binding(&self) -> bool {
        false
    }

    async fn process_element(&mut self, element: &Element) -> Result<Option<Element>, SaslError> {
        if self.authenticated {
            return Err(SaslError::MalformedRequest);
        }
        let payload = decode_payload(element)?;
        if payload.is_empty() && element.name() == "auth" {
            // Empty initial response: ask for the credentials.
            return Ok(Some(sasl_element("challenge", None)));
        }
        let (authzid, authcid, password) = parse_plain(&payload)?;

        // Accept both `user` and `user@domain` as the authentication identity.
        let username = match authcid.split_once('@') {
            Some((node, domain)) if domain == self.domain => node.to_string(),
            Some(_) => return Err(SaslError::NotAuthorized),
            None => authcid,
        };
        check_authzid(authzid.as_deref(), &username, &self.domain)?;

        let user = fetch_user(self.repository.as_ref(), &username).await?;
        if !user.verify_password(&password)? {
            return Err(SaslError::NotAuthorized);
        }
        self.username = username;
        self.authenticated = true;
        Ok(Some(sasl_element("success", None)))
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn reset(&mut self) {
        self.username.clear();
        self.authenticated = false;
    }
}

/// SCRAM over any supported digest.
pub struct ScramAuthenticator {
    server: ScramServer,
    domain: String,
    repository: Arc<dyn Repository>,
    username: String,
    keys: Option<(Vec<u8>, Vec<u8>)>,
    authenticated: bool,
}

impl ScramAuthenticator {
    /// Create a SCRAM exchange.
    pub fn new(
        hash: ScramHash,
        plus: bool,
        domain: &str,
        repository: Arc<dyn Repository>,
        channel_binding: Option<Vec<u8>>,
    ) -> Self {
        Self {
            server: ScramServer::new(hash, plus, channel_binding),
            domain: domain.to_string(),
            repository,
            username: String::new(),
            keys: None,
            authenticated: false,
        }
    }
}

#[async_trait]
impl Authenticator for ScramAuthenticator {
    fn mechanism(&self) -> &'static str {
        self.server.hash().mechanism(self.server.is_plus())
    }

    fn uses_channel_binding(&self) -> bool {
        self.server.is_plus()
    }

    async fn process_element(&mut self, element: &Element) -> Result<Option<Element>, SaslError> {
        let payload = decode_payload(element)?;
        let message = String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;

        match (element.name(), self.server.state()) {
            ("auth", ScramState::Initial) => {
                let first = self.server.process_client_first(&message)?;
                check_authzid(first.authzid.as_deref(), &first.username, &self.domain)?;

                let user = fetch_user(self.repository.as_ref(), &first.username).await?;
                let credentials = user
                    .credentials(self.server.hash())
                    .ok_or(SaslError::NotAuthorized)?;
                let server_first = self
                    .server
                    .server_first(&credentials.salt, credentials.iterations)?;
                self.keys = Some((credentials.stored_key.clone(), credentials.server_key.clone()));
                self.username = first.username;
                Ok(Some(sasl_element("challenge", Some(server_first.as_bytes()))))
            }
            ("response", ScramState::WaitingForClientFinal) => {
                let (stored_key, server_key) = self.keys.take().ok_or(SaslError::MalformedRequest)?;
                let server_final =
                    self.server
                        .process_client_final(&message, &stored_key, &server_key)?;
                self.authenticated = true;
                Ok(Some(sasl_element("success", Some(server_final.as_bytes()))))
            }
            _ => Err(SaslError::MalformedRequest),
        }
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn reset(&mut self) {
        self.server.reset();
        self.username.clear();
        self.keys = None;
        self.authenticated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRepository, UserRepository};

    async fn repository() -> Arc<dyn Repository> {
        let repo = MemoryRepository::new();
        repo.upsert_user(&User::with_password_iterations("ortuman", "1234", 64).unwrap())
            .await
            .unwrap();
        Arc::new(repo)
    }

    fn auth(mechanism: &str, payload: &[u8]) -> Element {
        Element::builder("auth", ns::SASL)
            .attr("mechanism", mechanism)
            .append(BASE64_STANDARD.encode(payload))
            .build()
    }

    #[tokio::test]
    async fn test_plain_success() {
        let mut plain = PlainAuthenticator::new("localhost", repository().await);
        let reply = plain
            .process_element(&auth("PLAIN", b"\0ortuman\x001234"))
            .await
            .unwrap()
            .unwrap();

        assert!(reply.is("success", ns::SASL));
        assert!(plain.authenticated());
        assert_eq!(plain.username(), "ortuman");

        plain.reset();
        assert!(!plain.authenticated());
    }

    #[tokio::test]
    async fn test_plain_failures() {
        let repo = repository().await;
        let cases: Vec<(&[u8], SaslError)> = vec![
            (b"\0ortuman\0wrong", SaslError::NotAuthorized),
            (b"\0nobody\x001234", SaslError::NotAuthorized),
            (b"noelia\0ortuman\x001234", SaslError::InvalidAuthzid),
            (b"ortuman1234", SaslError::MalformedRequest),
        ];
        for (payload, expected) in cases {
            let mut plain = PlainAuthenticator::new("localhost", repo.clone());
            assert_eq!(plain.process_element(&auth("PLAIN", payload)).await, Err(expected));
        }

        let mut plain = PlainAuthenticator::new("localhost", repo);
        let bad = Element::builder("auth", ns::SASL)
            .attr("mechanism", "PLAIN")
            .append("!!not base64!!")
            .build();
        assert_eq!(plain.process_element(&bad).await, Err(SaslError::IncorrectEncoding));
    }

    #[tokio::test]
    async fn test_plain_accepts_bare_jid_authcid() {
        let mut plain = PlainAuthenticator::new("localhost", repository().await);
        plain
            .process_element(&auth("PLAIN", b"ortuman@localhost\0ortuman@localhost\x001234"))
            .await
            .unwrap();
        assert_eq!(plain.username(), "ortuman");
    }

    #[tokio::test]
    async fn test_scram_exchange() {
        let mut scram =
            ScramAuthenticator::new(ScramHash::Sha512, false, "localhost", repository().await, None);
        assert_eq!(scram.mechanism(), "SCRAM-SHA-512");

        let bare = "n=ortuman,r=clientnonce";
        let challenge = scram
            .process_element(&auth("SCRAM-SHA-512", format!("n,,{}", bare).as_bytes()))
            .await
            .unwrap()
            .unwrap();
        assert!(challenge.is("challenge", ns::SASL));
        let server_first =
            String::from_utf8(BASE64_STANDARD.decode(challenge.text()).unwrap()).unwrap();

        let final_msg = scram::client::client_final(
            ScramHash::Sha512,
            "1234",
            "n,,",
            None,
            bare,
            &server_first,
        );
        let response = Element::builder("response", ns::SASL)
            .append(BASE64_STANDARD.encode(final_msg))
            .build();
        let success = scram.process_element(&response).await.unwrap().unwrap();

        assert!(success.is("success", ns::SASL));
        assert!(scram.authenticated());
        assert_eq!(scram.username(), "ortuman");
    }

    #[tokio::test]
    async fn test_scram_unknown_user() {
        let mut scram =
            ScramAuthenticator::new(ScramHash::Sha1, false, "localhost", repository().await, None);
        let result = scram
            .process_element(&auth("SCRAM-SHA-1", b"n,,n=nobody,r=abc"))
            .await;
        assert_eq!(result, Err(SaslError::NotAuthorized));
    }

    #[test]
    fn test_offered_mechanisms() {
        let configured = [SaslMechanismName::ScramSha256, SaslMechanismName::Plain];
        let names: Vec<_> = Mechanism::offered(&configured, true)
            .iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(names, vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256", "PLAIN"]);

        let names: Vec<_> = Mechanism::offered(&configured, false)
            .iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(names, vec!["SCRAM-SHA-256", "PLAIN"]);
    }

    #[test]
    fn test_failure_element() {
        let failure = SaslError::NotAuthorized.to_element();
        assert!(failure.is("failure", ns::SASL));
        assert!(failure.has_child("not-authorized", ns::SASL));
    }
}
