//! Server side of the SCRAM family (RFC 5802, RFC 7677).
//!
//! One state machine serves every supported digest. The `-PLUS` variants
//! bind the exchange to the TLS channel with `tls-exporter` data
//! (RFC 9266).
//!
//! ## Protocol Flow
//!
//! 1. Client sends client-first-message: `gs2-header n=user,r=clientnonce`
//! 2. Server sends server-first-message: `r=clientnonce+servernonce,s=salt,i=iterations`
//! 3. Client sends client-final-message: `c=cbind,r=nonce,p=clientproof`
//! 4. Server verifies and sends server-final-message: `v=serversignature`

use base64::prelude::*;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use sha3::Sha3_512;

use super::SaslError;

/// Default number of PBKDF2 iterations. RFC 7677 recommends at least 4096.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Channel binding type accepted by the `-PLUS` variants.
pub const CHANNEL_BINDING_TYPE: &str = "tls-exporter";

/// Length of generated nonce in bytes (will be base64 encoded).
const NONCE_LENGTH: usize = 24;

/// Length of generated salts in bytes.
const SALT_LENGTH: usize = 16;

/// Digest a SCRAM mechanism is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScramHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
    /// SHA3-512
    Sha3_512,
}

impl ScramHash {
    /// Every supported digest.
    pub const ALL: [ScramHash; 4] = [
        ScramHash::Sha1,
        ScramHash::Sha256,
        ScramHash::Sha512,
        ScramHash::Sha3_512,
    ];

    /// IANA mechanism name.
    pub fn mechanism(&self, plus: bool) -> &'static str {
        match (self, plus) {
            (ScramHash::Sha1, false) => "SCRAM-SHA-1",
            (ScramHash::Sha1, true) => "SCRAM-SHA-1-PLUS",
            (ScramHash::Sha256, false) => "SCRAM-SHA-256",
            (ScramHash::Sha256, true) => "SCRAM-SHA-256-PLUS",
            (ScramHash::Sha512, false) => "SCRAM-SHA-512",
            (ScramHash::Sha512, true) => "SCRAM-SHA-512-PLUS",
            (ScramHash::Sha3_512, false) => "SCRAM-SHA3-512",
            (ScramHash::Sha3_512, true) => "SCRAM-SHA3-512-PLUS",
        }
    }

    /// Digest output size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            ScramHash::Sha1 => 20,
            ScramHash::Sha256 => 32,
            ScramHash::Sha512 | ScramHash::Sha3_512 => 64,
        }
    }

    /// `Hi()`: PBKDF2 with HMAC over this digest.
    pub fn hi(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; self.output_len()];
        match self {
            ScramHash::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output),
            ScramHash::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output),
            ScramHash::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut output),
            ScramHash::Sha3_512 => pbkdf2_hmac::<Sha3_512>(password, salt, iterations, &mut output),
        }
        output
    }

    /// `HMAC(key, data)`.
    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self {
            ScramHash::Sha1 => mac::<Hmac<Sha1>>(key, data),
            ScramHash::Sha256 => mac::<Hmac<Sha256>>(key, data),
            ScramHash::Sha512 => mac::<Hmac<Sha512>>(key, data),
            ScramHash::Sha3_512 => mac::<Hmac<Sha3_512>>(key, data),
        }
    }

    /// `H(data)`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha1 => Sha1::digest(data).to_vec(),
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
            ScramHash::Sha3_512 => Sha3_512::digest(data).to_vec(),
        }
    }
}

fn mac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
    let mut mac = <M as KeyInit>::new_from_slice(key).map_err(|_| SaslError::TemporaryAuthFailure)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive `(StoredKey, ServerKey)` for `password`.
///
/// This is what the repository keeps; the plaintext password is never
/// stored.
pub fn generate_scram_keys(
    hash: ScramHash,
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<(Vec<u8>, Vec<u8>), SaslError> {
    let salted_password = hash.hi(password.as_bytes(), salt, iterations);
    let client_key = hash.hmac(&salted_password, b"Client Key")?;
    let stored_key = hash.digest(&client_key);
    let server_key = hash.hmac(&salted_password, b"Server Key")?;
    Ok((stored_key, server_key))
}

/// Generate a random salt.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::rng().fill(&mut salt[..]);
    salt
}

/// Generate a random nonce string.
fn generate_nonce() -> String {
    let mut nonce_bytes = vec![0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce_bytes[..]);
    BASE64_STANDARD.encode(&nonce_bytes)
}

/// SCRAM exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramState {
    /// Waiting for client-first-message
    Initial,
    /// client-first parsed, server-first not sent yet
    ClientFirstReceived,
    /// server-first sent, waiting for client-final
    WaitingForClientFinal,
    /// Exchange finished (success or failure)
    Complete,
}

/// Identity claimed in the client-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFirst {
    /// Authentication identity
    pub username: String,
    /// Requested authorization identity
    pub authzid: Option<String>,
}

/// Server-side SCRAM state machine.
#[derive(Debug, Clone)]
pub struct ScramServer {
    hash: ScramHash,
    plus: bool,
    channel_binding: Option<Vec<u8>>,
    state: ScramState,
    gs2_header: String,
    client_first_bare: String,
    client_nonce: String,
    server_first: String,
    combined_nonce: String,
}

impl ScramServer {
    /// Create a state machine for `hash`. `channel_binding` carries the
    /// transport's `tls-exporter` data when TLS is active.
    pub fn new(hash: ScramHash, plus: bool, channel_binding: Option<Vec<u8>>) -> Self {
        Self {
            hash,
            plus,
            channel_binding,
            state: ScramState::Initial,
            gs2_header: String::new(),
            client_first_bare: String::new(),
            client_nonce: String::new(),
            server_first: String::new(),
            combined_nonce: String::new(),
        }
    }

    /// Digest in use.
    pub fn hash(&self) -> ScramHash {
        self.hash
    }

    /// Whether this is a `-PLUS` variant.
    pub fn is_plus(&self) -> bool {
        self.plus
    }

    /// Current state.
    pub fn state(&self) -> ScramState {
        self.state
    }

    /// Go back to the initial state.
    pub fn reset(&mut self) {
        *self = Self::new(self.hash, self.plus, self.channel_binding.take());
    }

    /// Parse and validate the client-first-message.
    pub fn process_client_first(&mut self, client_first: &str) -> Result<ClientFirst, SaslError> {
        if self.state != ScramState::Initial {
            return Err(SaslError::MalformedRequest);
        }
        let parsed = parse_client_first(client_first)?;

        match parsed.gs2_cbind_flag {
            'p' => {
                if !self.plus || self.channel_binding.is_none() {
                    return Err(SaslError::NotAuthorized);
                }
                if parsed.cb_name.as_deref() != Some(CHANNEL_BINDING_TYPE) {
                    return Err(SaslError::MalformedRequest);
                }
            }
            'y' => {
                // The client believes we cannot bind; if we can, this is a downgrade.
                if self.plus || self.channel_binding.is_some() {
                    return Err(SaslError::NotAuthorized);
                }
            }
            'n' => {
                if self.plus {
                    return Err(SaslError::NotAuthorized);
                }
            }
            _ => return Err(SaslError::MalformedRequest),
        }

        self.gs2_header = parsed.gs2_header;
        self.client_first_bare = parsed.bare;
        self.client_nonce = parsed.client_nonce;
        self.state = ScramState::ClientFirstReceived;

        Ok(ClientFirst {
            username: parsed.username,
            authzid: parsed.authzid,
        })
    }

    /// Build the server-first-message from the user's stored salt.
    pub fn server_first(&mut self, salt: &[u8], iterations: u32) -> Result<String, SaslError> {
        if self.state != ScramState::ClientFirstReceived {
            return Err(SaslError::MalformedRequest);
        }
        self.combined_nonce = format!("{}{}", self.client_nonce, generate_nonce());
        self.server_first = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64_STANDARD.encode(salt),
            iterations
        );
        self.state = ScramState::WaitingForClientFinal;
        Ok(self.server_first.clone())
    }

    /// Verify the client-final-message and return the server-final-message.
    pub fn process_client_final(
        &mut self,
        client_final: &str,
        stored_key: &[u8],
        server_key: &[u8],
    ) -> Result<String, SaslError> {
        if self.state != ScramState::WaitingForClientFinal {
            return Err(SaslError::MalformedRequest);
        }
        self.state = ScramState::Complete;

        let parsed = parse_client_final(client_final)?;
        if parsed.nonce != self.combined_nonce {
            return Err(SaslError::NotAuthorized);
        }

        let mut expected_cb = self.gs2_header.as_bytes().to_vec();
        if self.gs2_header.starts_with("p=") {
            if let Some(ref data) = self.channel_binding {
                expected_cb.extend_from_slice(data);
            }
        }
        let cb = BASE64_STANDARD
            .decode(&parsed.channel_binding)
            .map_err(|_| SaslError::IncorrectEncoding)?;
        if cb != expected_cb {
            return Err(SaslError::NotAuthorized);
        }

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, parsed.without_proof
        );
        let client_signature = self.hash.hmac(stored_key, auth_message.as_bytes())?;
        let client_proof = BASE64_STANDARD
            .decode(&parsed.proof)
            .map_err(|_| SaslError::IncorrectEncoding)?;
        if client_proof.len() != client_signature.len() {
            return Err(SaslError::NotAuthorized);
        }

        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if !constant_time_eq(&self.hash.digest(&client_key), stored_key) {
            return Err(SaslError::NotAuthorized);
        }

        let server_signature = self.hash.hmac(server_key, auth_message.as_bytes())?;
        Ok(format!("v={}", BASE64_STANDARD.encode(server_signature)))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone)]
struct ClientFirstMessage {
    gs2_cbind_flag: char,
    cb_name: Option<String>,
    authzid: Option<String>,
    username: String,
    client_nonce: String,
    gs2_header: String,
    bare: String,
}

#[derive(Debug, Clone)]
struct ClientFinalMessage {
    channel_binding: String,
    nonce: String,
    proof: String,
    without_proof: String,
}

/// Parse client-first-message.
///
/// Format: `gs2-header client-first-message-bare` where the gs2-header is
/// `flag,[a=authzid],` and flag is `n`, `y` or `p=<cb-name>`.
fn parse_client_first(message: &str) -> Result<ClientFirstMessage, SaslError> {
    let parts: Vec<&str> = message.splitn(3, ',').collect();
    if parts.len() < 3 {
        return Err(SaslError::MalformedRequest);
    }

    let (gs2_cbind_flag, cb_name) = match parts[0] {
        "n" => ('n', None),
        "y" => ('y', None),
        flag => match flag.strip_prefix("p=") {
            Some(name) if !name.is_empty() => ('p', Some(name.to_string())),
            _ => return Err(SaslError::MalformedRequest),
        },
    };

    let authzid = if let Some(raw) = parts[1].strip_prefix("a=") {
        Some(decode_sasl_name(raw)?)
    } else if parts[1].is_empty() {
        None
    } else {
        return Err(SaslError::MalformedRequest);
    };

    let bare = parts[2].to_string();
    let mut username = None;
    let mut client_nonce = None;
    for attr in bare.split(',') {
        if let Some(val) = attr.strip_prefix("n=") {
            username = Some(decode_sasl_name(val)?);
        } else if let Some(val) = attr.strip_prefix("r=") {
            client_nonce = Some(val.to_string());
        } else if attr.starts_with("m=") {
            // Mandatory extensions are not supported.
            return Err(SaslError::MalformedRequest);
        }
    }

    let username = username
        .filter(|u| !u.is_empty())
        .ok_or(SaslError::MalformedRequest)?;
    let client_nonce = client_nonce
        .filter(|n| !n.is_empty())
        .ok_or(SaslError::MalformedRequest)?;

    Ok(ClientFirstMessage {
        gs2_cbind_flag,
        cb_name,
        authzid,
        username,
        client_nonce,
        gs2_header: format!("{},{},", parts[0], parts[1]),
        bare,
    })
}

/// Parse client-final-message.
///
/// Format: `c=channel-binding,r=nonce[,extensions],p=proof`
fn parse_client_final(message: &str) -> Result<ClientFinalMessage, SaslError> {
    let proof_idx = message.rfind(",p=").ok_or(SaslError::MalformedRequest)?;
    let without_proof = &message[..proof_idx];

    let mut channel_binding = None;
    let mut nonce = None;
    let mut proof = None;
    for attr in message.split(',') {
        if let Some(val) = attr.strip_prefix("c=") {
            channel_binding = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("p=") {
            proof = Some(val.to_string());
        }
    }

    Ok(ClientFinalMessage {
        channel_binding: channel_binding.ok_or(SaslError::MalformedRequest)?,
        nonce: nonce.ok_or(SaslError::MalformedRequest)?,
        proof: proof.ok_or(SaslError::MalformedRequest)?,
        without_proof: without_proof.to_string(),
    })
}

/// Decode a SASL name (RFC 5802 escaping).
/// - `=2C` -> `,`
/// - `=3D` -> `=`
fn decode_sasl_name(name: &str) -> Result<String, SaslError> {
    let mut result = String::new();
    let mut chars = name.chars();

    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(SaslError::IncorrectEncoding),
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// Encode a SASL name (RFC 5802 escaping).
/// - `,` -> `=2C`
/// - `=` -> `=3D`
pub fn encode_sasl_name(name: &str) -> String {
    let mut result = String::new();
    for c in name.chars() {
        match c {
            ',' => result.push_str("=2C"),
            '=' => result.push_str("=3D"),
            _ => result.push(c),
        }
    }
    result
}

/// Client half of the exchange, used by tests and the integration harness.
#[cfg(test)]
pub(crate) mod client {
    use super::*;

    /// Compute the client-final-message for a server-first-message.
    pub(crate) fn client_final(
        hash: ScramHash,
        password: &str,
        gs2_header: &str,
        channel_binding: Option<&[u8]>,
        client_first_bare: &str,
        server_first: &str,
    ) -> String {
        let mut attrs = server_first.split(',');
        let nonce = attrs.next().unwrap().strip_prefix("r=").unwrap();
        let salt = BASE64_STANDARD
            .decode(attrs.next().unwrap().strip_prefix("s=").unwrap())
            .unwrap();
        let iterations: u32 = attrs
            .next()
            .unwrap()
            .strip_prefix("i=")
            .unwrap()
            .parse()
            .unwrap();

        let salted = hash.hi(password.as_bytes(), &salt, iterations);
        let client_key = hash.hmac(&salted, b"Client Key").unwrap();
        let stored_key = hash.digest(&client_key);

        let mut cb = gs2_header.as_bytes().to_vec();
        if let Some(data) = channel_binding {
            cb.extend_from_slice(data);
        }
        let without_proof = format!("c={},r={}", BASE64_STANDARD.encode(cb), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = hash.hmac(&stored_key, auth_message.as_bytes()).unwrap();
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        format!("{},p={}", without_proof, BASE64_STANDARD.encode(proof))
    }
}
