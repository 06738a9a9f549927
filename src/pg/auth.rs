//! Password authentication: cleartext, MD5 and SCRAM-SHA-256.
//!
//! SCRAM follows RFC 5802 and RFC 7677 without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::error::PgError;

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism we speak.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// `concat('md5', md5(concat(md5(concat(password, username)), salt)))`
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("invalid {0} in server-first-message")]
    InvalidAttribute(&'static str),
    #[error("missing {0} in server-first-message")]
    MissingAttribute(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server reported: {0}")]
    ServerError(String),
    #[error("server signature does not match")]
    SignatureMismatch,
    #[error("server-final-message before server-first-message")]
    OutOfOrder,
}

impl From<ScramError> for PgError {
    fn from(err: ScramError) -> Self {
        PgError::Auth(format!("SCRAM-SHA-256: {}", err))
    }
}

/// Keys derived once the salt and iteration count are known.
struct Exchange {
    auth_message: String,
    salted_password: [u8; 32],
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramSha256 {
    user: String,
    password: String,
    client_nonce: String,
    exchange: Option<Exchange>,
}

impl ScramSha256 {
    /// Start an exchange with a fresh random nonce.
    pub fn new(user: &str, password: &str) -> Self {
        // 18 random bytes encode to 24 base64 characters
        let nonce: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, &BASE64.encode(nonce))
    }

    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            exchange: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.user, self.client_nonce)
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=..,s=..,i=..` and produce the client-final-message.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|_| ScramError::InvalidAttribute("salt"))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .ok()
                        .filter(|&i| i > 0)
                        .ok_or(ScramError::InvalidAttribute("iteration count"))?,
                );
            }
        }

        let nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iteration count"))?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        // c=biws is base64("n,,"), the GS2 header without channel binding
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature) {
            *p ^= s;
        }

        self.exchange = Some(Exchange {
            auth_message,
            salted_password,
        });

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server signature in `v=..`.
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_final).map_err(|_| ScramError::InvalidServerMessage)?;
        let exchange = self.exchange.as_ref().ok_or(ScramError::OutOfOrder)?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::MissingAttribute("verifier"))?;
        let verifier = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidAttribute("verifier"))?;

        let server_key = hmac_sha256(&exchange.salted_password, b"Server Key");
        let mut mac = hmac_with_key(&server_key);
        mac.update(exchange.auth_message.as_bytes());
        mac.verify_slice(&verifier)
            .map_err(|_| ScramError::SignatureMismatch)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() - PBKDF2 with HMAC-SHA-256
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password, salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidAttribute("salt"))?;
    Ok(output)
}

fn hmac_with_key(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length; the error arm is unreachable
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC key length is unrestricted"),
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = hmac_with_key(key);
    mac.update(data);
    mac.finalize().into_bytes().into()
}
