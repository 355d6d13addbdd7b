//! Password authentication primitives.
//!
//! SASL SCRAM-SHA-256 (RFC 5802, RFC 7677) without channel binding, and the
//! legacy MD5 password hash. Pure computation: the message exchange itself
//! lives in `driver::startup`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism this client speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// base64("n,,"): no channel binding
const CHANNEL_BINDING: &str = "biws";

const NONCE_LEN: usize = 24;
const NONCE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// First client message of a SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslInitial {
    pub client_nonce: String,
    /// client-first-message, sent in SASLInitialResponse
    pub response: Vec<u8>,
}

/// Client answer to the server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslContinue {
    /// client-final-message, sent in SASLResponse
    pub response: Vec<u8>,
    /// Signature the server must present in its final message
    pub server_signature: Vec<u8>,
}

/// SASL mechanism computations, kept stateless so the negotiator owns the
/// exchange state (nonce, expected signature) for exactly one handshake.
pub trait SaslHelper: Send + Sync {
    /// Produce a fresh client nonce and the client-first-message.
    fn initial_response(&self) -> SaslInitial;

    /// Answer the server-first-message.
    fn continue_response(
        &self,
        password: &str,
        client_nonce: &str,
        server_first: &[u8],
    ) -> Result<SaslContinue, String>;

    /// Check the server-final-message against the expected signature.
    fn verify_final(&self, server_final: &[u8], expected_signature: &[u8]) -> Result<(), String>;
}

/// SCRAM-SHA-256 client.
#[derive(Debug, Clone)]
pub struct ScramSha256 {
    /// Username placed in client-first-message. PostgreSQL ignores it and
    /// authenticates the startup user.
    username: String,
    /// Fixed nonce; `None` draws a random one per handshake
    nonce: Option<String>,
}

impl Default for ScramSha256 {
    fn default() -> Self {
        Self {
            username: "*".to_string(),
            nonce: None,
        }
    }
}

impl ScramSha256 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client with a fixed username and nonce, for reproducible exchanges.
    pub fn with_nonce(username: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            nonce: Some(nonce.to_string()),
        }
    }

    fn generate_nonce() -> String {
        let mut rng = rand::rng();
        (0..NONCE_LEN)
            .map(|_| NONCE_CHARS[rng.random_range(0..NONCE_CHARS.len())] as char)
            .collect()
    }

    fn client_first_message_bare(&self, client_nonce: &str) -> String {
        format!("n={},r={}", self.username, client_nonce)
    }

    /// Derive salted password using PBKDF2-SHA256.
    fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut output = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut output);
        output
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Parsed server-first-message: `r=<nonce>,s=<salt>,i=<iterations>`
struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(message: &str) -> Result<Self, String> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| "Invalid salt base64")?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|_| "Invalid iteration count")?);
            } else if part.starts_with("m=") {
                return Err("Server requires an unsupported SCRAM extension".to_string());
            }
        }

        let iterations = iterations.ok_or("Missing iterations in server message")?;
        if iterations == 0 {
            return Err("Invalid iteration count".to_string());
        }

        Ok(Self {
            nonce: nonce.ok_or("Missing nonce in server message")?,
            salt: salt.ok_or("Missing salt in server message")?,
            iterations,
        })
    }
}

impl SaslHelper for ScramSha256 {
    /// Format: `n,,n=<user>,r=<nonce>`
    fn initial_response(&self) -> SaslInitial {
        let client_nonce = self.nonce.clone().unwrap_or_else(Self::generate_nonce);
        let response = format!("n,,{}", self.client_first_message_bare(&client_nonce));
        SaslInitial {
            client_nonce,
            response: response.into_bytes(),
        }
    }

    fn continue_response(
        &self,
        password: &str,
        client_nonce: &str,
        server_first: &[u8],
    ) -> Result<SaslContinue, String> {
        let server_str =
            std::str::from_utf8(server_first).map_err(|_| "Invalid UTF-8 in server message")?;
        let server = ServerFirst::parse(server_str)?;

        // The combined nonce must extend ours
        if !server.nonce.starts_with(client_nonce) || server.nonce.len() <= client_nonce.len() {
            return Err("Server nonce doesn't extend client nonce".to_string());
        }

        let salted_password = Self::salted_password(password, &server.salt, server.iterations);
        let client_key = Self::hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let client_final_without_proof = format!("c={},r={}", CHANNEL_BINDING, server.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(client_nonce),
            server_str,
            client_final_without_proof
        );

        let client_signature = Self::hmac(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = Self::hmac(&salted_password, b"Server Key");
        let server_signature = Self::hmac(&server_key, auth_message.as_bytes());

        let response = format!("{},p={}", client_final_without_proof, BASE64.encode(client_proof));
        Ok(SaslContinue {
            response: response.into_bytes(),
            server_signature,
        })
    }

    fn verify_final(&self, server_final: &[u8], expected_signature: &[u8]) -> Result<(), String> {
        let server_str = std::str::from_utf8(server_final)
            .map_err(|_| "Invalid UTF-8 in server final message")?;

        if let Some(reason) = server_str.strip_prefix("e=") {
            return Err(format!("Server rejected SCRAM exchange: {}", reason));
        }

        let verifier = server_str
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or("Missing verifier in server final message")?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| "Invalid base64 in server signature")?;

        if signature != expected_signature {
            return Err("Server signature verification failed".to_string());
        }
        Ok(())
    }
}

/// MD5 password hash: `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", Md5::digest(format!("{}{}", password, user).as_bytes()));

    let mut outer = Md5::new();
    outer.update(inner.as_bytes());
    outer.update(salt);
    format!("md5{:x}", outer.finalize())
}

/// Lowercase hex MD5 of arbitrary bytes.
pub(crate) fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}
