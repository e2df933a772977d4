//! SCRAM-SHA-256 primitives used by the handshake.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ReqlError, ReqlResult};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const NONCE_BYTES: usize = 18;

pub type SaltedPassword = [u8; KEY_LEN];

/// Fresh base64 client nonce.
pub fn client_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Escape a SCRAM `saslname`.
pub fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

fn hmac(key: &[u8], data: &[u8]) -> ReqlResult<[u8; KEY_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ReqlError::Auth(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// PBKDF2-HMAC-SHA256 with a single 32-byte output block.
pub fn salt_password(password: &[u8], salt: &[u8], iterations: u32) -> ReqlResult<SaltedPassword> {
    if iterations == 0 {
        return Err(ReqlError::Auth("Iteration count must be positive".to_string()));
    }

    let mut output = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    Ok(output)
}

/// Client proof and expected server signature for one authentication exchange.
pub struct ScramProof {
    pub proof: [u8; KEY_LEN],
    pub server_signature: [u8; KEY_LEN],
}

pub fn compute_proof(salted: &SaltedPassword, auth_message: &str) -> ReqlResult<ScramProof> {
    let client_key = hmac(salted, b"Client Key")?;
    let stored_key: [u8; KEY_LEN] = Sha256::digest(client_key).into();
    let client_signature = hmac(&stored_key, auth_message.as_bytes())?;

    let mut proof = [0u8; KEY_LEN];
    for (i, byte) in proof.iter_mut().enumerate() {
        *byte = client_key[i] ^ client_signature[i];
    }

    let server_key = hmac(salted, b"Server Key")?;
    let server_signature = hmac(&server_key, auth_message.as_bytes())?;

    Ok(ScramProof {
        proof,
        server_signature,
    })
}

/// Constant-time comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parse `k=v,k=v` attribute lists. Values may themselves contain `=`.
pub fn parse_attributes(message: &str) -> Vec<(&str, &str)> {
    message
        .split(',')
        .filter_map(|part| part.split_once('='))
        .collect()
}

pub fn attribute<'a>(attrs: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}
