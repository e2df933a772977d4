//! Connection handshake
//!
//! A sans-I/O state machine for the V1_0 handshake: version negotiation
//! followed by a SCRAM-SHA-256 exchange. The connection feeds it one parsed
//! NUL-terminated server message at a time and writes whatever it returns.
//! Key derivation is the one blocking step: the machine parks in
//! `DerivingKey` until [`Handshake::derive`] has run PBKDF2 off the runtime.
//!
//! ```text
//! ExpectingVersionAck(0) ──► ExpectingAuthChallenge(1) ──► DerivingKey(3) ──► ExpectingAuthSuccess(2) ──► Authenticated(4)
//!          │                          │                         │                      │
//!          └──────────────────────────┴─────────────────────────┴──────────────────────┴──► Errored(-1)
//! ```

pub mod cache;
pub mod scram;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::error::{ReqlError, ReqlResult};
use crate::protocol::{
    encode_handshake_message, encode_handshake_start, AUTHENTICATION_METHOD,
    PROTOCOL_VERSION_V1_0, SUB_PROTOCOL_VERSION,
};

pub use cache::{KeyCache, DEFAULT_KEY_CACHE_CAPACITY};

/// Largest PBKDF2 iteration count a server may ask for.
pub const MAX_ITERATIONS: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum HandshakeState {
    ExpectingVersionAck = 0,
    ExpectingAuthChallenge = 1,
    ExpectingAuthSuccess = 2,
    DerivingKey = 3,
    Authenticated = 4,
    Errored = -1,
}

/// What the connection must do after feeding a server message.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Nothing to send, wait for the next server message
    Wait,
    /// Write these bytes, then wait for the next server message
    Send(Vec<u8>),
    /// Await [`Handshake::derive`] before reading anything else
    Derive,
    /// The connection is authenticated and ready for queries
    Authenticated,
}

pub struct Handshake {
    state: HandshakeState,
    password: Vec<u8>,
    client_nonce: String,
    client_first_bare: String,
    expected_server_signature: Option<[u8; scram::KEY_LEN]>,
    challenge: Option<Challenge>,
    cache: KeyCache,
}

/// A validated server-first message waiting for its salted password.
struct Challenge {
    server_first: String,
    server_nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl Handshake {
    pub fn new(user: &str, password: &str, cache: KeyCache) -> Self {
        Self::with_nonce(user, password, scram::client_nonce(), cache)
    }

    /// Build a handshake with a fixed client nonce.
    pub fn with_nonce(user: &str, password: &str, nonce: String, cache: KeyCache) -> Self {
        let client_first_bare = format!("n={},r={}", scram::escape_username(user), nonce);
        Self {
            state: HandshakeState::ExpectingVersionAck,
            password: password.as_bytes().to_vec(),
            client_nonce: nonce,
            client_first_bare,
            expected_server_signature: None,
            challenge: None,
            cache,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn client_nonce(&self) -> &str {
        &self.client_nonce
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }

    /// Version prefix plus the client-first message.
    pub fn start(&self) -> ReqlResult<Vec<u8>> {
        encode_handshake_start(
            PROTOCOL_VERSION_V1_0,
            &json!({
                "protocol_version": SUB_PROTOCOL_VERSION,
                "authentication_method": AUTHENTICATION_METHOD,
                "authentication": format!("n,,{}", self.client_first_bare),
            }),
        )
    }

    /// Feed one server message. Any failure moves the machine to `Errored`.
    pub fn step(&mut self, message: Value) -> ReqlResult<HandshakeAction> {
        let result = self.advance(message);
        if result.is_err() {
            self.state = HandshakeState::Errored;
        }
        result
    }

    fn advance(&mut self, message: Value) -> ReqlResult<HandshakeAction> {
        match self.state {
            HandshakeState::ExpectingVersionAck => {
                check_success(&message, self.state)?;
                self.on_version_ack(&message)
            }
            HandshakeState::ExpectingAuthChallenge => {
                check_success(&message, self.state)?;
                self.on_challenge(&message)
            }
            HandshakeState::ExpectingAuthSuccess => {
                check_success(&message, self.state)?;
                self.on_auth_success(&message)
            }
            HandshakeState::DerivingKey => Err(ReqlError::driver(
                "Unexpected handshake message while deriving the client key",
            )),
            HandshakeState::Authenticated => Err(ReqlError::driver(
                "Unexpected handshake message after authentication",
            )),
            HandshakeState::Errored => Err(ReqlError::driver("The handshake has already failed")),
        }
    }

    fn on_version_ack(&mut self, message: &Value) -> ReqlResult<HandshakeAction> {
        let min = message.get("min_protocol_version").and_then(Value::as_i64);
        let max = message.get("max_protocol_version").and_then(Value::as_i64);

        match (min, max) {
            (Some(min), Some(max)) if (min..=max).contains(&SUB_PROTOCOL_VERSION) => {
                tracing::debug!("Server accepted protocol version {}", SUB_PROTOCOL_VERSION);
                self.state = HandshakeState::ExpectingAuthChallenge;
                Ok(HandshakeAction::Wait)
            }
            (Some(min), Some(max)) => Err(ReqlError::driver(format!(
                "Unsupported protocol version {}, expected between {} and {}",
                SUB_PROTOCOL_VERSION, min, max
            ))),
            _ => Err(ReqlError::driver(
                "Protocol version negotiation failed: server did not send a version range",
            )),
        }
    }

    fn on_challenge(&mut self, message: &Value) -> ReqlResult<HandshakeAction> {
        let server_first = authentication_field(message)?;
        let attrs = scram::parse_attributes(server_first);

        let server_nonce = scram::attribute(&attrs, "r")
            .ok_or_else(|| ReqlError::Auth("Challenge is missing the server nonce".into()))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ReqlError::Auth("Invalid nonce from server".into()));
        }

        let salt = scram::attribute(&attrs, "s")
            .ok_or_else(|| ReqlError::Auth("Challenge is missing the salt".into()))
            .and_then(|s| {
                STANDARD
                    .decode(s)
                    .map_err(|e| ReqlError::Auth(format!("Invalid salt: {}", e)))
            })?;
        let iterations = scram::attribute(&attrs, "i")
            .and_then(|i| i.parse::<u32>().ok())
            .ok_or_else(|| ReqlError::Auth("Challenge has an invalid iteration count".into()))?;
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(ReqlError::Auth(format!(
                "Challenge iteration count {} is outside 1..={}",
                iterations, MAX_ITERATIONS
            )));
        }

        self.challenge = Some(Challenge {
            server_first: server_first.to_string(),
            server_nonce: server_nonce.to_string(),
            salt,
            iterations,
        });
        self.state = HandshakeState::DerivingKey;
        Ok(HandshakeAction::Derive)
    }

    /// Derive the salted password for the pending challenge and build the
    /// client-final message. PBKDF2 runs on the blocking pool, so connect
    /// timeouts keep firing while it works.
    pub async fn derive(&mut self) -> ReqlResult<HandshakeAction> {
        let result = self.prove().await;
        if result.is_err() {
            self.state = HandshakeState::Errored;
        }
        result
    }

    async fn prove(&mut self) -> ReqlResult<HandshakeAction> {
        if self.state != HandshakeState::DerivingKey {
            return Err(ReqlError::driver("No authentication challenge to answer"));
        }
        let challenge = self
            .challenge
            .take()
            .ok_or_else(|| ReqlError::driver("No authentication challenge to answer"))?;

        let salted = self
            .cache
            .salted_password(&self.password, &challenge.salt, challenge.iterations)
            .await?;

        let client_final_without_proof = format!("c=biws,r={}", challenge.server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, challenge.server_first, client_final_without_proof
        );
        let proof = scram::compute_proof(&salted, &auth_message)?;
        self.expected_server_signature = Some(proof.server_signature);

        let reply = encode_handshake_message(&json!({
            "authentication": format!(
                "{},p={}",
                client_final_without_proof,
                STANDARD.encode(proof.proof)
            ),
        }))?;

        self.state = HandshakeState::ExpectingAuthSuccess;
        Ok(HandshakeAction::Send(reply))
    }

    fn on_auth_success(&mut self, message: &Value) -> ReqlResult<HandshakeAction> {
        let server_final = authentication_field(message)?;
        let signature = server_final
            .split_once('=')
            .map(|(_, v)| v)
            .ok_or_else(|| ReqlError::Auth("Malformed server signature".into()))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|e| ReqlError::Auth(format!("Invalid server signature: {}", e)))?;

        let expected = self
            .expected_server_signature
            .take()
            .ok_or_else(|| ReqlError::Auth("No server signature was expected".into()))?;

        if !scram::constant_time_eq(&signature, &expected) {
            return Err(ReqlError::Auth("Invalid server signature".into()));
        }

        self.state = HandshakeState::Authenticated;
        Ok(HandshakeAction::Authenticated)
    }
}

fn authentication_field(message: &Value) -> ReqlResult<&str> {
    message
        .get("authentication")
        .and_then(Value::as_str)
        .ok_or_else(|| ReqlError::Auth("Missing `authentication` field".into()))
}

fn check_success(message: &Value, state: HandshakeState) -> ReqlResult<()> {
    if message.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }

    let reason = message
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let code = message.get("error_code").and_then(Value::as_i64);

    // Codes 10-20 are reserved for authentication failures.
    match code {
        Some(10..=20) => Err(ReqlError::Auth(reason.to_string())),
        _ => Err(ReqlError::driver(format!(
            "Server dropped connection during handshake ({:?}): {}",
            state, reason
        ))),
    }
}
