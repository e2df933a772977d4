//! Common test utilities for connection tests
//!
//! Provides an in-process mock server that:
//! - Speaks the server side of the V1_0 handshake (SCRAM-SHA-256)
//! - Records every query frame it receives
//! - Answers frames through a scripted handler

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use reql_core::handshake::scram;
use reql_core::protocol::{encode_handshake_message, encode_query, Framer};
use reql_core::ConnectOptions;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub const USER: &str = "admin";
pub const PASSWORD: &str = "secret";
pub const PING_VALUE: &str = "__rethinkdb_ping__";

/// Maps a received `(token, query)` to the responses to send back.
pub type Handler = Arc<dyn Fn(u64, &Value) -> Vec<Value> + Send + Sync>;

#[derive(Clone)]
pub struct MockConfig {
    pub password: String,
    pub iterations: u32,
    /// Answer the challenge with a nonce that does not extend the client's
    pub bad_nonce: bool,
    /// Send the challenge, then never answer again
    pub stall_after_challenge: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            password: PASSWORD.to_string(),
            iterations: 64,
            bad_nonce: false,
            stall_after_challenge: false,
        }
    }
}

pub struct MockServer {
    pub address: SocketAddr,
    /// Every query frame received, in order
    pub received: Arc<Mutex<Vec<(u64, Value)>>>,
    /// Client handshake messages, in order
    pub handshake: Arc<Mutex<Vec<Value>>>,
    shutdown: watch::Sender<bool>,
}

impl MockServer {
    pub async fn start(handler: Handler) -> Self {
        Self::with_config(MockConfig::default(), handler).await
    }

    pub async fn with_config(config: MockConfig, handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let handshake = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        {
            let received = received.clone();
            let handshake = handshake.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        socket,
                        config.clone(),
                        handler.clone(),
                        received.clone(),
                        handshake.clone(),
                        shutdown_rx.clone(),
                    ));
                }
            });
        }

        Self {
            address,
            received,
            handshake,
            shutdown,
        }
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::new("127.0.0.1", self.address.port())
            .user(USER)
            .password(PASSWORD)
            .timeout_secs(5)
    }

    /// Drop every open client socket.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn queries(&self) -> Vec<(u64, Value)> {
        self.received.lock().clone()
    }

    /// Number of received frames whose query type is `query_type`.
    pub fn count(&self, query_type: u64) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|(_, query)| query[0].as_u64() == Some(query_type))
            .count()
    }

    /// Wait until at least `n` frames have arrived.
    pub async fn wait_for(&self, n: usize) {
        for _ in 0..200 {
            if self.received.lock().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("mock server received fewer than {} frames", n);
    }
}

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(u64, &Value) -> Vec<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Answers keepalive pings and nothing else.
pub fn answer_pings(query: &Value) -> Option<Value> {
    if query[1][1][0] == json!(PING_VALUE) {
        Some(runtime_error(PING_VALUE))
    } else {
        None
    }
}

pub fn atom(value: Value) -> Value {
    json!({"t": 1, "r": [value]})
}

pub fn sequence(rows: Vec<Value>) -> Value {
    json!({"t": 2, "r": rows})
}

pub fn partial(rows: Vec<Value>) -> Value {
    json!({"t": 3, "r": rows})
}

pub fn feed(rows: Vec<Value>, note: i64) -> Value {
    json!({"t": 3, "r": rows, "n": [note]})
}

pub fn wait_complete() -> Value {
    json!({"t": 4, "r": []})
}

pub fn server_info() -> Value {
    json!({"t": 5, "r": [{"id": "mock", "name": "mock_server", "proxy": false}]})
}

pub fn runtime_error(message: &str) -> Value {
    json!({"t": 18, "r": [message], "b": [], "e": 5_000_000})
}

pub fn compile_error(message: &str) -> Value {
    json!({"t": 17, "r": [message], "b": [0]})
}

async fn read_message(socket: &mut TcpStream, framer: &mut Framer) -> Option<Value> {
    let mut buf = [0u8; 1024];
    loop {
        if let Some(message) = framer.next_handshake_message().ok()? {
            return Some(message);
        }
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        framer.push(&buf[..n]);
    }
}

async fn send(socket: &mut TcpStream, message: Value) {
    let bytes = encode_handshake_message(&message).unwrap();
    let _ = socket.write_all(&bytes).await;
}

async fn serve(
    mut socket: TcpStream,
    config: MockConfig,
    handler: Handler,
    received: Arc<Mutex<Vec<(u64, Value)>>>,
    handshake: Arc<Mutex<Vec<Value>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut version = [0u8; 4];
    if socket.read_exact(&mut version).await.is_err() {
        return;
    }
    let mut framer = Framer::new();

    // Client first message.
    let Some(first) = read_message(&mut socket, &mut framer).await else {
        return;
    };
    handshake.lock().push(first.clone());
    let client_first_bare = first["authentication"]
        .as_str()
        .unwrap_or_default()
        .trim_start_matches("n,,")
        .to_string();
    let attrs = scram::parse_attributes(&client_first_bare);
    let client_nonce = scram::attribute(&attrs, "r").unwrap_or_default().to_string();

    send(
        &mut socket,
        json!({
            "success": true,
            "min_protocol_version": 0,
            "max_protocol_version": 0,
            "server_version": "mock"
        }),
    )
    .await;

    let salt = b"mock-salt";
    let server_nonce = if config.bad_nonce {
        "not-the-client-nonce".to_string()
    } else {
        format!("{}mockservernonce", client_nonce)
    };
    let server_first = format!(
        "r={},s={},i={}",
        server_nonce,
        STANDARD.encode(salt),
        config.iterations
    );
    send(
        &mut socket,
        json!({"success": true, "authentication": server_first}),
    )
    .await;

    if config.stall_after_challenge {
        let mut sink = [0u8; 1024];
        while let Ok(n) = socket.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
        return;
    }

    // Client final message.
    let Some(last) = read_message(&mut socket, &mut framer).await else {
        return;
    };
    handshake.lock().push(last.clone());
    let client_final = last["authentication"].as_str().unwrap_or_default();
    let Some((without_proof, proof)) = client_final.rsplit_once(",p=") else {
        return;
    };

    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let salted =
        scram::salt_password(config.password.as_bytes(), salt, config.iterations).unwrap();
    let expected = scram::compute_proof(&salted, &auth_message).unwrap();
    if STANDARD.encode(expected.proof) != proof {
        send(
            &mut socket,
            json!({"success": false, "error": "Wrong password", "error_code": 12}),
        )
        .await;
        return;
    }
    send(
        &mut socket,
        json!({
            "success": true,
            "authentication": format!("v={}", STANDARD.encode(expected.server_signature))
        }),
    )
    .await;

    // Steady state.
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        while let Ok(Some(frame)) = framer.next_frame() {
            received.lock().push((frame.token, frame.payload.clone()));
            for response in handler(frame.token, &frame.payload) {
                let bytes = encode_query(frame.token, &response).unwrap();
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => framer.push(&buf[..n]),
            },
            _ = shutdown.changed() => return,
        }
    }
}
