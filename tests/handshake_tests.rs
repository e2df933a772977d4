//! Handshake Tests
//!
//! Connects to the in-process mock server and checks the authentication
//! outcomes end to end.

mod common;

use std::time::{Duration, Instant};

use common::{handler, MockConfig, MockServer};
use reql_core::handshake::MAX_ITERATIONS;
use reql_core::{Driver, ReqlError};
use tokio::net::TcpListener;

fn silent() -> common::Handler {
    handler(|_, _| Vec::new())
}

#[tokio::test]
async fn test_connect_and_authenticate() {
    let server = MockServer::start(silent()).await;
    let driver = Driver::new();

    let conn = tokio_test::assert_ok!(driver.connect(server.options()).await);
    assert!(conn.is_open());

    let messages = server.handshake.lock().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["protocol_version"], 0);
    assert_eq!(messages[0]["authentication_method"], "SCRAM-SHA-256");
    assert!(messages[0]["authentication"]
        .as_str()
        .unwrap()
        .starts_with("n,,n=admin,r="));
    assert!(messages[1]["authentication"]
        .as_str()
        .unwrap()
        .starts_with("c=biws,r="));
}

#[tokio::test]
async fn test_wrong_password_is_an_auth_error() {
    let server = MockServer::start(silent()).await;
    let options = server.options().password("wrong");

    let err = tokio_test::assert_err!(Driver::new().connect(options).await);
    assert!(matches!(err, ReqlError::Auth(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_bad_nonce_fails_before_proof() {
    let config = MockConfig {
        bad_nonce: true,
        ..Default::default()
    };
    let server = MockServer::with_config(config, silent()).await;

    let err = tokio_test::assert_err!(Driver::new().connect(server.options()).await);
    assert!(matches!(err, ReqlError::Auth(ref msg) if msg.contains("nonce")));

    // Give the server a moment to observe the closed socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.handshake.lock().len(), 1, "a proof was sent");
}

#[tokio::test]
async fn test_excessive_iteration_count_is_rejected() {
    let config = MockConfig {
        iterations: MAX_ITERATIONS + 1,
        ..Default::default()
    };
    let server = MockServer::with_config(config, silent()).await;
    let driver = Driver::new();

    let started = Instant::now();
    let err = tokio_test::assert_err!(driver.connect(server.options()).await);
    assert!(matches!(err, ReqlError::Auth(ref msg) if msg.contains("iteration count")), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(driver.key_cache().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.handshake.lock().len(), 1, "a proof was sent");
}

#[tokio::test]
async fn test_connect_timeout_covers_key_derivation() {
    // Slow enough that deriving on the runtime thread would overrun the timeout.
    let config = MockConfig {
        iterations: 500_000,
        stall_after_challenge: true,
        ..Default::default()
    };
    let server = MockServer::with_config(config, silent()).await;
    let options = server.options().timeout_secs(1);

    let started = Instant::now();
    let err = tokio_test::assert_err!(Driver::new().connect(options).await);
    let elapsed = started.elapsed();
    assert!(err.to_string().contains("in less than 1s"), "got {}", err);
    assert!(elapsed < Duration::from_secs(2), "connect took {:?}", elapsed);
}

#[tokio::test]
async fn test_derived_keys_are_cached_per_driver() {
    let server = MockServer::start(silent()).await;
    let driver = Driver::new();

    let first = driver.connect(server.options()).await.unwrap();
    let second = driver.connect(server.options()).await.unwrap();
    assert_eq!(driver.key_cache().len(), 1);

    first.close(Default::default()).await.unwrap();
    second.close(Default::default()).await.unwrap();
}

#[tokio::test]
async fn test_connect_timeout() {
    // Accepts but never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let options = reql_core::ConnectOptions::new("127.0.0.1", port).timeout_secs(1);
    let err = Driver::new().connect(options).await.unwrap_err();
    assert!(err.to_string().contains("in less than 1s"), "got {}", err);
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let options = reql_core::ConnectOptions::new("127.0.0.1", port);
    let err = Driver::new().connect(options).await.unwrap_err();
    assert!(err.is_driver_error());
    assert!(err.to_string().contains("Failed to connect"));
}
