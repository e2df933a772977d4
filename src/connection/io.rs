//! Socket setup and the reader/writer tasks.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{keepalive, Connection, ConnectionEvent, ConnectionInner};
use crate::config::ConnectOptions;
use crate::driver::Driver;
use crate::error::{ReqlError, ReqlResult};
use crate::handshake::{Handshake, HandshakeAction};
use crate::protocol::{Framer, RawResponse};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const HANDSHAKE_BUFFER_SIZE: usize = 4096;

pub(crate) trait SocketStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SocketStream for T {}

/// Plain TCP or TLS, behind one type.
pub(crate) type Socket = Box<dyn SocketStream>;

/// Work for the writer task.
pub(crate) enum Outbound {
    Frame { token: u64, frame: Bytes },
    /// Half-close the socket and stop
    Shutdown,
}

/// Connect, authenticate and start the connection tasks.
///
/// The whole sequence is bounded by the configured timeout; on expiry the
/// socket is dropped.
pub(crate) async fn open(driver: Driver, options: ConnectOptions) -> ReqlResult<Connection> {
    let address = options.address();
    debug!("Connecting to {}", address);

    let (socket, framer) =
        match tokio::time::timeout(options.connect_timeout(), establish(&driver, &options)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Connection to {} timed out", address);
                return Err(ReqlError::driver(format!(
                    "Failed to connect to {} in less than {}s.",
                    address, options.timeout
                )));
            }
        };

    info!("Connected to {} as {}", address, options.user);
    Ok(start(driver, options, socket, framer))
}

/// Spawn the reader and writer over an authenticated socket.
///
/// `framer` may already hold bytes received right after the handshake.
pub(crate) fn start(
    driver: Driver,
    options: ConnectOptions,
    socket: Socket,
    framer: Framer,
) -> Connection {
    let (reader, writer) = tokio::io::split(socket);
    let (tx, rx) = mpsc::unbounded_channel();
    let inner = Arc::new(ConnectionInner::new(options, driver, tx));

    let read_task = tokio::spawn(read_loop(inner.clone(), reader, framer));
    let write_task = tokio::spawn(write_loop(inner.clone(), writer, rx));
    inner
        .tasks
        .lock()
        .extend([read_task.abort_handle(), write_task.abort_handle()]);

    if let Some(period) = inner.options.ping_period() {
        keepalive::spawn(&inner, period);
    }

    Connection { inner }
}

async fn establish(driver: &Driver, options: &ConnectOptions) -> ReqlResult<(Socket, Framer)> {
    let address = options.address();
    let tcp = TcpStream::connect(&address).await.map_err(|e| {
        ReqlError::driver(format!(
            "Failed to connect to {}\nFull error:\n{}",
            address, e
        ))
    })?;
    tcp.set_nodelay(true)?;

    let mut socket = wrap_tls(tcp, options).await?;
    let framer = authenticate(&mut socket, driver, options).await?;
    Ok((socket, framer))
}

#[cfg(feature = "tls")]
async fn wrap_tls(tcp: TcpStream, options: &ConnectOptions) -> ReqlResult<Socket> {
    let Some(tls) = &options.tls else {
        return Ok(Box::new(tcp));
    };

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(tls.accept_invalid_certs)
        .build()
        .map_err(|e| ReqlError::driver(format!("Failed to set up TLS: {}", e)))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let domain = tls.domain.as_deref().unwrap_or(&options.host);
    let stream = connector
        .connect(domain, tcp)
        .await
        .map_err(|e| ReqlError::driver(format!("TLS handshake with {} failed: {}", domain, e)))?;
    debug!("TLS established with {}", domain);
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(tcp: TcpStream, options: &ConnectOptions) -> ReqlResult<Socket> {
    if options.tls.is_some() {
        return Err(ReqlError::driver(
            "TLS was requested but reql-core was built without the `tls` feature",
        ));
    }
    Ok(Box::new(tcp))
}

/// Run the handshake. Returns the framer with any bytes read past it.
async fn authenticate(
    socket: &mut Socket,
    driver: &Driver,
    options: &ConnectOptions,
) -> ReqlResult<Framer> {
    let mut handshake = Handshake::new(
        &options.user,
        options.effective_password(),
        driver.key_cache().clone(),
    );

    socket.write_all(&handshake.start()?).await?;
    socket.flush().await?;

    let mut framer = Framer::new();
    let mut buf = vec![0u8; HANDSHAKE_BUFFER_SIZE];
    loop {
        while let Some(message) = framer.next_handshake_message()? {
            let mut action = handshake.step(message)?;
            if action == HandshakeAction::Derive {
                action = handshake.derive().await?;
            }
            match action {
                HandshakeAction::Wait | HandshakeAction::Derive => {}
                HandshakeAction::Send(bytes) => {
                    socket.write_all(&bytes).await?;
                    socket.flush().await?;
                }
                HandshakeAction::Authenticated => {
                    debug!("Authenticated as {}", options.user);
                    return Ok(framer);
                }
            }
        }

        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(ReqlError::driver(
                "The server closed the connection during the handshake",
            ));
        }
        framer.push(&buf[..n]);
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: ReadHalf<Socket>, mut framer: Framer) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        loop {
            match framer.next_frame() {
                Ok(Some(frame)) => match RawResponse::from_value(frame.payload) {
                    Ok(response) => inner.route(frame.token, response),
                    Err(e) => {
                        inner.fail(ReqlError::driver(format!(
                            "Invalid response for token {}: {}",
                            frame.token, e
                        )));
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    inner.fail(e);
                    return;
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Server at {} ended the connection", inner.options.address());
                inner.emit(ConnectionEvent::End);
                inner.flush(&ReqlError::connection_closed());
                break 'read;
            }
            Ok(n) => framer.push(&buf[..n]),
            Err(e) => {
                warn!("Read from {} failed: {}", inner.options.address(), e);
                inner.emit(ConnectionEvent::Error(e.into()));
                break 'read;
            }
        }
    }

    inner.flush(&ReqlError::connection_closed());
    inner.stop_keepalive();
    let _ = inner.outbound.send(Outbound::Shutdown);
    inner.emit(ConnectionEvent::Closed);
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut writer: WriteHalf<Socket>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Frame { token, frame } => {
                let written = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                }
                .await;

                if let Err(e) = written {
                    warn!("Write for token {} failed: {}", token, e);
                    inner.write_failed(token, e.into());
                    inner.flush(&ReqlError::connection_closed());
                    break;
                }
            }
            Outbound::Shutdown => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Shutdown of {} failed: {}", inner.options.address(), e);
                }
                break;
            }
        }
    }
}
