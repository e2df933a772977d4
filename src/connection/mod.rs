//! Multiplexed connection to a ReQL server
//!
//! One socket carries many in-flight queries, each identified by a token.
//! A reader task frames incoming bytes and routes every response to the
//! continuation registered for its token; a writer task owns the write half.
//!
//! # Example
//!
//! ```rust,no_run
//! use reql_core::{ConnectOptions, Driver, QueryOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), reql_core::ReqlError> {
//!     let driver = Driver::new();
//!     let conn = driver.connect(ConnectOptions::new("localhost", 28015)).await?;
//!
//!     // r.expr([1, 2, 3])
//!     let response = conn
//!         .run(json!([1, [2, [1, 2, 3]], {}]), QueryOptions::default())
//!         .await?;
//!     println!("{:?}", response.result);
//!
//!     conn.close(Default::default()).await
//! }
//! ```

pub(crate) mod dispatch;
mod io;
mod keepalive;
mod router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use crate::config::{ConnectOptions, QueryOptions};
use crate::cursor::{Cursor, RowStream, TokenChannel};
use crate::driver::Driver;
use crate::error::{ReqlError, ReqlResult};
use crate::protocol::{encode_query, QueryType, RawResponse};
use dispatch::{Continuation, DispatchTable, Reply};

pub(crate) use io::open;
use io::Outbound;

/// Term code of `r.db(...)`, injected as the `db` global optarg.
const DB_TERM: u8 = 14;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Close requested, waiting for the socket to go away
    Closing,
    Closed,
}

/// Lifecycle notifications, see [`Connection::subscribe`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A response (or a noreply send) freed its slot
    Release,
    /// The peer half-closed the socket
    End,
    /// The socket is gone
    Closed,
    Error(ReqlError),
}

/// What a query resolved to.
#[derive(Debug)]
pub enum QueryResult {
    Value(Value),
    Cursor(Cursor),
    Stream(RowStream),
    /// No payload (noreply sends, `noreply_wait`)
    Done,
}

impl QueryResult {
    /// The plain value; `Done` maps to `null`.
    pub fn into_value(self) -> ReqlResult<Value> {
        match self {
            QueryResult::Value(value) => Ok(value),
            QueryResult::Done => Ok(Value::Null),
            QueryResult::Cursor(cursor) => Err(ReqlError::driver(format!(
                "Expected a value, got a {}",
                cursor.cursor_type()
            ))),
            QueryResult::Stream(_) => Err(ReqlError::driver("Expected a value, got a stream")),
        }
    }

    pub fn into_cursor(self) -> Option<Cursor> {
        match self {
            QueryResult::Cursor(cursor) => Some(cursor),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<RowStream> {
        match self {
            QueryResult::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct QueryResponse {
    pub result: QueryResult,
    /// Server profile, when the query asked for one
    pub profile: Option<Value>,
}

impl QueryResponse {
    pub(crate) fn done() -> Self {
        Self {
            result: QueryResult::Done,
            profile: None,
        }
    }
}

/// Outcome of an explicit CONTINUE or STOP.
#[derive(Debug)]
pub enum FollowUp {
    Batch { done: bool, response: RawResponse },
    Response(QueryResponse),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOptions {
    /// `Some(true)` waits for noreply writes before closing. On reconnect,
    /// `Some(false)` opens the new connection without closing this one.
    pub noreply_wait: Option<bool>,
}

impl CloseOptions {
    pub fn noreply_wait(wait: bool) -> Self {
        Self {
            noreply_wait: Some(wait),
        }
    }
}

pub(crate) struct ConnectionInner {
    options: ConnectOptions,
    driver: Driver,
    state: Mutex<ConnectionState>,
    next_token: AtomicU64,
    table: Mutex<DispatchTable>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<ConnectionEvent>,
    db: Mutex<Option<String>>,
    /// Token of the keepalive ping in flight
    ping: Mutex<Option<u64>>,
    keepalive: Mutex<Option<AbortHandle>>,
    /// Reader and writer tasks
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ConnectionInner {
    fn new(
        options: ConnectOptions,
        driver: Driver,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let db = options.db.clone();
        Self {
            options,
            driver,
            state: Mutex::new(ConnectionState::Open),
            next_token: AtomicU64::new(1),
            table: Mutex::new(DispatchTable::new()),
            outbound,
            events,
            db: Mutex::new(db),
            ping: Mutex::new(None),
            keepalive: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn is_open(&self) -> bool {
        *self.state.lock() == ConnectionState::Open
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn is_ping(&self, token: u64) -> bool {
        *self.ping.lock() == Some(token)
    }

    /// Frame `query` and hand it to the writer task.
    ///
    /// The continuation is always settled, with an error when the
    /// connection is closed or the payload cannot be encoded.
    fn dispatch(
        &self,
        token: u64,
        query: &Value,
        continuation: Continuation,
        original: Option<Value>,
        options: QueryOptions,
        end: bool,
    ) {
        let frame = match encode_query(token, query) {
            Ok(frame) => frame,
            Err(e) => return continuation.reject(e),
        };

        if options.noreply {
            if !self.is_open() {
                return continuation.reject(closed_connection_error());
            }
            if self.outbound.send(Outbound::Frame { token, frame }).is_err() {
                return continuation.reject(ReqlError::connection_closed());
            }
            continuation.resolve(Reply::Ready(QueryResponse::done()));
            self.emit(ConnectionEvent::Release);
            return;
        }

        // Registering under the table lock keeps it ordered with `flush`.
        let rejected = {
            let mut table = self.table.lock();
            if self.is_open() {
                table.register(token, continuation, original, options, end);
                None
            } else {
                Some(continuation)
            }
        };
        if let Some(continuation) = rejected {
            return continuation.reject(closed_connection_error());
        }

        if self.outbound.send(Outbound::Frame { token, frame }).is_err() {
            self.write_failed(token, ReqlError::connection_closed());
        }
    }

    /// A frame for `token` could not be written.
    fn write_failed(&self, token: u64, error: ReqlError) {
        let entry = self.table.lock().remove(token);
        if let Some(mut entry) = entry {
            entry.reject_all(&error);
        }
    }

    /// Reject everything outstanding. Safe to call any number of times.
    fn flush(&self, error: &ReqlError) {
        let entries = {
            let mut table = self.table.lock();
            *self.state.lock() = ConnectionState::Closed;
            table.drain()
        };
        if !entries.is_empty() {
            tracing::debug!("Rejecting {} outstanding queries: {}", entries.len(), error);
        }
        for (_, mut entry) in entries {
            entry.reject_all(error);
        }
    }

    /// Ask the writer to half-close the socket.
    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
            }
        }
        self.stop_keepalive();
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    /// Connection-wide failure: reject everything and drop the socket.
    fn fail(&self, error: ReqlError) {
        tracing::warn!("Closing connection to {}: {}", self.options.address(), error);
        self.flush(&error);
        self.emit(ConnectionEvent::Error(error));
        self.stop_keepalive();
        let _ = self.outbound.send(Outbound::Shutdown);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}

impl TokenChannel for ConnectionInner {
    fn continue_token(&self, token: u64, continuation: Continuation) {
        self.dispatch(
            token,
            &QueryType::Continue.payload(),
            continuation,
            None,
            QueryOptions::default(),
            false,
        );
    }

    fn stop_token(&self, token: u64, continuation: Continuation) {
        self.dispatch(
            token,
            &QueryType::Stop.payload(),
            continuation,
            None,
            QueryOptions::default(),
            true,
        );
    }
}

fn closed_connection_error() -> ReqlError {
    ReqlError::driver("`run` was called with a closed connection.")
}

/// Turn a settled reply into what the caller of `send` sees.
async fn into_response(reply: Reply) -> ReqlResult<QueryResponse> {
    match reply {
        Reply::Ready(response) => Ok(response),
        Reply::Drain { cursor, profile } => {
            let rows = cursor.to_array().await?;
            Ok(QueryResponse {
                result: QueryResult::Value(Value::Array(rows)),
                profile,
            })
        }
        Reply::Batch { .. } => Err(ReqlError::driver(
            "Received a cursor batch for a query without a cursor",
        )),
    }
}

async fn wait(rx: tokio::sync::oneshot::Receiver<ReqlResult<Reply>>) -> ReqlResult<Reply> {
    rx.await
        .unwrap_or_else(|_| Err(ReqlError::connection_closed()))
}

/// Handle to an open connection. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Allocate the next token. Tokens are unique and increasing per connection.
    pub fn next_token(&self) -> u64 {
        self.inner.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a serialized query on `token` and wait for its result.
    ///
    /// `original` is attached to server errors for diagnostics.
    pub async fn send(
        &self,
        query: Value,
        token: u64,
        original: Option<Value>,
        options: QueryOptions,
    ) -> ReqlResult<QueryResponse> {
        let (continuation, rx) = Continuation::channel();
        self.inner
            .dispatch(token, &query, continuation, original, options, false);
        into_response(wait(rx).await?).await
    }

    /// Send a `[START, term, optargs]` query on a fresh token.
    ///
    /// The connection's default database and the `noreply`/`profile`
    /// options are added to the global optargs unless already present.
    pub async fn run(&self, query: Value, options: QueryOptions) -> ReqlResult<QueryResponse> {
        let query = self.with_global_optargs(query, &options);
        let token = self.next_token();
        let original = query.get(1).cloned();
        self.send(query, token, original, options).await
    }

    fn with_global_optargs(&self, mut query: Value, options: &QueryOptions) -> Value {
        let Some(parts) = query.as_array_mut() else {
            return query;
        };
        if parts.first().and_then(Value::as_u64) != Some(QueryType::Start as u64) {
            return query;
        }
        if parts.len() < 3 {
            parts.resize(2, Value::Null);
            parts.push(Value::Object(Map::new()));
        }
        if let Some(optargs) = parts[2].as_object_mut() {
            if let Some(db) = self.db() {
                optargs
                    .entry("db")
                    .or_insert_with(|| json!([DB_TERM, [db]]));
            }
            if options.noreply {
                optargs.entry("noreply").or_insert(Value::Bool(true));
            }
            if options.profile {
                optargs.entry("profile").or_insert(Value::Bool(true));
            }
        }
        query
    }

    /// Ask for the next batch of the cursor on `token`.
    pub async fn continue_token(&self, token: u64) -> ReqlResult<FollowUp> {
        let (continuation, rx) = Continuation::channel();
        self.inner.continue_token(token, continuation);
        follow_up(wait(rx).await?).await
    }

    /// Tell the server to abandon the query on `token`.
    pub async fn stop_token(&self, token: u64) -> ReqlResult<FollowUp> {
        let (continuation, rx) = Continuation::channel();
        self.inner.stop_token(token, continuation);
        follow_up(wait(rx).await?).await
    }

    /// Wait until every noreply write has been processed by the server.
    pub async fn noreply_wait(&self) -> ReqlResult<()> {
        let token = self.next_token();
        self.send(
            QueryType::NoreplyWait.payload(),
            token,
            None,
            QueryOptions::default(),
        )
        .await?;
        Ok(())
    }

    pub async fn server_info(&self) -> ReqlResult<Value> {
        let token = self.next_token();
        self.send(
            QueryType::ServerInfo.payload(),
            token,
            None,
            QueryOptions::default(),
        )
        .await?
        .result
        .into_value()
    }

    /// Set the default database for queries sent through [`run`](Self::run).
    pub fn use_db(&self, db: &str) -> ReqlResult<()> {
        if db.is_empty() {
            return Err(ReqlError::driver(
                "First argument of `use` must be a non-empty string.",
            ));
        }
        *self.inner.db.lock() = Some(db.to_string());
        Ok(())
    }

    pub fn db(&self) -> Option<String> {
        self.inner.db.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// Number of tokens still waiting for a response.
    pub fn pending(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Mark the connection closed and half-close the socket.
    ///
    /// Queries still waiting are rejected once the server closes its side.
    pub async fn close(&self, options: CloseOptions) -> ReqlResult<()> {
        let result = if options.noreply_wait == Some(true) && self.is_open() {
            self.noreply_wait().await
        } else {
            Ok(())
        };

        tracing::info!("Closing connection to {}", self.inner.options.address());
        self.inner.shutdown();
        result
    }

    /// Open a new connection with the same parameters and current database.
    pub async fn reconnect(&self, options: CloseOptions) -> ReqlResult<Connection> {
        let mut connect_options = self.inner.options.clone();
        connect_options.db = self.db();

        if options.noreply_wait != Some(false) {
            self.close(options).await?;
        }
        self.inner.driver.connect(connect_options).await
    }
}

async fn follow_up(reply: Reply) -> ReqlResult<FollowUp> {
    match reply {
        Reply::Batch { done, response } => Ok(FollowUp::Batch { done, response }),
        other => Ok(FollowUp::Response(into_response(other).await?)),
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.options.address())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Framer, ResponseType, NO_TOKEN};

    /// A connection whose writer is a channel the test reads from.
    pub(super) fn detached() -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner::new(
            ConnectOptions::default(),
            Driver::new(),
            tx,
        ));
        (Connection { inner }, rx)
    }

    fn sent_query(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> (u64, Value) {
        match outbound.try_recv() {
            Ok(Outbound::Frame { frame, .. }) => {
                let mut framer = Framer::new();
                framer.push(&frame);
                let decoded = framer.next_frame().unwrap().unwrap();
                (decoded.token, decoded.payload)
            }
            other => panic!("expected a frame, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_increasing() {
        let (conn, _rx) = detached();
        let tokens: Vec<u64> = (0..100).map(|_| conn.next_token()).collect();
        assert!(tokens.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_run_injects_db() {
        let (conn, mut outbound) = detached();
        conn.use_db("blog").unwrap();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run(json!([1, [15, []], {}]), QueryOptions::default()).await })
        };
        tokio::task::yield_now().await;

        let (token, payload) = sent_query(&mut outbound);
        assert_eq!(payload, json!([1, [15, []], {"db": [14, ["blog"]]}]));

        conn.inner
            .route(token, RawResponse::atom_response(json!(["posts"])));
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.result.into_value().unwrap(), json!(["posts"]));
    }

    #[tokio::test]
    async fn test_noreply_resolves_without_entry() {
        let (conn, mut outbound) = detached();
        let mut events = conn.subscribe();

        let response = conn
            .run(json!([1, [1, [1]], {}]), QueryOptions::noreply())
            .await
            .unwrap();
        assert!(matches!(response.result, QueryResult::Done));
        assert_eq!(conn.pending(), 0);
        assert!(matches!(events.try_recv(), Ok(ConnectionEvent::Release)));

        let (_, payload) = sent_query(&mut outbound);
        assert_eq!(payload[2]["noreply"], json!(true));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_without_writing() {
        let (conn, mut outbound) = detached();
        conn.inner.flush(&ReqlError::connection_closed());

        let err = conn
            .send(json!([1, 1, {}]), 1, None, QueryOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_driver_error());
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_rejects_each_once() {
        let (conn, _outbound) = detached();
        let mut pending = Vec::new();
        for _ in 0..3 {
            let conn = conn.clone();
            pending.push(tokio::spawn(async move {
                conn.run(json!([1, [1, [1]], {}]), QueryOptions::default())
                    .await
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(conn.pending(), 3);

        // Peer half-close, then full close.
        conn.inner.flush(&ReqlError::connection_closed());
        conn.inner.flush(&ReqlError::connection_closed());

        for handle in pending {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_connection_closed());
        }
        assert_eq!(conn.pending(), 0);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_no_token_client_error_is_fatal() {
        let (conn, _outbound) = detached();
        let mut events = conn.subscribe();
        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.run(json!([1, [1, [1]], {}]), QueryOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let mut response = RawResponse::sequence(ResponseType::ClientError, vec![]);
        response.r = vec![json!("Bad token")];
        conn.inner.route(NO_TOKEN, response);

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.message().contains("Bad token"));
        assert!(!conn.is_open());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, ConnectionEvent::Error(_));
        }
        assert!(saw_error);
    }
}
