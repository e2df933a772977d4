//! Response routing: one handler per response kind.

use std::sync::Arc;

use serde_json::Value;

use super::dispatch::{Continuation, Reply};
use super::{ConnectionEvent, ConnectionInner, QueryResponse, QueryResult};
use crate::config::QueryOptions;
use crate::cursor::{Cursor, CursorType, RowStream, TokenChannel};
use crate::error::ReqlError;
use crate::protocol::{RawResponse, ResponseType, RuntimeErrorKind, NO_TOKEN};

/// Build the error carried by an error response.
///
/// `with_context` attaches the original query and the server backtrace.
pub(crate) fn response_error(
    kind: ResponseType,
    response: &RawResponse,
    query: Option<Value>,
    with_context: bool,
) -> ReqlError {
    let message = response.error_message();
    let (query, backtrace) = if with_context {
        (query, response.b.clone())
    } else {
        (None, None)
    };

    match kind {
        ResponseType::CompileError => ReqlError::Compile {
            message,
            query,
            backtrace,
        },
        ResponseType::ClientError => ReqlError::Client {
            message,
            query,
            backtrace,
        },
        _ => ReqlError::Runtime {
            kind: RuntimeErrorKind::from_code(response.e),
            message,
            query,
            backtrace,
        },
    }
}

fn profile_of(options: &QueryOptions, response: &RawResponse) -> Option<Value> {
    if options.profile {
        response.p.clone()
    } else {
        None
    }
}

impl ConnectionInner {
    /// Route one decoded response. Called by the reader task in arrival order.
    pub(super) fn route(self: &Arc<Self>, token: u64, response: RawResponse) {
        self.emit(ConnectionEvent::Release);

        let Some(kind) = response.kind() else {
            tracing::warn!("Unknown response type {} for token {}", response.t, token);
            let entry = self.table.lock().remove(token);
            if let Some(mut entry) = entry {
                entry.reject_all(&ReqlError::driver(format!(
                    "Unknown response type {}, the driver is probably out of date.",
                    response.t
                )));
            }
            return;
        };

        tracing::trace!("Token {} received {:?}", token, kind);
        match kind {
            ResponseType::CompileError | ResponseType::ClientError | ResponseType::RuntimeError => {
                self.handle_error(kind, token, response)
            }
            ResponseType::SuccessAtom => self.handle_atom(token, response),
            ResponseType::SuccessPartial => self.handle_partial(token, response),
            ResponseType::SuccessSequence => self.handle_sequence(token, response),
            ResponseType::WaitComplete => self.handle_wait_complete(token),
            ResponseType::ServerInfo => self.handle_server_info(token, response),
        }
    }

    fn channel(self: &Arc<Self>) -> Arc<dyn TokenChannel> {
        self.clone()
    }

    fn wants_cursor(&self, options: &QueryOptions) -> bool {
        options.cursor.unwrap_or(self.driver.options().cursor)
    }

    fn wants_stream(&self, options: &QueryOptions) -> bool {
        options.stream.unwrap_or(self.driver.options().stream)
    }

    /// Remove `token` and take whichever continuation is pending on it.
    fn take_one_shot(&self, token: u64) -> Option<(Continuation, QueryOptions)> {
        let entry = self.table.lock().remove(token);
        let Some(mut entry) = entry else {
            tracing::warn!("Response for untracked token {}", token);
            return None;
        };
        let continuation = entry.take_any()?;
        Some((continuation, entry.options))
    }

    fn handle_error(self: &Arc<Self>, kind: ResponseType, token: u64, response: RawResponse) {
        let (continuation, query) = {
            let mut table = self.table.lock();
            match table.get_mut(token) {
                Some(entry) => {
                    let continuation = entry.take_any();
                    let query = entry.query.clone();
                    if entry.is_idle() {
                        table.remove(token);
                    }
                    (continuation, query)
                }
                None => (None, None),
            }
        };

        let Some(continuation) = continuation else {
            if kind == ResponseType::ClientError && token == NO_TOKEN {
                self.fail(ReqlError::Client {
                    message: format!(
                        "{}\nClosing all outstanding queries...",
                        response.error_message()
                    ),
                    query: None,
                    backtrace: response.b.clone(),
                });
            } else {
                tracing::warn!("{:?} for untracked token {}", kind, token);
            }
            return;
        };

        // An expected keepalive failure carries no query context.
        let with_context = !(kind == ResponseType::RuntimeError && self.is_ping(token));
        continuation.reject(response_error(kind, &response, query, with_context));
    }

    fn handle_atom(self: &Arc<Self>, token: u64, response: RawResponse) {
        let Some((continuation, options)) = self.take_one_shot(token) else {
            return;
        };

        let value = match self.driver.decoder().decode_atom(response.atom(), &options) {
            Ok(value) => value,
            Err(e) => return continuation.reject(e),
        };
        let profile = profile_of(&options, &response);

        let result = match value {
            Value::Array(rows) if self.wants_cursor(&options) || self.wants_stream(&options) => {
                let cursor =
                    Cursor::from_rows(token, rows, self.channel(), self.driver.decoder());
                if self.wants_cursor(&options) {
                    QueryResult::Cursor(cursor)
                } else {
                    QueryResult::Stream(RowStream::new(cursor))
                }
            }
            value => QueryResult::Value(value),
        };

        continuation.resolve(Reply::Ready(QueryResponse { result, profile }));
    }

    fn handle_partial(self: &Arc<Self>, token: u64, response: RawResponse) {
        let (continuation, options, existing) = {
            let mut table = self.table.lock();
            let Some(entry) = table.get_mut(token) else {
                tracing::warn!("Partial response for untracked token {}", token);
                return;
            };
            let continuation = entry.current.take();
            let existing = entry.cursor;
            entry.cursor = true;
            (continuation, entry.options.clone(), existing)
        };

        let Some(continuation) = continuation else {
            tracing::warn!("Partial response for token {} with nothing waiting", token);
            return;
        };

        if existing {
            return continuation.resolve(Reply::Batch {
                done: false,
                response,
            });
        }

        let (kind, includes_states) = match CursorType::from_notes(&response.n) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Token {}: {}", token, e);
                self.table.lock().remove(token);
                return continuation.reject(e);
            }
        };

        let profile = profile_of(&options, &response);
        let cursor = Cursor::new(
            token,
            kind,
            includes_states,
            options.clone(),
            self.channel(),
            self.driver.decoder(),
        );
        continuation.resolve(self.select(cursor.clone(), &options, profile));
        cursor.push(false, response);
    }

    fn handle_sequence(self: &Arc<Self>, token: u64, response: RawResponse) {
        let (continuation, options, existing) = {
            let mut table = self.table.lock();
            let Some(entry) = table.get_mut(token) else {
                tracing::warn!("Sequence response for untracked token {}", token);
                return;
            };
            let continuation = entry.take_any();
            let options = entry.options.clone();
            let existing = entry.cursor;
            if !existing || entry.is_idle() {
                table.remove(token);
            }
            (continuation, options, existing)
        };

        let Some(continuation) = continuation else {
            tracing::warn!("Sequence response for token {} with nothing waiting", token);
            return;
        };

        if existing {
            return continuation.resolve(Reply::Batch {
                done: true,
                response,
            });
        }

        let profile = profile_of(&options, &response);
        let cursor = Cursor::new(
            token,
            CursorType::Cursor,
            false,
            options.clone(),
            self.channel(),
            self.driver.decoder(),
        );
        cursor.push(true, response);
        continuation.resolve(self.select(cursor, &options, profile));
    }

    fn handle_wait_complete(self: &Arc<Self>, token: u64) {
        if let Some((continuation, _)) = self.take_one_shot(token) {
            continuation.resolve(Reply::Ready(QueryResponse::done()));
        }
    }

    fn handle_server_info(self: &Arc<Self>, token: u64, response: RawResponse) {
        let Some((continuation, options)) = self.take_one_shot(token) else {
            return;
        };
        match self.driver.decoder().decode_atom(response.atom(), &options) {
            Ok(value) => continuation.resolve(Reply::Ready(QueryResponse {
                result: QueryResult::Value(value),
                profile: None,
            })),
            Err(e) => continuation.reject(e),
        }
    }

    /// Cursor, stream, or a drained array, depending on the options.
    fn select(&self, cursor: Cursor, options: &QueryOptions, profile: Option<Value>) -> Reply {
        let result = if self.wants_cursor(options) {
            QueryResult::Cursor(cursor)
        } else if self.wants_stream(options) {
            QueryResult::Stream(RowStream::new(cursor))
        } else if cursor.cursor_type().is_feed() {
            QueryResult::Cursor(cursor)
        } else {
            return Reply::Drain { cursor, profile };
        };
        Reply::Ready(QueryResponse { result, profile })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::detached;
    use super::*;
    use crate::connection::io::Outbound;
    use crate::connection::Connection;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn sequence(kind: ResponseType, rows: Vec<Value>) -> RawResponse {
        RawResponse::sequence(kind, rows)
    }

    async fn start(
        conn: &Connection,
        options: QueryOptions,
    ) -> (u64, tokio::task::JoinHandle<crate::ReqlResult<QueryResponse>>) {
        let token = conn.next_token();
        let handle = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send(json!([1, [1, [1]], {}]), token, Some(json!([1, [1]])), options)
                    .await
            })
        };
        tokio::task::yield_now().await;
        (token, handle)
    }

    fn drain_outbound(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> usize {
        let mut count = 0;
        while outbound.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_atom_array_resolves_directly() {
        let (conn, _outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::default()).await;

        conn.inner
            .route(token, RawResponse::atom_response(json!([1, 2, 3])));
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.result.into_value().unwrap(), json!([1, 2, 3]));
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_atom_array_as_cursor() {
        let (conn, mut outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::cursor()).await;
        drain_outbound(&mut outbound);

        conn.inner
            .route(token, RawResponse::atom_response(json!([1, 2])));
        let cursor = handle.await.unwrap().unwrap().result.into_cursor().unwrap();
        assert_eq!(cursor.to_array().await.unwrap(), vec![json!(1), json!(2)]);
        // Pre-seeded: no CONTINUE was sent.
        assert_eq!(drain_outbound(&mut outbound), 0);
    }

    #[tokio::test]
    async fn test_partial_then_sequence_drains_to_array() {
        let (conn, mut outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::default()).await;
        assert_eq!(drain_outbound(&mut outbound), 1);

        conn.inner.route(
            token,
            sequence(ResponseType::SuccessPartial, vec![json!({"id": 1})]),
        );
        tokio::task::yield_now().await;
        // The prefetch CONTINUE.
        assert_eq!(drain_outbound(&mut outbound), 1);

        conn.inner.route(
            token,
            sequence(ResponseType::SuccessSequence, vec![json!({"id": 2})]),
        );
        let response = handle.await.unwrap().unwrap();
        assert_eq!(
            response.result.into_value().unwrap(),
            json!([{"id": 1}, {"id": 2}])
        );
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_atom_feed_type() {
        let (conn, _outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::default()).await;

        let mut response = sequence(ResponseType::SuccessPartial, vec![json!({"new_val": 1})]);
        response.n = vec![2];
        conn.inner.route(token, response);

        let cursor = handle.await.unwrap().unwrap().result.into_cursor().unwrap();
        assert_eq!(cursor.cursor_type(), CursorType::AtomFeed);
        assert!(cursor.to_array().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_note_rejects() {
        let (conn, _outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::default()).await;

        let mut response = sequence(ResponseType::SuccessPartial, vec![]);
        response.n = vec![99];
        conn.inner.route(token, response);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_driver_error());
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_runtime_error_carries_query() {
        let (conn, _outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::default()).await;

        let mut response = sequence(ResponseType::RuntimeError, vec![json!("Table missing")]);
        response.e = Some(3_100_000);
        response.b = Some(json!([0]));
        conn.inner.route(token, response);

        match handle.await.unwrap().unwrap_err() {
            ReqlError::Runtime {
                kind,
                message,
                query,
                backtrace,
            } => {
                assert_eq!(kind, RuntimeErrorKind::NonExistence);
                assert_eq!(message, "Table missing");
                assert_eq!(query, Some(json!([1, [1]])));
                assert_eq!(backtrace, Some(json!([0])));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_error_has_no_context() {
        let (conn, _outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::default()).await;
        *conn.inner.ping.lock() = Some(token);

        let mut response = sequence(ResponseType::RuntimeError, vec![json!("ping")]);
        response.b = Some(json!([]));
        conn.inner.route(token, response);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.query().is_none());
    }

    #[tokio::test]
    async fn test_error_during_stop_cleans_up() {
        let (conn, _outbound) = detached();
        let (token, handle) = start(&conn, QueryOptions::cursor()).await;
        conn.inner.route(
            token,
            sequence(ResponseType::SuccessPartial, vec![json!(1)]),
        );
        let cursor = handle.await.unwrap().unwrap().result.into_cursor().unwrap();

        // Answer the prefetch so only the STOP is outstanding.
        conn.inner
            .route(token, sequence(ResponseType::SuccessPartial, vec![json!(2)]));
        let close = cursor.close();
        conn.inner.route(
            token,
            sequence(ResponseType::RuntimeError, vec![json!("stopped")]),
        );

        assert!(close.await.is_err());
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_release_once_per_response() {
        let (conn, _outbound) = detached();
        let mut events = conn.subscribe();
        let (token, handle) = start(&conn, QueryOptions::default()).await;

        conn.inner.route(token, RawResponse::atom_response(json!(1)));
        // Untracked: still releases.
        conn.inner.route(token + 100, RawResponse::atom_response(json!(1)));
        handle.await.unwrap().unwrap();

        let mut releases = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::Release) {
                releases += 1;
            }
        }
        assert_eq!(releases, 2);
    }
}
