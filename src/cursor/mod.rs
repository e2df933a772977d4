//! Lazily fetched result sequences
//!
//! A [`Cursor`] buffers the batches the server sends for one token and hands
//! rows out one at a time. While the consumer drains a batch, the next one is
//! prefetched with a CONTINUE, so at most two batches are ever buffered and at
//! most one CONTINUE is in flight.
//!
//! Pull mode (`next`, `each`, `to_array`, ...) is the default. Calling
//! [`Cursor::events`] switches the cursor to push mode for good.

mod events;
mod iter;
mod stream;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::QueryOptions;
use crate::connection::dispatch::{Continuation, Reply};
use crate::decode::RowDecoder;
use crate::error::{ReqlError, ReqlResult};
use crate::protocol::{RawResponse, ResponseNote};

pub use events::CursorEvent;
pub use iter::RowAck;
use iter::MAX_SYNC_ROWS;
pub use stream::RowStream;

/// Future returned by [`Cursor::close`]. Cloning it is cheap.
pub type CloseFuture = Shared<BoxFuture<'static, ReqlResult<()>>>;

/// Follow-up requests a cursor needs from its connection.
///
/// The continuation is always settled, including when the request cannot
/// be written.
pub(crate) trait TokenChannel: Send + Sync {
    fn continue_token(&self, token: u64, continuation: Continuation);
    fn stop_token(&self, token: u64, continuation: Continuation);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    Cursor,
    Feed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
}

impl CursorType {
    /// Pick the subtype from the notes of a first partial response.
    ///
    /// Returns the subtype and whether rows carry state markers.
    pub fn from_notes(notes: &[i64]) -> ReqlResult<(Self, bool)> {
        let mut kind = CursorType::Cursor;
        let mut includes_states = false;

        for code in notes {
            match ResponseNote::from_code(*code) {
                Some(ResponseNote::SequenceFeed) => kind = CursorType::Feed,
                Some(ResponseNote::AtomFeed) => kind = CursorType::AtomFeed,
                Some(ResponseNote::OrderByLimitFeed) => kind = CursorType::OrderByLimitFeed,
                Some(ResponseNote::UnionedFeed) => kind = CursorType::UnionedFeed,
                Some(ResponseNote::IncludesStates) => includes_states = true,
                None => {
                    return Err(ReqlError::driver(format!(
                        "Unknown ResponseNote {}, the driver is probably out of date.",
                        code
                    )))
                }
            }
        }

        Ok((kind, includes_states))
    }

    pub fn is_feed(self) -> bool {
        !matches!(self, CursorType::Cursor)
    }

    pub fn name(self) -> &'static str {
        match self {
            CursorType::Cursor => "Cursor",
            CursorType::Feed => "Feed",
            CursorType::AtomFeed => "AtomFeed",
            CursorType::OrderByLimitFeed => "OrderByLimitFeed",
            CursorType::UnionedFeed => "UnionedFeed",
        }
    }

    /// Lowercase name used in error messages.
    fn noun(self) -> String {
        match self {
            CursorType::Cursor => "cursor".to_string(),
            _ => "feed".to_string(),
        }
    }
}

impl fmt::Display for CursorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Pull,
    Push,
}

type Row = ReqlResult<Value>;
type Waiter = oneshot::Sender<Row>;

struct CursorState {
    /// Batches in arrival order; a batch is never merged with another
    batches: VecDeque<VecDeque<Row>>,
    /// Pulls waiting for a row
    waiters: VecDeque<Waiter>,
    fetching: bool,
    can_fetch: bool,
    closed: bool,
    closing: Option<CloseFuture>,
    emitted_end: bool,
    mode: Mode,
    listeners: Vec<mpsc::UnboundedSender<CursorEvent>>,
}

impl CursorState {
    fn new() -> Self {
        Self {
            batches: VecDeque::new(),
            waiters: VecDeque::new(),
            fetching: false,
            can_fetch: true,
            closed: false,
            closing: None,
            emitted_end: false,
            mode: Mode::Pull,
            listeners: Vec::new(),
        }
    }

    /// Whether a prefetch should start now. Marks it started.
    fn claim_fetch(&mut self) -> bool {
        if !self.closed && self.can_fetch && !self.fetching && self.batches.len() <= 1 {
            self.fetching = true;
            true
        } else {
            false
        }
    }

    /// Pop the head row, dropping the head batch once it is empty.
    fn pop_row(&mut self) -> Option<Row> {
        loop {
            let head = self.batches.front_mut()?;
            match head.pop_front() {
                Some(row) => {
                    if head.is_empty() {
                        self.batches.pop_front();
                    }
                    return Some(row);
                }
                None => {
                    self.batches.pop_front();
                }
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.batches.is_empty() && !self.can_fetch && !self.fetching
    }

    /// Match waiters against rows (or exhaustion) in order.
    fn flush(&mut self, noun: &str, settled: &mut Vec<(Waiter, Row)>) {
        while !self.waiters.is_empty() {
            if let Some(row) = self.pop_row() {
                if let Some(waiter) = self.waiters.pop_front() {
                    settled.push((waiter, row));
                }
            } else if self.is_exhausted() {
                if let Some(waiter) = self.waiters.pop_front() {
                    settled.push((waiter, Err(ReqlError::NoMoreRows(noun.to_string()))));
                }
            } else {
                break;
            }
        }
    }

    /// Mark the end notification as sent. True only the first time.
    fn take_end(&mut self) -> bool {
        if self.emitted_end {
            false
        } else {
            self.emitted_end = true;
            true
        }
    }
}

pub(crate) struct CursorShared {
    token: u64,
    kind: CursorType,
    includes_states: bool,
    options: QueryOptions,
    channel: Arc<dyn TokenChannel>,
    decoder: Arc<dyn RowDecoder>,
    state: Mutex<CursorState>,
}

/// Handle to a server-side sequence. Clones share the same buffer.
#[derive(Clone)]
pub struct Cursor {
    shared: Arc<CursorShared>,
}

impl Cursor {
    pub(crate) fn new(
        token: u64,
        kind: CursorType,
        includes_states: bool,
        options: QueryOptions,
        channel: Arc<dyn TokenChannel>,
        decoder: Arc<dyn RowDecoder>,
    ) -> Self {
        Self {
            shared: Arc::new(CursorShared {
                token,
                kind,
                includes_states,
                options,
                channel,
                decoder,
                state: Mutex::new(CursorState::new()),
            }),
        }
    }

    /// A cursor over rows that are already complete. Never touches the network.
    pub(crate) fn from_rows(
        token: u64,
        rows: Vec<Value>,
        channel: Arc<dyn TokenChannel>,
        decoder: Arc<dyn RowDecoder>,
    ) -> Self {
        let cursor = Self::new(
            token,
            CursorType::Cursor,
            false,
            QueryOptions::default(),
            channel,
            decoder,
        );
        cursor.push_rows(true, rows.into_iter().map(Ok).collect());
        cursor
    }

    pub fn token(&self) -> u64 {
        self.shared.token
    }

    pub fn cursor_type(&self) -> CursorType {
        self.shared.kind
    }

    pub fn includes_states(&self) -> bool {
        self.shared.includes_states
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// True once every row has been fetched from the server.
    pub fn is_complete(&self) -> bool {
        !self.shared.state.lock().can_fetch
    }

    /// Number of rows currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared
            .state
            .lock()
            .batches
            .iter()
            .map(VecDeque::len)
            .sum()
    }

    /// Deliver one server batch. `done` marks the final one.
    pub(crate) fn push(&self, done: bool, response: RawResponse) {
        let rows = match self
            .shared
            .decoder
            .decode_sequence(response.r, &self.shared.options)
        {
            Ok(rows) => rows.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        self.push_rows(done, rows);
    }

    /// Deliver rows, possibly containing queued errors, in order.
    pub(crate) fn push_rows(&self, done: bool, rows: Vec<Row>) {
        let noun = self.shared.kind.noun();
        let mut settled = Vec::new();

        // In push mode the event task reports the end once it has drained
        // every settled row.
        let fetch = {
            let mut state = self.shared.state.lock();
            let could_fetch = state.can_fetch;
            if done {
                state.can_fetch = false;
            }
            state.fetching = false;

            if could_fetch && !rows.is_empty() {
                state.batches.push_back(rows.into());
            }

            let fetch = state.claim_fetch();
            state.flush(&noun, &mut settled);
            fetch
        };

        for (waiter, row) in settled {
            let _ = waiter.send(row);
        }
        if fetch {
            self.fetch();
        }
    }

    /// A CONTINUE failed: surface the error in row order and stop fetching.
    fn fetch_failed(&self, error: ReqlError) {
        tracing::debug!("Fetch for token {} failed: {}", self.shared.token, error);
        let noun = self.shared.kind.noun();
        let mut settled = Vec::new();
        {
            let mut state = self.shared.state.lock();
            state.can_fetch = false;
            state.fetching = false;
            state.batches.push_back(VecDeque::from(vec![Err(error)]));
            state.flush(&noun, &mut settled);
        }
        for (waiter, row) in settled {
            let _ = waiter.send(row);
        }
    }

    fn fetch(&self) {
        tracing::trace!("Fetching next batch for token {}", self.shared.token);
        let cursor = self.clone();
        let continuation = Continuation::new(move |reply| match reply {
            Ok(Reply::Batch { done, response }) => cursor.push(done, response),
            Ok(_) => cursor.fetch_failed(ReqlError::driver(
                "Unexpected response to a CONTINUE request",
            )),
            Err(e) => cursor.fetch_failed(e),
        });
        self.shared
            .channel
            .continue_token(self.shared.token, continuation);
    }

    /// Next row. Fails with [`ReqlError::NoMoreRows`] once exhausted.
    pub async fn next(&self) -> ReqlResult<Value> {
        self.ensure_pull_mode()?;
        self.pull().await
    }

    /// The pull primitive shared by every iteration helper.
    pub(crate) async fn pull(&self) -> ReqlResult<Value> {
        let noun = self.shared.kind.noun();

        let (rx, fetch) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ReqlError::CursorClosed(noun));
            }
            if state.batches.is_empty() && !state.can_fetch {
                return Err(ReqlError::NoMoreRows(noun));
            }

            if state.waiters.is_empty() {
                if let Some(row) = state.pop_row() {
                    let fetch = state.claim_fetch();
                    drop(state);
                    if fetch {
                        self.fetch();
                    }
                    return row;
                }
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            (rx, state.claim_fetch())
        };

        if fetch {
            self.fetch();
        }

        rx.await
            .unwrap_or_else(|_| Err(ReqlError::CursorClosed(self.shared.kind.noun())))
    }

    /// Stop the server-side query. Idempotent: every call returns the same future.
    pub fn close(&self) -> CloseFuture {
        let (future, stop) = {
            let mut state = self.shared.state.lock();
            if let Some(closing) = &state.closing {
                return closing.clone();
            }
            state.closed = true;

            if !state.can_fetch && !state.fetching {
                let future: CloseFuture = futures::future::ready(Ok(())).boxed().shared();
                state.closing = Some(future.clone());
                let end = state.mode == Mode::Push && state.take_end();
                drop(state);
                if end {
                    self.emit(CursorEvent::End);
                }
                return future;
            }

            let (tx, rx) = oneshot::channel();
            let cursor = self.clone();
            let stop = Continuation::new(move |reply| {
                let result = reply.map(|_| ());
                if result.is_ok() {
                    cursor.finish_close();
                }
                let _ = tx.send(result);
            });
            let future: CloseFuture = async move {
                rx.await
                    .unwrap_or_else(|_| Err(ReqlError::connection_closed()))
            }
            .boxed()
            .shared();
            state.closing = Some(future.clone());
            (future, stop)
        };

        tracing::debug!("Stopping token {}", self.shared.token);
        self.shared.channel.stop_token(self.shared.token, stop);
        future
    }

    /// STOP acknowledged: nothing more will arrive.
    fn finish_close(&self) {
        let noun = self.shared.kind.noun();
        let mut settled = Vec::new();
        let end = {
            let mut state = self.shared.state.lock();
            state.can_fetch = false;
            state.fetching = false;
            state.flush(&noun, &mut settled);
            state.mode == Mode::Push && state.take_end()
        };
        for (waiter, row) in settled {
            let _ = waiter.send(row);
        }
        if end {
            self.emit(CursorEvent::End);
        }
    }

    fn ensure_pull_mode(&self) -> ReqlResult<()> {
        if self.shared.state.lock().mode == Mode::Push {
            return Err(ReqlError::driver(format!(
                "You cannot call `next` once you have bound listeners on the {}",
                self.shared.kind.name()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.shared.kind)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("token", &self.shared.token)
            .field("type", &self.shared.kind)
            .finish()
    }
}
