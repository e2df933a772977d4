//! Per-connection dispatch table
//!
//! Maps an in-flight token to the continuations waiting on it. A token holds
//! at most one "current" continuation (the response to the latest START or
//! CONTINUE) and at most one "end" continuation (the response to a STOP).

use std::collections::HashMap;

use serde_json::Value;

use super::QueryResponse;
use crate::config::QueryOptions;
use crate::cursor::Cursor;
use crate::error::{ReqlError, ReqlResult};
use crate::protocol::RawResponse;

/// What a continuation is settled with.
pub(crate) enum Reply {
    /// The final result of a request
    Ready(QueryResponse),
    /// A default-mode sequence; the caller drains it into an array
    Drain {
        cursor: Cursor,
        profile: Option<Value>,
    },
    /// One batch for an existing cursor
    Batch { done: bool, response: RawResponse },
}

type Callback = Box<dyn FnOnce(ReqlResult<Reply>) + Send>;

/// A one-shot resolve/reject pair.
///
/// Settling consumes it, so settling twice is impossible.
pub(crate) struct Continuation {
    callback: Callback,
}

impl Continuation {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: FnOnce(ReqlResult<Reply>) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A continuation that forwards into a oneshot channel.
    pub(crate) fn channel() -> (Self, tokio::sync::oneshot::Receiver<ReqlResult<Reply>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let continuation = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (continuation, rx)
    }

    pub(crate) fn resolve(self, reply: Reply) {
        (self.callback)(Ok(reply))
    }

    pub(crate) fn reject(self, error: ReqlError) {
        (self.callback)(Err(error))
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Continuation")
    }
}

#[derive(Debug)]
pub(crate) struct DispatchEntry {
    pub(crate) current: Option<Continuation>,
    pub(crate) end: Option<Continuation>,
    /// The query as the caller built it, for error reports
    pub(crate) query: Option<Value>,
    pub(crate) options: QueryOptions,
    /// Follow-up responses belong to a cursor
    pub(crate) cursor: bool,
}

impl DispatchEntry {
    fn new(current: Continuation, query: Option<Value>, options: QueryOptions) -> Self {
        Self {
            current: Some(current),
            end: None,
            query,
            options,
            cursor: false,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.current.is_none() && self.end.is_none()
    }

    /// Take the current continuation, falling back to the end one.
    pub(crate) fn take_any(&mut self) -> Option<Continuation> {
        self.current.take().or_else(|| self.end.take())
    }

    /// Reject whatever is still pending on this entry.
    pub(crate) fn reject_all(&mut self, error: &ReqlError) {
        if let Some(current) = self.current.take() {
            current.reject(error.clone());
        }
        if let Some(end) = self.end.take() {
            end.reject(error.clone());
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchTable {
    entries: HashMap<u64, DispatchEntry>,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create the entry for `token`, or attach a follow-up continuation to it.
    ///
    /// `end` marks the continuation of a STOP, which may race with an
    /// in-flight CONTINUE on the same token.
    pub(crate) fn register(
        &mut self,
        token: u64,
        continuation: Continuation,
        query: Option<Value>,
        options: QueryOptions,
        end: bool,
    ) {
        match self.entries.get_mut(&token) {
            None => {
                self.entries
                    .insert(token, DispatchEntry::new(continuation, query, options));
            }
            Some(entry) if end => entry.end = Some(continuation),
            Some(entry) => entry.current = Some(continuation),
        }
    }

    pub(crate) fn get_mut(&mut self, token: u64) -> Option<&mut DispatchEntry> {
        self.entries.get_mut(&token)
    }

    pub(crate) fn remove(&mut self, token: u64) -> Option<DispatchEntry> {
        self.entries.remove(&token)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry. Continuations are settled by the caller once the
    /// table lock is released.
    pub(crate) fn drain(&mut self) -> Vec<(u64, DispatchEntry)> {
        self.entries.drain().collect()
    }
}
