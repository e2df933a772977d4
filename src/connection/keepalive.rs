//! Periodic ping on an otherwise idle connection.
//!
//! The ping is a query that always fails with a known runtime error. Any
//! other outcome means the connection is unusable and it is closed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::dispatch::Continuation;
use super::{wait, ConnectionInner};
use crate::config::QueryOptions;
use crate::error::{ReqlError, ReqlResult};

pub(crate) const PING_VALUE: &str = "__rethinkdb_ping__";

/// Term code of `r.error(...)`.
const ERROR_TERM: u8 = 12;

fn ping_query() -> Value {
    json!([1, [ERROR_TERM, [PING_VALUE]], {}])
}

pub(super) fn spawn(inner: &Arc<ConnectionInner>, period: Duration) {
    let weak = Arc::downgrade(inner);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if !inner.is_open() {
                break;
            }

            if let Err(e) = ping(&inner).await {
                if inner.is_open() {
                    inner.fail(e);
                }
                break;
            }
        }
    });
    *inner.keepalive.lock() = Some(handle.abort_handle());
}

async fn ping(inner: &Arc<ConnectionInner>) -> ReqlResult<()> {
    let token = inner.next_token.fetch_add(1, Ordering::SeqCst);
    *inner.ping.lock() = Some(token);

    let (continuation, rx) = Continuation::channel();
    inner.dispatch(
        token,
        &ping_query(),
        continuation,
        None,
        QueryOptions::default(),
        false,
    );
    let outcome = wait(rx).await;
    *inner.ping.lock() = None;

    match outcome {
        Err(ReqlError::Runtime { message, .. }) if message == PING_VALUE => {
            tracing::trace!("Ping on token {} answered", token);
            Ok(())
        }
        Err(e) => Err(ReqlError::driver(format!("Keepalive ping failed: {}", e))),
        Ok(_) => Err(ReqlError::driver(
            "Keepalive ping returned an unexpected result",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_query_shape() {
        assert_eq!(ping_query(), json!([1, [12, ["__rethinkdb_ping__"]], {}]));
    }
}
