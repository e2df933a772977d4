//! Pull-mode iteration helpers built on [`Cursor::pull`].

use std::future::Future;

use serde_json::Value;
use tokio::sync::oneshot;

use super::Cursor;
use crate::error::{ReqlError, ReqlResult};

/// Rows handed out between two cooperative yields.
pub(crate) const MAX_SYNC_ROWS: usize = 1000;

/// Completion signal for [`Cursor::each_async_with_ack`].
///
/// Dropping it without calling [`RowAck::done`] also releases the next row.
#[derive(Debug)]
pub struct RowAck {
    tx: oneshot::Sender<()>,
}

impl RowAck {
    pub fn done(self) {
        let _ = self.tx.send(());
    }
}

/// Exhaustion and a concurrent close end an iteration normally.
fn finish(error: ReqlError) -> ReqlResult<()> {
    if error.is_exhausted() || error.is_cursor_closed() {
        Ok(())
    } else {
        Err(error)
    }
}

impl Cursor {
    fn ensure_open(&self) -> ReqlResult<()> {
        if self.is_closed() {
            return Err(ReqlError::driver(format!(
                "You cannot retrieve data from a {} that is closed",
                self.cursor_type().noun()
            )));
        }
        Ok(())
    }

    /// Call `f` for every row until it returns `false` or the rows run out.
    ///
    /// Errors other than exhaustion stop the iteration and are returned.
    pub async fn each<F>(&self, mut f: F) -> ReqlResult<()>
    where
        F: FnMut(Value) -> bool,
    {
        self.ensure_pull_mode()?;
        self.ensure_open()?;

        let mut delivered = 0usize;
        loop {
            match self.pull().await {
                Ok(row) => {
                    if !f(row) {
                        return Ok(());
                    }
                    delivered += 1;
                    if delivered % MAX_SYNC_ROWS == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => return finish(e),
            }
        }
    }

    /// Like [`each`](Self::each), but waits for the handler's future before
    /// pulling the next row.
    pub async fn each_async<F, Fut>(&self, mut handler: F) -> ReqlResult<()>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.ensure_pull_mode()?;
        self.ensure_open()?;

        loop {
            match self.pull().await {
                Ok(row) => handler(row).await,
                Err(e) => return finish(e),
            }
        }
    }

    /// Callback flavour of [`each_async`](Self::each_async): the next row is
    /// pulled once the handler signals its [`RowAck`].
    pub async fn each_async_with_ack<F>(&self, mut handler: F) -> ReqlResult<()>
    where
        F: FnMut(Value, RowAck),
    {
        self.ensure_pull_mode()?;
        self.ensure_open()?;

        loop {
            match self.pull().await {
                Ok(row) => {
                    let (tx, rx) = oneshot::channel();
                    handler(row, RowAck { tx });
                    let _ = rx.await;
                }
                Err(e) => return finish(e),
            }
        }
    }

    /// Collect every remaining row. Not available on feeds.
    pub async fn to_array(&self) -> ReqlResult<Vec<Value>> {
        if self.cursor_type().is_feed() {
            return Err(ReqlError::driver(
                "The `toArray` method is not available on feeds.",
            ));
        }

        let mut rows = Vec::new();
        self.each(|row| {
            rows.push(row);
            true
        })
        .await?;
        Ok(rows)
    }
}
