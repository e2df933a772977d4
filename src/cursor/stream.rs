use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream};
use serde_json::Value;

use super::Cursor;
use crate::error::ReqlResult;

/// A [`Stream`] of rows pulled through a [`Cursor`].
///
/// Ends when the rows run out or the cursor is closed. Row errors are yielded
/// in place and do not end the stream.
pub struct RowStream {
    cursor: Cursor,
    inner: BoxStream<'static, ReqlResult<Value>>,
}

impl RowStream {
    pub fn new(cursor: Cursor) -> Self {
        let source = cursor.clone();
        let inner = async_stream::stream! {
            loop {
                match source.pull().await {
                    Ok(row) => yield Ok(row),
                    Err(e) if e.is_exhausted() || e.is_cursor_closed() => break,
                    Err(e) => yield Err(e),
                }
            }
        };

        Self {
            cursor,
            inner: Box::pin(inner),
        }
    }

    /// The underlying cursor, e.g. to close it early.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }
}

impl Stream for RowStream {
    type Item = ReqlResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("cursor", &self.cursor)
            .finish()
    }
}
