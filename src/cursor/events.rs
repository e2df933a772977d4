//! Push mode: rows are forwarded to listeners by a background task.

use serde_json::Value;
use tokio::sync::mpsc;

use super::{Cursor, Mode, MAX_SYNC_ROWS};
use crate::error::ReqlError;

#[derive(Debug, Clone)]
pub enum CursorEvent {
    Data(Value),
    Error(ReqlError),
    /// Sent once, after the last row or when the cursor is closed
    End,
}

impl Cursor {
    /// Subscribe to the cursor's rows.
    ///
    /// The first call switches the cursor to push mode: `next`, `each` and
    /// `to_array` fail from then on. Rows start flowing on a spawned task,
    /// so every listener registered in the same turn sees the first row.
    pub fn events(&self) -> mpsc::UnboundedReceiver<CursorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let start = {
            let mut state = self.shared.state.lock();
            state.listeners.push(tx);
            if state.mode == Mode::Pull {
                state.mode = Mode::Push;
                true
            } else {
                false
            }
        };

        if start {
            tracing::debug!("Token {} switched to push mode", self.shared.token);
            let cursor = self.clone();
            tokio::spawn(async move { cursor.drive_events().await });
        }

        rx
    }

    pub(super) fn emit(&self, event: CursorEvent) {
        let mut state = self.shared.state.lock();
        state
            .listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    async fn drive_events(&self) {
        let mut delivered = 0usize;
        loop {
            match self.pull().await {
                Ok(row) => {
                    self.emit(CursorEvent::Data(row));
                    delivered += 1;
                    if delivered % MAX_SYNC_ROWS == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) if e.is_exhausted() => {
                    if self.shared.state.lock().take_end() {
                        self.emit(CursorEvent::End);
                    }
                    return;
                }
                Err(e) => {
                    // A close races with the pull; listeners only get the end.
                    if !self.is_closed() {
                        self.emit(CursorEvent::Error(e));
                    }
                    return;
                }
            }
        }
    }
}
