use serde_json::Value;
use thiserror::Error;

use crate::protocol::types::RuntimeErrorKind;

/// Message used for every request still pending when the socket goes away.
pub const CONNECTION_CLOSED_MESSAGE: &str =
    "The connection was closed before the query could be completed.";

#[derive(Error, Debug, Clone)]
pub enum ReqlError {
    /// Local failure that did not originate from query semantics
    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Compile error: {message}")]
    Compile {
        message: String,
        query: Option<Value>,
        backtrace: Option<Value>,
    },

    #[error("Client error: {message}")]
    Client {
        message: String,
        query: Option<Value>,
        backtrace: Option<Value>,
    },

    #[error("Runtime error ({kind}): {message}")]
    Runtime {
        kind: RuntimeErrorKind,
        message: String,
        query: Option<Value>,
        backtrace: Option<Value>,
    },

    /// Synthesized locally when the connection drops with requests outstanding
    #[error("Server error: {0}")]
    Server(String),

    #[error("No more rows in the {0}")]
    NoMoreRows(String),

    #[error("You cannot call `next` on a closed {0}")]
    CursorClosed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type ReqlResult<T> = Result<T, ReqlError>;

impl ReqlError {
    pub fn driver(msg: impl Into<String>) -> Self {
        ReqlError::Driver(msg.into())
    }

    pub fn connection_closed() -> Self {
        ReqlError::Server(CONNECTION_CLOSED_MESSAGE.to_string())
    }

    /// Errors raised locally by the driver rather than by a query.
    pub fn is_driver_error(&self) -> bool {
        matches!(
            self,
            ReqlError::Driver(_)
                | ReqlError::Auth(_)
                | ReqlError::Io(_)
                | ReqlError::Json(_)
                | ReqlError::CursorClosed(_)
                | ReqlError::NoMoreRows(_)
        )
    }

    /// True for the error that iteration helpers treat as normal termination.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ReqlError::NoMoreRows(_))
    }

    pub fn is_cursor_closed(&self) -> bool {
        matches!(self, ReqlError::CursorClosed(_))
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ReqlError::Server(msg) if msg == CONNECTION_CLOSED_MESSAGE)
    }

    /// Server-provided text of the error, without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            ReqlError::Compile { message, .. }
            | ReqlError::Client { message, .. }
            | ReqlError::Runtime { message, .. } => message.clone(),
            ReqlError::Driver(msg)
            | ReqlError::Auth(msg)
            | ReqlError::Server(msg)
            | ReqlError::Io(msg)
            | ReqlError::Json(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// The original query attached for diagnostics, if any.
    pub fn query(&self) -> Option<&Value> {
        match self {
            ReqlError::Compile { query, .. }
            | ReqlError::Client { query, .. }
            | ReqlError::Runtime { query, .. } => query.as_ref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReqlError {
    fn from(err: std::io::Error) -> Self {
        ReqlError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ReqlError {
    fn from(err: serde_json::Error) -> Self {
        ReqlError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ReqlError::driver("boom");
        assert_eq!(err.to_string(), "Driver error: boom");

        let err = ReqlError::NoMoreRows("cursor".to_string());
        assert_eq!(err.to_string(), "No more rows in the cursor");

        let err = ReqlError::CursorClosed("feed".to_string());
        assert_eq!(err.to_string(), "You cannot call `next` on a closed feed");

        let err = ReqlError::Runtime {
            kind: RuntimeErrorKind::QueryLogic,
            message: "Cannot divide by zero.".to_string(),
            query: None,
            backtrace: None,
        };
        assert_eq!(
            err.to_string(),
            "Runtime error (QueryLogic): Cannot divide by zero."
        );
        assert_eq!(err.message(), "Cannot divide by zero.");
    }

    #[test]
    fn test_error_classification() {
        assert!(ReqlError::connection_closed().is_connection_closed());
        assert!(!ReqlError::Server("other".to_string()).is_connection_closed());
        assert!(ReqlError::NoMoreRows("cursor".into()).is_exhausted());
        assert!(ReqlError::Auth("bad proof".into()).is_driver_error());
        assert!(!ReqlError::Compile {
            message: "x".into(),
            query: None,
            backtrace: None
        }
        .is_driver_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ReqlError = io.into();
        assert!(matches!(err, ReqlError::Io(ref m) if m.contains("pipe closed")));
    }
}
