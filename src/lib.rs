//! Client protocol engine for ReQL databases.
//!
//! Frames queries over the binary wire protocol, authenticates with
//! SCRAM-SHA-256, multiplexes many queries per connection by token, and
//! exposes lazily fetched results as [`Cursor`]s.

pub mod config;
pub mod connection;
pub mod cursor;
pub mod decode;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod protocol;

pub use config::{ConnectOptions, QueryOptions, TlsOptions};
pub use connection::{
    CloseOptions, Connection, ConnectionEvent, ConnectionState, FollowUp, QueryResponse,
    QueryResult,
};
pub use cursor::{Cursor, CursorEvent, CursorType, RowAck, RowStream};
pub use decode::{PassthroughDecoder, RowDecoder};
pub use driver::{Driver, DriverOptions};
pub use error::{ReqlError, ReqlResult};
pub use handshake::{Handshake, HandshakeAction, HandshakeState, KeyCache};
pub use protocol::{Framer, RawResponse, ResponseType, RuntimeErrorKind};
