//! Wire protocol definitions
//!
//! JSON payloads over a length-prefixed binary framing, preceded by a
//! NUL-delimited JSON handshake.

pub mod codec;
pub mod response;
pub mod types;

pub use codec::{
    encode_frame, encode_handshake_message, encode_handshake_start, encode_query, Frame, Framer,
    HEADER_SIZE,
};
pub use response::RawResponse;
pub use types::{
    QueryType, ResponseNote, ResponseType, RuntimeErrorKind, AUTHENTICATION_METHOD, NO_TOKEN,
    PROTOCOL_VERSION_V1_0, SUB_PROTOCOL_VERSION,
};
