use serde::{Deserialize, Serialize};

/// Magic number sent as the first four bytes of a V1_0 handshake.
pub const PROTOCOL_VERSION_V1_0: u32 = 0x34c2_bdc3;

/// Sub-protocol version advertised inside the handshake JSON.
pub const SUB_PROTOCOL_VERSION: i64 = 0;

pub const AUTHENTICATION_METHOD: &str = "SCRAM-SHA-256";

/// Token value the server uses when it cannot attribute a response to a
/// request (the two little-endian halves of -1).
pub const NO_TOKEN: u64 = u64::MAX;

/// Query type opcodes, the first element of every query payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
    ServerInfo = 5,
}

impl QueryType {
    /// The single-element payload used by follow-up requests.
    pub fn payload(self) -> serde_json::Value {
        serde_json::json!([self as u8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    SuccessAtom,
    SuccessSequence,
    SuccessPartial,
    WaitComplete,
    ServerInfo,
    ClientError,
    CompileError,
    RuntimeError,
}

impl ResponseType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ResponseType::SuccessAtom),
            2 => Some(ResponseType::SuccessSequence),
            3 => Some(ResponseType::SuccessPartial),
            4 => Some(ResponseType::WaitComplete),
            5 => Some(ResponseType::ServerInfo),
            16 => Some(ResponseType::ClientError),
            17 => Some(ResponseType::CompileError),
            18 => Some(ResponseType::RuntimeError),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            ResponseType::SuccessAtom => 1,
            ResponseType::SuccessSequence => 2,
            ResponseType::SuccessPartial => 3,
            ResponseType::WaitComplete => 4,
            ResponseType::ServerInfo => 5,
            ResponseType::ClientError => 16,
            ResponseType::CompileError => 17,
            ResponseType::RuntimeError => 18,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

/// Notes attached to a partial response describing what kind of feed it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseNote {
    SequenceFeed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
    IncludesStates,
}

impl ResponseNote {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ResponseNote::SequenceFeed),
            2 => Some(ResponseNote::AtomFeed),
            3 => Some(ResponseNote::OrderByLimitFeed),
            4 => Some(ResponseNote::UnionedFeed),
            5 => Some(ResponseNote::IncludesStates),
            _ => None,
        }
    }
}

/// Category of a runtime error, carried in the `e` field of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Internal,
    ResourceLimit,
    QueryLogic,
    NonExistence,
    OpFailed,
    OpIndeterminate,
    User,
    Permission,
    Unknown(i64),
}

impl RuntimeErrorKind {
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(1_000_000) => RuntimeErrorKind::Internal,
            Some(2_000_000) => RuntimeErrorKind::ResourceLimit,
            Some(3_000_000) => RuntimeErrorKind::QueryLogic,
            Some(3_100_000) => RuntimeErrorKind::NonExistence,
            Some(4_100_000) => RuntimeErrorKind::OpFailed,
            Some(4_200_000) => RuntimeErrorKind::OpIndeterminate,
            Some(5_000_000) => RuntimeErrorKind::User,
            Some(6_000_000) => RuntimeErrorKind::Permission,
            Some(other) => RuntimeErrorKind::Unknown(other),
            None => RuntimeErrorKind::Unknown(0),
        }
    }
}

impl std::fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeErrorKind::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_codes() {
        for code in [1, 2, 3, 4, 5, 16, 17, 18] {
            let kind = ResponseType::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(ResponseType::from_code(6).is_none());
        assert!(ResponseType::RuntimeError.is_error());
        assert!(!ResponseType::SuccessPartial.is_error());
    }

    #[test]
    fn test_follow_up_payloads() {
        assert_eq!(QueryType::Continue.payload(), serde_json::json!([2]));
        assert_eq!(QueryType::Stop.payload(), serde_json::json!([3]));
        assert_eq!(QueryType::NoreplyWait.payload(), serde_json::json!([4]));
    }

    #[test]
    fn test_runtime_error_kind() {
        assert_eq!(
            RuntimeErrorKind::from_code(Some(5_000_000)),
            RuntimeErrorKind::User
        );
        assert_eq!(
            RuntimeErrorKind::from_code(Some(42)),
            RuntimeErrorKind::Unknown(42)
        );
        assert_eq!(RuntimeErrorKind::Unknown(42).to_string(), "Unknown(42)");
    }
}
