use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::ResponseType;

/// A decoded response frame payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    /// Response kind discriminant
    pub t: i64,
    /// Result rows, or the error message for error kinds
    #[serde(default)]
    pub r: Vec<Value>,
    /// Backtrace for error kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<Value>,
    /// Profile sub-object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Value>,
    /// Notes describing feed kinds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub n: Vec<i64>,
    /// Runtime error category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<i64>,
}

impl RawResponse {
    pub fn kind(&self) -> Option<ResponseType> {
        ResponseType::from_code(self.t)
    }

    /// The single atom carried by atom-like responses.
    pub fn atom(&self) -> Value {
        self.r.first().cloned().unwrap_or(Value::Null)
    }

    /// Error text for error kinds.
    pub fn error_message(&self) -> String {
        match self.r.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "Unknown error".to_string(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn atom_response(value: Value) -> Self {
        Self {
            t: ResponseType::SuccessAtom.code(),
            r: vec![value],
            ..Default::default()
        }
    }

    pub fn sequence(kind: ResponseType, rows: Vec<Value>) -> Self {
        Self {
            t: kind.code(),
            r: rows,
            ..Default::default()
        }
    }
}
