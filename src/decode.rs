//! Row decoding seam
//!
//! Raw atoms and batches are handed to a [`RowDecoder`] before they reach
//! callers. Conversions of pseudo-types (times, geometry, binary) live behind
//! this trait.

use serde_json::Value;

use crate::config::QueryOptions;
use crate::error::ReqlResult;

pub trait RowDecoder: Send + Sync {
    /// Decode the single value of an atom response.
    fn decode_atom(&self, raw: Value, options: &QueryOptions) -> ReqlResult<Value>;

    /// Decode one batch of rows.
    fn decode_sequence(&self, raw: Vec<Value>, options: &QueryOptions) -> ReqlResult<Vec<Value>> {
        raw.into_iter()
            .map(|row| self.decode_atom(row, options))
            .collect()
    }
}

/// Returns rows exactly as the server sent them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

impl RowDecoder for PassthroughDecoder {
    fn decode_atom(&self, raw: Value, _options: &QueryOptions) -> ReqlResult<Value> {
        Ok(raw)
    }

    fn decode_sequence(&self, raw: Vec<Value>, _options: &QueryOptions) -> ReqlResult<Vec<Value>> {
        Ok(raw)
    }
}
