//! Connection factory
//!
//! A [`Driver`] carries what every connection it opens shares: result-shape
//! defaults, the row decoder and the cache of derived SCRAM keys.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConnectOptions;
use crate::connection::{self, Connection};
use crate::decode::{PassthroughDecoder, RowDecoder};
use crate::error::ReqlResult;
use crate::handshake::{KeyCache, DEFAULT_KEY_CACHE_CAPACITY};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Resolve sequences as cursors unless a query says otherwise
    #[serde(default)]
    pub cursor: bool,

    /// Resolve sequences as row streams unless a query says otherwise
    #[serde(default)]
    pub stream: bool,

    #[serde(default = "default_key_cache_capacity")]
    pub key_cache_capacity: usize,
}

fn default_key_cache_capacity() -> usize {
    DEFAULT_KEY_CACHE_CAPACITY
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            cursor: false,
            stream: false,
            key_cache_capacity: DEFAULT_KEY_CACHE_CAPACITY,
        }
    }
}

#[derive(Clone)]
pub struct Driver {
    options: Arc<DriverOptions>,
    key_cache: KeyCache,
    decoder: Arc<dyn RowDecoder>,
}

impl Driver {
    pub fn new() -> Self {
        Self::with_options(DriverOptions::default())
    }

    pub fn with_options(options: DriverOptions) -> Self {
        Self {
            key_cache: KeyCache::new(options.key_cache_capacity),
            options: Arc::new(options),
            decoder: Arc::new(PassthroughDecoder),
        }
    }

    /// Replace the row decoder used by connections opened from now on.
    pub fn with_decoder(mut self, decoder: Arc<dyn RowDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Open and authenticate a new connection.
    pub async fn connect(&self, options: ConnectOptions) -> ReqlResult<Connection> {
        connection::open(self.clone(), options).await
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    pub(crate) fn decoder(&self) -> Arc<dyn RowDecoder> {
        self.decoder.clone()
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("options", &self.options)
            .field("cached_keys", &self.key_cache.len())
            .finish()
    }
}
