use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::scram::{salt_password, SaltedPassword};
use crate::error::{ReqlError, ReqlResult};

pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 64;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    password: Vec<u8>,
    salt: Vec<u8>,
    iterations: u32,
}

/// Bounded cache of PBKDF2 outputs keyed by (password, salt, iterations).
///
/// Owned by a [`Driver`](crate::Driver) and shared by every connection it opens.
#[derive(Clone)]
pub struct KeyCache {
    entries: Arc<Mutex<LruCache<CacheKey, SaltedPassword>>>,
}

impl KeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Return the cached salted password, deriving and storing it on a miss.
    ///
    /// PBKDF2 runs under `spawn_blocking`; it must not stall the runtime the
    /// connection's timers live on.
    pub async fn salted_password(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> ReqlResult<SaltedPassword> {
        let key = CacheKey {
            password: password.to_vec(),
            salt: salt.to_vec(),
            iterations,
        };

        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(*hit);
        }

        tracing::debug!("Deriving salted password ({} iterations)", iterations);
        let (password, salt) = (key.password.clone(), key.salt.clone());
        let salted = tokio::task::spawn_blocking(move || salt_password(&password, &salt, iterations))
            .await
            .map_err(|e| ReqlError::driver(format!("Key derivation task failed: {}", e)))??;

        self.entries.lock().put(key, salted);
        Ok(salted)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_CACHE_CAPACITY)
    }
}
