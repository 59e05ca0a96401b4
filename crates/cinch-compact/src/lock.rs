//! Per-key async mutual exclusion.
//!
//! [`KeyedLocks`] hands out one async mutex per key (a session id, a cache
//! file). The returned [`KeyGuard`] releases on drop, so every exit path
//! (success, error, cancellation, panic unwind) gives the key back.

use crate::CompactError;
use crate::config::InFlightPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A family of named locks sharing one registry.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    registry: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Exclusive hold on one key.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        trace!("released lock {}", self.key);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        // Drop idle entries; a held or awaited lock has other strong refs.
        registry.retain(|_, lock| Arc::strong_count(lock) > 1);
        registry
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the key, giving up if `cancel` fires first.
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyGuard, CompactError> {
        let lock = self.entry(key);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CompactError::Canceled),
            guard = lock.lock_owned() => {
                trace!("acquired lock {key}");
                Ok(KeyGuard { key: key.to_string(), _guard: guard })
            }
        }
    }

    /// Take the key only if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Result<KeyGuard, CompactError> {
        let lock = self.entry(key);
        match lock.try_lock_owned() {
            Ok(guard) => Ok(KeyGuard {
                key: key.to_string(),
                _guard: guard,
            }),
            Err(_) => Err(CompactError::CompactionInFlight {
                session_id: key.to_string(),
            }),
        }
    }

    /// Acquire according to an in-flight policy.
    pub async fn acquire_with(
        &self,
        key: &str,
        policy: InFlightPolicy,
        cancel: &CancellationToken,
    ) -> Result<KeyGuard, CompactError> {
        match policy {
            InFlightPolicy::Wait => self.acquire(key, cancel).await,
            InFlightPolicy::Reject => self.try_acquire(key),
        }
    }

    /// Whether someone currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
