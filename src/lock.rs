//! Per-key mutual exclusion over the shared store.
//!
//! A lock is a set-if-absent record with a short TTL holding a random
//! holder token. Acquisition never blocks, and a store failure during
//! acquisition counts as "not acquired". The TTL bounds how long a crashed
//! holder can strand a key.

use std::sync::Arc;
use std::time::Duration;

use crate::error::TollgateResult;
use crate::key_generator::lock_key;
use crate::store::SharedStore;

/// Default upper bound on how long a lock may be held.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn SharedStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Try once to take the lock for `key`. `None` means another holder is
    /// active or the store could not be reached.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        let record = lock_key(key);

        match self.store.set_if_absent(&record, &token, ttl).await {
            Ok(true) => {
                tracing::info!(key = %key, "Acquired idempotency lock");
                Some(LockGuard {
                    store: Arc::clone(&self.store),
                    key: key.to_string(),
                    token,
                    released: false,
                })
            }
            Ok(false) => {
                tracing::warn!(key = %key, "Idempotency lock is held elsewhere");
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Lock store unavailable, failing closed");
                None
            }
        }
    }

    /// Delete the lock record regardless of holder. Releasing a lock that
    /// already expired is not an error.
    pub async fn release(&self, key: &str) -> TollgateResult<()> {
        self.store.delete(&lock_key(key)).await?;
        tracing::info!(key = %key, "Released idempotency lock");
        Ok(())
    }
}

/// A held lock.
///
/// Call [`LockGuard::release`] on the normal exit paths. If the guard is
/// dropped without it (the request future was cancelled, or a panic
/// unwound through it) the release is spawned onto the runtime instead.
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        release_held(self.store.as_ref(), &self.key, &self.token).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_held(store.as_ref(), &key, &token).await;
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "No runtime to release dropped lock, leaving it to expire");
            }
        }
    }
}

/// Delete the lock only while it still carries our token, so a holder whose
/// lock expired cannot remove a successor's lock.
async fn release_held(store: &dyn SharedStore, key: &str, token: &str) {
    match store.delete_if_equals(&lock_key(key), token).await {
        Ok(true) => tracing::info!(key = %key, "Released idempotency lock"),
        Ok(false) => tracing::debug!(key = %key, "Idempotency lock had already expired"),
        Err(e) => tracing::warn!(key = %key, error = %e, "Failed to release lock, it will expire"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::{MemoryStore, UnavailableStore};

    fn locks() -> (LockManager, MockClock) {
        let clock = MockClock::default();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (LockManager::new(Arc::new(store)), clock)
    }

    #[tokio::test]
    async fn test_single_holder() {
        let (locks, _) = locks();
        let ttl = Duration::from_secs(5);

        let guard = locks.try_acquire("k", ttl).await.expect("first acquire");
        assert!(locks.try_acquire("k", ttl).await.is_none());

        guard.release().await;
        assert!(locks.try_acquire("k", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_lock_recovers_after_ttl_without_release() {
        let (locks, clock) = locks();
        let ttl = Duration::from_secs(5);

        let crashed = locks.try_acquire("k", ttl).await.expect("first acquire");
        std::mem::forget(crashed);

        assert!(locks.try_acquire("k", ttl).await.is_none());
        clock.advance(ttl);
        assert!(locks.try_acquire("k", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_successor() {
        let (locks, clock) = locks();
        let ttl = Duration::from_secs(5);

        let stale = locks.try_acquire("k", ttl).await.expect("first acquire");
        clock.advance(ttl);
        let _current = locks.try_acquire("k", ttl).await.expect("second acquire");

        stale.release().await;
        assert!(locks.try_acquire("k", ttl).await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (locks, _) = locks();
        let ttl = Duration::from_secs(5);

        drop(locks.try_acquire("k", ttl).await.expect("first acquire"));
        tokio::task::yield_now().await;

        assert!(locks.try_acquire("k", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_release_of_missing_lock_is_not_an_error() {
        let (locks, _) = locks();
        assert!(locks.release("never-locked").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_not_acquired() {
        let locks = LockManager::new(Arc::new(UnavailableStore));
        assert!(locks.try_acquire("k", Duration::from_secs(5)).await.is_none());
        assert!(locks.release("k").await.is_err());
    }
}
