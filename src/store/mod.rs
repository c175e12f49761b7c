//! Shared key-value store contract.
//!
//! Every piece of idempotency, lock and bucket state lives behind this
//! trait. Implementations must make each method a single atomic step
//! against the backing store: no component holds store state across calls,
//! so correctness under multiple service instances depends only on these
//! primitives.

mod memory;
mod redis_store;

pub use self::memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
pub use self::redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TollgateResult;
use crate::token_bucket::{BucketSpec, Consumption};

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get a value by key. Expired entries read as absent.
    async fn get(&self, key: &str) -> TollgateResult<Option<String>>;

    /// Unconditionally write a value with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<bool>;

    /// Replace the value only if it currently equals `expected`, resetting TTL.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> TollgateResult<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> TollgateResult<bool>;

    /// Delete only if the current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> TollgateResult<bool>;

    /// Lazily refill the bucket at `key` and try to deduct `cost`, in one
    /// atomic round trip. Missing buckets start full.
    async fn take_tokens(
        &self,
        key: &str,
        spec: &BucketSpec,
        cost: u32,
    ) -> TollgateResult<Consumption>;

    /// Round-trip health check.
    async fn ping(&self) -> TollgateResult<String>;
}

/// Store whose backend is always unreachable.
#[cfg(test)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
impl UnavailableStore {
    fn down<T>() -> TollgateResult<T> {
        Err(crate::error::TollgateError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }
}

#[cfg(test)]
#[async_trait]
impl SharedStore for UnavailableStore {
    async fn get(&self, _key: &str) -> TollgateResult<Option<String>> {
        Self::down()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> TollgateResult<()> {
        Self::down()
    }

    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> TollgateResult<bool> {
        Self::down()
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: &str,
        _value: &str,
        _ttl: Duration,
    ) -> TollgateResult<bool> {
        Self::down()
    }

    async fn delete(&self, _key: &str) -> TollgateResult<bool> {
        Self::down()
    }

    async fn delete_if_equals(&self, _key: &str, _expected: &str) -> TollgateResult<bool> {
        Self::down()
    }

    async fn take_tokens(
        &self,
        _key: &str,
        _spec: &BucketSpec,
        _cost: u32,
    ) -> TollgateResult<Consumption> {
        Self::down()
    }

    async fn ping(&self) -> TollgateResult<String> {
        Self::down()
    }
}
