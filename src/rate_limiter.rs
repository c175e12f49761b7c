use std::sync::Arc;

use crate::error::TollgateResult;
use crate::key_generator::BucketKey;
use crate::store::SharedStore;
use crate::token_bucket::{BucketSpec, Consumption};

/// Token bucket rate limiter over the shared store.
///
/// Holds no bucket state of its own: every call is one atomic
/// refill-and-deduct against the store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Refill lazily, then try to deduct `cost` tokens.
    pub async fn consume(
        &self,
        key: &BucketKey,
        spec: &BucketSpec,
        cost: u32,
    ) -> TollgateResult<Consumption> {
        spec.validate()?;
        let outcome = self.store.take_tokens(key.as_str(), spec, cost).await?;

        tracing::debug!(
            bucket = %key,
            cost,
            consumed = outcome.consumed,
            remaining = outcome.remaining,
            "Rate limit checked"
        );

        Ok(outcome)
    }

    /// Remaining whole tokens, after refill, without consuming any.
    pub async fn remaining(&self, key: &BucketKey, spec: &BucketSpec) -> TollgateResult<u64> {
        Ok(self.consume(key, spec, 0).await?.remaining)
    }

    /// Drop the bucket so the next request starts from full capacity.
    pub async fn reset(&self, key: &BucketKey) -> TollgateResult<bool> {
        self.store.delete(key.as_str()).await
    }
}
