//! Idempotency store.
//!
//! Maps an idempotency key to either the pending placeholder or the
//! serialized result of the completed operation. The placeholder is
//! replaced at most once, by compare-and-set, so a resolved value is
//! immutable until the entry expires.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{TollgateError, TollgateResult};
use crate::key_generator::idempotency_key;
use crate::store::SharedStore;
use crate::validation::RequestValidator;

/// Default lifetime of an idempotency entry.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Exact stored encoding of `IdempotencyValue::Pending`.
const PLACEHOLDER: &str = r#"{"state":"pending"}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum IdempotencyValue {
    /// Key issued or first seen, operation not yet resolved
    Pending,
    /// Serialized result of the completed operation
    Resolved(serde_json::Value),
}

impl IdempotencyValue {
    pub fn is_resolved(&self) -> bool {
        matches!(self, IdempotencyValue::Resolved(_))
    }
}

/// Outcome of writing a final value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// This call wrote the final value
    Stored,
    /// Another caller resolved first; their value stands
    AlreadyResolved(serde_json::Value),
}

#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create the placeholder entry if absent. Returns whether it was created.
    pub async fn issue(&self, key: &str) -> TollgateResult<bool> {
        let created = self
            .store
            .set_if_absent(&idempotency_key(key), PLACEHOLDER, self.ttl)
            .await?;

        if created {
            tracing::info!(key = %key, "Issued idempotency key");
        } else {
            tracing::debug!(key = %key, "Idempotency key already exists");
        }
        Ok(created)
    }

    /// Generate a fresh server-side key and issue it.
    pub async fn generate(&self) -> TollgateResult<String> {
        let key = uuid::Uuid::new_v4().to_string();
        if !self.issue(&key).await? {
            return Err(TollgateError::Internal(format!(
                "Generated idempotency key {} already exists",
                key
            )));
        }
        Ok(key)
    }

    /// Current value, or `None` if the key was never issued or has expired.
    pub async fn get_result(&self, key: &str) -> TollgateResult<Option<IdempotencyValue>> {
        match self.store.get(&idempotency_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Status lookup for a client-presented key.
    pub async fn lookup(&self, key: &str) -> TollgateResult<IdempotencyValue> {
        RequestValidator::validate_idempotency_key(key)?;
        self.get_result(key)
            .await?
            .ok_or_else(|| TollgateError::UnknownKey(key.to_string()))
    }

    /// Replace the placeholder with the final value, resetting the TTL.
    ///
    /// A resolved entry is never overwritten: if one already exists its
    /// value is returned instead. If the entry vanished while the operation
    /// ran, the value is written only if nobody else recreated it meanwhile.
    pub async fn resolve(&self, key: &str, value: serde_json::Value) -> TollgateResult<Resolution> {
        let store_key = idempotency_key(key);
        let encoded = serde_json::to_string(&IdempotencyValue::Resolved(value))?;

        if self
            .store
            .compare_and_set(&store_key, PLACEHOLDER, &encoded, self.ttl)
            .await?
        {
            tracing::info!(key = %key, "Resolved idempotency key");
            return Ok(Resolution::Stored);
        }

        match self.get_result(key).await? {
            Some(IdempotencyValue::Resolved(existing)) => {
                tracing::warn!(key = %key, "Idempotency key was already resolved, keeping first value");
                Ok(Resolution::AlreadyResolved(existing))
            }
            Some(IdempotencyValue::Pending) => Err(TollgateError::Internal(format!(
                "Placeholder for idempotency key {} changed during resolve",
                key
            ))),
            None => {
                if self.store.set_if_absent(&store_key, &encoded, self.ttl).await? {
                    tracing::warn!(key = %key, "Idempotency entry expired before resolve, stored result anew");
                    return Ok(Resolution::Stored);
                }
                match self.get_result(key).await? {
                    Some(IdempotencyValue::Resolved(existing)) => {
                        Ok(Resolution::AlreadyResolved(existing))
                    }
                    _ => Err(TollgateError::Internal(format!(
                        "Lost race resolving idempotency key {}",
                        key
                    ))),
                }
            }
        }
    }

    /// Remove the entry immediately. Returns whether it existed.
    pub async fn evict(&self, key: &str) -> TollgateResult<bool> {
        RequestValidator::validate_idempotency_key(key)?;
        let removed = self.store.delete(&idempotency_key(key)).await?;
        if removed {
            tracing::info!(key = %key, "Evicted idempotency key");
        }
        Ok(removed)
    }
}
