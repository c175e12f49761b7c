//! Request orchestrator.
//!
//! Wraps one protected invocation: admission through the throttle
//! controller, then for idempotent routes the key lookup, lock and
//! resolve cycle that keeps the handler to a single execution per key.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::error::{TollgateError, TollgateResult};
use crate::idempotency::{IdempotencyStore, IdempotencyValue, Resolution};
use crate::key_generator::BucketKey;
use crate::lock::LockManager;
use crate::rate_limit_config::{KeyOrigin, RoutePolicy};
use crate::throttler::{Admission, ThrottleController};
use crate::validation::RequestValidator;

/// One protected call.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub bucket: &'a BucketKey,
    pub policy: &'a RoutePolicy,
    pub idempotency_key: Option<&'a str>,
}

/// Handler result plus how it was obtained.
#[derive(Debug, Clone)]
pub struct Guarded<T> {
    pub value: T,
    /// Returned from the idempotency store instead of executing the handler
    pub replayed: bool,
    pub admission: Admission,
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    throttle: ThrottleController,
    idempotency: IdempotencyStore,
    locks: LockManager,
    lock_ttl: Duration,
}

impl RequestOrchestrator {
    pub fn new(
        throttle: ThrottleController,
        idempotency: IdempotencyStore,
        locks: LockManager,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            throttle,
            idempotency,
            locks,
            lock_ttl,
        }
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Admit the call, then run `handler` at most once per idempotency key.
    ///
    /// A failed handler leaves the key pending so a later retry may execute
    /// again. The lock is released on every path, including cancellation.
    pub async fn run<T, F, Fut>(
        &self,
        invocation: Invocation<'_>,
        handler: F,
    ) -> TollgateResult<Guarded<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = TollgateResult<T>>,
    {
        let admission = self.throttle.admit(invocation.bucket, invocation.policy).await?;

        let origin = match invocation.policy.idempotency {
            Some(origin) => origin,
            None => {
                let value = handler().await?;
                return Ok(Guarded {
                    value,
                    replayed: false,
                    admission,
                });
            }
        };

        let key = invocation.idempotency_key.ok_or(TollgateError::MissingKey)?;
        RequestValidator::validate_idempotency_key(key)?;

        match self.idempotency.get_result(key).await? {
            Some(IdempotencyValue::Resolved(stored)) => {
                tracing::info!(key = %key, "Returning cached result");
                return Ok(Guarded {
                    value: serde_json::from_value(stored)?,
                    replayed: true,
                    admission,
                });
            }
            Some(IdempotencyValue::Pending) => {}
            None => self.first_sight(key, origin).await?,
        }

        let guard = self
            .locks
            .try_acquire(key, self.lock_ttl)
            .await
            .ok_or_else(|| TollgateError::Conflict(key.to_string()))?;

        let outcome = self.execute_locked(key, origin, handler).await;
        guard.release().await;

        let (value, replayed) = outcome?;
        Ok(Guarded {
            value,
            replayed,
            admission,
        })
    }

    async fn first_sight(&self, key: &str, origin: KeyOrigin) -> TollgateResult<()> {
        match origin {
            KeyOrigin::Client => {
                self.idempotency.issue(key).await?;
                Ok(())
            }
            KeyOrigin::Server => {
                tracing::warn!(key = %key, "Rejected unknown idempotency key");
                Err(TollgateError::UnknownKey(key.to_string()))
            }
        }
    }

    async fn execute_locked<T, F, Fut>(
        &self,
        key: &str,
        origin: KeyOrigin,
        handler: F,
    ) -> TollgateResult<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = TollgateResult<T>>,
    {
        // The previous holder may have resolved between our lookup and lock
        match self.idempotency.get_result(key).await? {
            Some(IdempotencyValue::Resolved(stored)) => {
                tracing::info!(key = %key, "Returning result resolved while waiting for lock");
                return Ok((serde_json::from_value(stored)?, true));
            }
            Some(IdempotencyValue::Pending) => {}
            None => self.first_sight(key, origin).await?,
        }

        let value = match handler().await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Handler failed, key left pending");
                return Err(e);
            }
        };

        match self.idempotency.resolve(key, serde_json::to_value(&value)?).await? {
            Resolution::Stored => Ok((value, false)),
            Resolution::AlreadyResolved(existing) => Ok((serde_json::from_value(existing)?, true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::rate_limiter::RateLimiter;
    use crate::store::{MemoryStore, SharedStore};
    use crate::throttler::LimiterFailurePolicy;
    use crate::token_bucket::BucketSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    struct Fixture {
        orchestrator: RequestOrchestrator,
        locks: LockManager,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::default();
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(Arc::new(clock)));
        let throttle = ThrottleController::new(
            RateLimiter::new(Arc::clone(&store)),
            Duration::ZERO,
            LimiterFailurePolicy::Closed,
        );
        let idempotency = IdempotencyStore::new(Arc::clone(&store), Duration::from_secs(60));
        let locks = LockManager::new(Arc::clone(&store));
        Fixture {
            orchestrator: RequestOrchestrator::new(
                throttle,
                idempotency,
                locks.clone(),
                Duration::from_secs(5),
            ),
            locks,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn policy(idempotency: Option<KeyOrigin>) -> RoutePolicy {
        RoutePolicy {
            bucket: BucketSpec::new(100, 100, Duration::from_secs(60)),
            cost: 1,
            throttle_threshold: 0.7,
            idempotency,
        }
    }

    fn bucket() -> BucketKey {
        BucketKey::new("10.0.0.1", "/api/payments", "POST")
    }

    async fn charge(
        fixture: &Fixture,
        policy: &RoutePolicy,
        key: Option<&str>,
    ) -> TollgateResult<Guarded<u64>> {
        let calls = Arc::clone(&fixture.calls);
        let bucket = bucket();
        fixture
            .orchestrator
            .run(
                Invocation {
                    bucket: &bucket,
                    policy,
                    idempotency_key: key,
                },
                || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u64 + 100) },
            )
            .await
    }

    #[tokio::test]
    async fn test_sequential_replay_executes_once() {
        let fixture = fixture();
        let policy = policy(Some(KeyOrigin::Client));

        let first = charge(&fixture, &policy, Some("order-1")).await.unwrap();
        let second = charge(&fixture, &policy, Some("order-1")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn test_non_idempotent_route_runs_every_time() {
        let fixture = fixture();
        let policy = policy(None);

        charge(&fixture, &policy, None).await.unwrap();
        charge(&fixture, &policy, None).await.unwrap();
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_key_never_invokes_handler() {
        let fixture = fixture();
        let result = charge(&fixture, &policy(Some(KeyOrigin::Client)), None).await;

        assert!(matches!(result, Err(TollgateError::MissingKey)));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_origin_rejects_unissued_key() {
        let fixture = fixture();
        let policy = policy(Some(KeyOrigin::Server));

        let result = charge(&fixture, &policy, Some("made-up")).await;
        assert!(matches!(result, Err(TollgateError::UnknownKey(_))));

        let issued = fixture.orchestrator.idempotency().generate().await.unwrap();
        assert!(charge(&fixture, &policy, Some(&issued)).await.is_ok());
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_held_lock_is_a_conflict() {
        let fixture = fixture();
        let policy = policy(Some(KeyOrigin::Client));
        let _held = fixture
            .locks
            .try_acquire("order-1", Duration::from_secs(5))
            .await
            .unwrap();

        let result = charge(&fixture, &policy, Some("order-1")).await;
        assert!(matches!(result, Err(TollgateError::Conflict(_))));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_key_retryable() {
        let fixture = fixture();
        let policy = policy(Some(KeyOrigin::Client));
        let bucket = bucket();
        let invocation = Invocation {
            bucket: &bucket,
            policy: &policy,
            idempotency_key: Some("order-1"),
        };

        let failed: TollgateResult<Guarded<u64>> = fixture
            .orchestrator
            .run(invocation, || async {
                Err(TollgateError::Internal("card declined".into()))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(
            fixture.orchestrator.idempotency().get_result("order-1").await.unwrap(),
            Some(IdempotencyValue::Pending)
        );

        let retried = charge(&fixture, &policy, Some("order-1")).await.unwrap();
        assert!(!retried.replayed);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_call_skips_handler() {
        let fixture = fixture();
        let mut policy = policy(Some(KeyOrigin::Client));
        policy.bucket = BucketSpec::new(1, 1, Duration::from_secs(60));

        charge(&fixture, &policy, Some("a")).await.unwrap();
        let result = charge(&fixture, &policy, Some("b")).await;

        assert!(matches!(
            result,
            Err(TollgateError::RateLimited { retry_after_secs: 60 })
        ));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_lock() {
        let fixture = fixture();
        let policy = policy(Some(KeyOrigin::Client));
        let started = Arc::new(Notify::new());

        let task = {
            let orchestrator = fixture.orchestrator.clone();
            let policy = policy.clone();
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                let bucket = bucket();
                let invocation = Invocation {
                    bucket: &bucket,
                    policy: &policy,
                    idempotency_key: Some("order-1"),
                };
                orchestrator
                    .run(invocation, || async move {
                        started.notify_one();
                        std::future::pending::<TollgateResult<u64>>().await
                    })
                    .await
            })
        };

        started.notified().await;
        let ttl = Duration::from_secs(5);
        assert!(fixture.locks.try_acquire("order-1", ttl).await.is_none());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let mut reacquired = None;
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if let Some(guard) = fixture.locks.try_acquire("order-1", ttl).await {
                reacquired = Some(guard);
                break;
            }
        }
        reacquired.expect("lock released after cancellation").release().await;

        // The handler never finished, so the key is still open for a retry
        let retried = charge(&fixture, &policy, Some("order-1")).await.unwrap();
        assert!(!retried.replayed);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }
}
