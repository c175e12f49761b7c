//! Throttle controller: graduated backpressure over the rate limiter.
//!
//! Admission falls into three bands. Above the threshold the request goes
//! straight through. In the throttle zone it is still admitted, flagged, and
//! when the bucket is empty after this request it is held for the time the
//! next token takes to arrive (capped). Once the bucket cannot cover the
//! cost the request is rejected with a retry-after.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{TollgateError, TollgateResult};
use crate::key_generator::BucketKey;
use crate::rate_limit_config::RoutePolicy;
use crate::rate_limiter::RateLimiter;

pub const DEFAULT_THROTTLE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MAX_THROTTLE_DELAY: Duration = Duration::from_secs(1);

/// What the limiter does when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterFailurePolicy {
    /// Admit the request unlimited
    Open,
    /// Surface `StoreUnavailable`
    #[default]
    Closed,
}

impl FromStr for LimiterFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(LimiterFailurePolicy::Open),
            "closed" => Ok(LimiterFailurePolicy::Closed),
            other => Err(format!(
                "Invalid limiter failure policy '{}', expected 'open' or 'closed'",
                other
            )),
        }
    }
}

impl fmt::Display for LimiterFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterFailurePolicy::Open => f.write_str("open"),
            LimiterFailurePolicy::Closed => f.write_str("closed"),
        }
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub limit: u64,
    pub remaining: u64,
    /// Admitted inside the throttle zone
    pub throttled: bool,
    /// Soft delay applied before admitting
    pub delayed: Duration,
    /// Admitted without consulting the store (fail-open)
    pub degraded: bool,
}

#[derive(Clone)]
pub struct ThrottleController {
    limiter: RateLimiter,
    max_delay: Duration,
    failure_policy: LimiterFailurePolicy,
}

impl ThrottleController {
    pub fn new(
        limiter: RateLimiter,
        max_delay: Duration,
        failure_policy: LimiterFailurePolicy,
    ) -> Self {
        Self {
            limiter,
            max_delay,
            failure_policy,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Consume from the caller's bucket and decide admission.
    pub async fn admit(&self, key: &BucketKey, policy: &RoutePolicy) -> TollgateResult<Admission> {
        let capacity = policy.bucket.capacity;
        if policy.cost > capacity {
            return Err(TollgateError::Configuration(format!(
                "Request cost {} exceeds bucket capacity {} and can never be admitted",
                policy.cost, capacity
            )));
        }

        let consumption = match self.limiter.consume(key, &policy.bucket, policy.cost).await {
            Ok(consumption) => consumption,
            Err(TollgateError::StoreUnavailable(reason))
                if self.failure_policy == LimiterFailurePolicy::Open =>
            {
                tracing::warn!(bucket = %key, reason = %reason, "Rate limit store unavailable, failing open");
                return Ok(Admission {
                    limit: capacity as u64,
                    remaining: capacity as u64,
                    throttled: false,
                    delayed: Duration::ZERO,
                    degraded: true,
                });
            }
            Err(e) => return Err(e),
        };

        if !consumption.consumed {
            let retry_after_secs = retry_after_secs(consumption.time_to_refill());
            tracing::warn!(bucket = %key, retry_after_secs, "Rate limit exceeded");
            return Err(TollgateError::RateLimited { retry_after_secs });
        }

        let throttled = in_throttle_zone(consumption.remaining, capacity, policy.throttle_threshold);
        let mut delayed = Duration::ZERO;

        if throttled {
            if consumption.remaining == 0 {
                delayed = consumption.time_to_refill().min(self.max_delay);
            }
            tracing::info!(
                bucket = %key,
                remaining = consumption.remaining,
                delay_ms = delayed.as_millis() as u64,
                "Throttling active"
            );
            if !delayed.is_zero() {
                tokio::time::sleep(delayed).await;
            }
        }

        Ok(Admission {
            limit: capacity as u64,
            remaining: consumption.remaining,
            throttled,
            delayed,
            degraded: false,
        })
    }
}

/// Strictly below `threshold × capacity`.
pub fn in_throttle_zone(remaining: u64, capacity: u32, threshold: f64) -> bool {
    (remaining as f64) < threshold * capacity as f64
}

/// Whole seconds, rounded up, never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::{MemoryStore, UnavailableStore};
    use crate::token_bucket::BucketSpec;
    use std::sync::Arc;

    fn controller(max_delay: Duration) -> (ThrottleController, MockClock) {
        let clock = MockClock::default();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let limiter = RateLimiter::new(Arc::new(store));
        (
            ThrottleController::new(limiter, max_delay, LimiterFailurePolicy::Closed),
            clock,
        )
    }

    fn policy(capacity: u32, refill_tokens: u32, period: Duration) -> RoutePolicy {
        RoutePolicy {
            bucket: BucketSpec::new(capacity, refill_tokens, period),
            cost: 1,
            throttle_threshold: 0.7,
            idempotency: None,
        }
    }

    fn key() -> BucketKey {
        BucketKey::new("10.0.0.1", "/api/payments", "POST")
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
        assert_eq!(retry_after_secs(Duration::from_millis(60_001)), 61);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("open".parse::<LimiterFailurePolicy>(), Ok(LimiterFailurePolicy::Open));
        assert_eq!("Closed".parse::<LimiterFailurePolicy>(), Ok(LimiterFailurePolicy::Closed));
        assert!("maybe".parse::<LimiterFailurePolicy>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_zone_starts_at_fourth_request() {
        let (controller, _) = controller(Duration::ZERO);
        let policy = policy(10, 1, Duration::from_secs(1));

        for n in 1..=10 {
            let admission = controller.admit(&key(), &policy).await.unwrap();
            assert_eq!(admission.remaining, 10 - n);
            assert_eq!(admission.throttled, n >= 4, "request {}", n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_delay_only_when_bucket_empty() {
        let (controller, _) = controller(Duration::from_millis(500));
        let policy = policy(3, 1, Duration::from_secs(10));

        let second = {
            controller.admit(&key(), &policy).await.unwrap();
            controller.admit(&key(), &policy).await.unwrap()
        };
        assert!(second.throttled);
        assert_eq!(second.delayed, Duration::ZERO);

        let started = tokio::time::Instant::now();
        let last = controller.admit(&key(), &policy).await.unwrap();
        assert_eq!(last.remaining, 0);
        assert_eq!(last.delayed, Duration::from_millis(500));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_is_rejected_with_retry_after() {
        let (controller, clock) = controller(Duration::ZERO);
        let policy = policy(5, 5, Duration::from_secs(60));

        for _ in 0..5 {
            controller.admit(&key(), &policy).await.unwrap();
        }

        match controller.admit(&key(), &policy).await {
            Err(TollgateError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 60)
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        clock.advance(Duration::from_secs(60));
        assert!(controller.admit(&key(), &policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_cost_above_capacity_is_configuration_error() {
        let (controller, _) = controller(Duration::ZERO);
        let mut policy = policy(2, 1, Duration::from_secs(1));
        policy.cost = 3;

        assert!(matches!(
            controller.admit(&key(), &policy).await,
            Err(TollgateError::Configuration(_))
        ));
    }

    fn unreachable_controller(failure_policy: LimiterFailurePolicy) -> ThrottleController {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore));
        ThrottleController::new(limiter, Duration::ZERO, failure_policy)
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open_as_degraded() {
        let controller = unreachable_controller(LimiterFailurePolicy::Open);
        let policy = policy(5, 5, Duration::from_secs(60));

        let admission = controller.admit(&key(), &policy).await.unwrap();
        assert!(admission.degraded);
        assert!(!admission.throttled);
        assert_eq!(admission.limit, 5);
        assert_eq!(admission.remaining, 5);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_closed_with_503() {
        let controller = unreachable_controller(LimiterFailurePolicy::Closed);
        let policy = policy(5, 5, Duration::from_secs(60));

        let err = controller.admit(&key(), &policy).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
        assert_eq!(
            err.status_code(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
