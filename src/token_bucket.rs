use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

use crate::error::{TollgateError, TollgateResult};

/// Resolved bucket parameters for one route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Maximum token count (burst allowance)
    pub capacity: u32,
    /// Tokens granted per refill period
    pub refill_tokens: u32,
    #[serde(with = "humantime_serde")]
    pub refill_period: Duration,
}

impl BucketSpec {
    pub fn new(capacity: u32, refill_tokens: u32, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_period,
        }
    }

    pub fn validate(&self) -> TollgateResult<()> {
        if self.capacity == 0 {
            return Err(TollgateError::Configuration(
                "Bucket capacity must be greater than 0".to_string(),
            ));
        }
        if self.refill_tokens == 0 {
            return Err(TollgateError::Configuration(
                "Refill tokens must be greater than 0".to_string(),
            ));
        }
        if self.refill_period.is_zero() {
            return Err(TollgateError::Configuration(
                "Refill period must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Tokens per second of sustained throughput.
    pub fn refill_rate(&self) -> f64 {
        self.refill_tokens as f64 / self.refill_period.as_secs_f64()
    }

    /// Inactivity after which a bucket is indistinguishable from a fresh one:
    /// time to refill from empty to full, plus one period.
    pub fn idle_ttl(&self) -> Duration {
        let periods = (self.capacity as f64 / self.refill_tokens as f64).ceil() as u32;
        self.refill_period * periods.saturating_add(1)
    }

    /// `ceil((cost - tokens) / refill_tokens) * refill_period`, zero when
    /// `tokens` already covers `cost`.
    pub fn time_until_available(&self, tokens: f64, cost: u32) -> Duration {
        let missing = cost as f64 - tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        let periods = (missing / self.refill_tokens as f64).ceil() as u32;
        self.refill_period * periods
    }
}

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Consumption {
    pub consumed: bool,
    /// Whole tokens left after the attempt
    pub remaining: u64,
    /// Time until the bucket holds `cost` tokens again
    pub nanos_to_refill: u64,
}

impl Consumption {
    pub fn time_to_refill(&self) -> Duration {
        Duration::from_nanos(self.nanos_to_refill)
    }
}

/// Bucket state with lazy refill. Token counts are fractional so that
/// sub-period elapsed time still contributes partial refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn full(spec: &BucketSpec, now: Instant) -> Self {
        Self {
            tokens: spec.capacity as f64,
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, spec: &BucketSpec, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let tokens_to_add =
            elapsed.as_secs_f64() / spec.refill_period.as_secs_f64() * spec.refill_tokens as f64;

        // Never exceed capacity
        self.tokens = (self.tokens + tokens_to_add).min(spec.capacity as f64);
        self.last_refill = now;
    }

    /// Refill, then deduct `cost` if enough tokens exist. A cost of zero
    /// only refills, which makes it a read of the remaining capacity.
    pub fn take(&mut self, spec: &BucketSpec, cost: u32, now: Instant) -> Consumption {
        self.refill(spec, now);

        let consumed = self.tokens >= cost as f64;
        if consumed {
            self.tokens -= cost as f64;
        }

        Consumption {
            consumed,
            remaining: self.tokens.floor() as u64,
            nanos_to_refill: spec.time_until_available(self.tokens, cost).as_nanos() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(capacity: u32, refill_tokens: u32, period_secs: u64) -> BucketSpec {
        BucketSpec::new(capacity, refill_tokens, Duration::from_secs(period_secs))
    }

    #[test]
    fn test_capacity_consumptions_then_rejection() {
        let spec = spec(10, 2, 1);
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&spec, now);

        for expected in (0..10).rev() {
            let outcome = bucket.take(&spec, 1, now);
            assert!(outcome.consumed);
            assert_eq!(outcome.remaining, expected);
        }

        let rejected = bucket.take(&spec, 1, now);
        assert!(!rejected.consumed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.time_to_refill(), Duration::from_secs(1));
    }

    #[test]
    fn test_refill_after_one_period() {
        let spec = spec(10, 2, 1);
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&spec, now);
        bucket.take(&spec, 5, now);

        let later = now + Duration::from_secs(1);
        assert_eq!(bucket.take(&spec, 0, later).remaining, 7);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let spec = spec(5, 1000, 1);
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&spec, now);
        bucket.take(&spec, 3, now);

        let later = now + Duration::from_secs(10);
        assert_eq!(bucket.take(&spec, 0, later).remaining, 5);
    }

    #[test]
    fn test_partial_period_accumulates_fractionally() {
        let spec = spec(4, 4, 60);
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&spec, now);
        bucket.take(&spec, 4, now);

        let mut later = bucket.clone();
        assert!(!later.take(&spec, 1, now + Duration::from_secs(5)).consumed);

        // 15s is a quarter period: one token
        let outcome = bucket.take(&spec, 1, now + Duration::from_secs(15));
        assert!(outcome.consumed);
        assert_eq!(outcome.remaining, 0);
    }

    #[test]
    fn test_wait_time_rounds_up_to_whole_periods() {
        let spec = spec(5, 5, 60);
        assert_eq!(spec.time_until_available(0.0, 1), Duration::from_secs(60));
        assert_eq!(spec.time_until_available(0.5, 1), Duration::from_secs(60));
        assert_eq!(spec.time_until_available(2.0, 1), Duration::ZERO);
        assert_eq!(self::spec(5, 2, 10).time_until_available(0.0, 5), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_specs_are_configuration_errors() {
        assert!(spec(0, 1, 1).validate().is_err());
        assert!(spec(1, 0, 1).validate().is_err());
        assert!(BucketSpec::new(1, 1, Duration::ZERO).validate().is_err());
        assert!(spec(10, 5, 60).validate().is_ok());
    }

    #[test]
    fn test_idle_ttl_covers_full_refill() {
        assert_eq!(spec(10, 5, 60).idle_ttl(), Duration::from_secs(180));
    }
}
