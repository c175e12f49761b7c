use std::time::Duration;

use crate::config::Config;
use crate::error::{TollgateError, TollgateResult};

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL. Empty selects the in-process store.
    pub fn validate_redis_url(url: &str) -> TollgateResult<()> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(());
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(TollgateError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_threshold(threshold: f64) -> TollgateResult<()> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(TollgateError::Configuration(format!(
                "Throttle threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        Ok(())
    }

    pub fn validate_ttl(name: &str, ttl: Duration) -> TollgateResult<()> {
        if ttl.is_zero() {
            return Err(TollgateError::Configuration(format!(
                "{} must be greater than 0",
                name
            )));
        }
        Ok(())
    }

    /// Validates the whole process configuration, including the route table.
    pub fn validate_config(config: &Config) -> TollgateResult<()> {
        Self::validate_redis_url(&config.redis_url)?;
        Self::validate_threshold(config.throttle_threshold)?;
        Self::validate_ttl("IDEMPOTENCY_TTL", config.idempotency_ttl)?;
        Self::validate_ttl("LOCK_TTL", config.lock_ttl)?;
        Self::validate_ttl("STORE_SWEEP_INTERVAL", config.store_sweep_interval)?;
        config.default_policy().validate()?;
        config.route_policies()?;
        Ok(())
    }
}
