use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

use crate::error::{TollgateError, TollgateResult};
use crate::key_generator::{normalize_endpoint, normalize_method};
use crate::token_bucket::BucketSpec;

/// Where idempotency keys for a route come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrigin {
    /// Clients mint their own keys; an unseen key is issued on first use
    Client,
    /// Keys must be issued by the server first; unseen keys are rejected
    Server,
}

/// Fully resolved protection settings for one route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePolicy {
    pub bucket: BucketSpec,
    /// Tokens consumed per request
    pub cost: u32,
    /// Fraction of capacity below which requests are throttled
    pub throttle_threshold: f64,
    /// `None` for routes that are not idempotent
    pub idempotency: Option<KeyOrigin>,
}

impl RoutePolicy {
    pub fn validate(&self) -> TollgateResult<()> {
        self.bucket.validate()?;
        if self.cost > self.bucket.capacity {
            return Err(TollgateError::Configuration(format!(
                "Cost {} exceeds bucket capacity {}",
                self.cost, self.bucket.capacity
            )));
        }
        if !(self.throttle_threshold > 0.0 && self.throttle_threshold <= 1.0) {
            return Err(TollgateError::Configuration(format!(
                "Throttle threshold {} must be in (0, 1]",
                self.throttle_threshold
            )));
        }
        Ok(())
    }
}

/// Per-route override as written in the routes file. Unset fields inherit
/// from the default policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RouteRule {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(length(min = 1))]
    pub method: String,
    #[validate(range(min = 1))]
    pub capacity: Option<u32>,
    #[validate(range(min = 1))]
    pub refill_tokens: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub refill_period: Option<Duration>,
    #[validate(range(min = 1))]
    pub cost: Option<u32>,
    #[validate(range(min = 0.01, max = 1.0))]
    pub throttle_threshold: Option<f64>,
    #[serde(default)]
    pub idempotency: Option<KeyOrigin>,
}

impl RouteRule {
    /// Rule that inherits everything from the default policy.
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_string(),
            capacity: None,
            refill_tokens: None,
            refill_period: None,
            cost: None,
            throttle_threshold: None,
            idempotency: None,
        }
    }

    pub fn idempotent(mut self, origin: KeyOrigin) -> Self {
        self.idempotency = Some(origin);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RouteRules {
    #[validate(nested)]
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl RouteRules {
    pub fn from_json(raw: &str) -> TollgateResult<Self> {
        let rules: RouteRules = serde_json::from_str(raw)
            .map_err(|e| TollgateError::Configuration(format!("Invalid routes file: {}", e)))?;
        rules
            .validate()
            .map_err(|e| TollgateError::Configuration(format!("Invalid route rule: {}", e)))?;
        Ok(rules)
    }

    pub fn load(path: &Path) -> TollgateResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TollgateError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }
}

/// Route policy table, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RoutePolicies {
    default_policy: RoutePolicy,
    routes: HashMap<(String, String), RoutePolicy>,
}

impl RoutePolicies {
    pub fn new(default_policy: RoutePolicy) -> TollgateResult<Self> {
        default_policy.validate()?;
        Ok(Self {
            default_policy,
            routes: HashMap::new(),
        })
    }

    /// Resolve every rule against the default and validate the result.
    pub fn from_rules(default_policy: RoutePolicy, rules: &RouteRules) -> TollgateResult<Self> {
        let mut policies = Self::new(default_policy)?;
        for rule in &rules.routes {
            let resolved = policies.resolve_rule(rule);
            policies.insert(&rule.path, &rule.method, resolved)?;
        }
        Ok(policies)
    }

    fn resolve_rule(&self, rule: &RouteRule) -> RoutePolicy {
        let base = &self.default_policy;
        RoutePolicy {
            bucket: BucketSpec {
                capacity: rule.capacity.unwrap_or(base.bucket.capacity),
                refill_tokens: rule.refill_tokens.unwrap_or(base.bucket.refill_tokens),
                refill_period: rule.refill_period.unwrap_or(base.bucket.refill_period),
            },
            cost: rule.cost.unwrap_or(base.cost),
            throttle_threshold: rule.throttle_threshold.unwrap_or(base.throttle_threshold),
            idempotency: rule.idempotency.or(base.idempotency),
        }
    }

    /// Add or replace the policy for a route.
    pub fn insert(&mut self, path: &str, method: &str, policy: RoutePolicy) -> TollgateResult<()> {
        policy.validate().map_err(|e| match e {
            TollgateError::Configuration(msg) => {
                TollgateError::Configuration(format!("{} {}: {}", method, path, msg))
            }
            other => other,
        })?;
        self.routes
            .insert((normalize_endpoint(path), normalize_method(method)), policy);
        Ok(())
    }

    /// Policy for a request, falling back to the default.
    pub fn resolve(&self, path: &str, method: &str) -> &RoutePolicy {
        self.routes
            .get(&(normalize_endpoint(path), normalize_method(method)))
            .unwrap_or(&self.default_policy)
    }

    pub fn default_policy(&self) -> &RoutePolicy {
        &self.default_policy
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
