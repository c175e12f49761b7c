use clap::Parser;
use humantime_serde::re::humantime::parse_duration;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{TollgateError, TollgateResult};
use crate::idempotency::DEFAULT_IDEMPOTENCY_TTL;
use crate::lock::DEFAULT_LOCK_TTL;
use crate::rate_limit_config::{KeyOrigin, RoutePolicies, RoutePolicy, RouteRule, RouteRules};
use crate::store::DEFAULT_SWEEP_INTERVAL;
use crate::throttler::{LimiterFailurePolicy, DEFAULT_MAX_THROTTLE_DELAY, DEFAULT_THROTTLE_THRESHOLD};
use crate::token_bucket::BucketSpec;

#[derive(Debug, Clone, Parser)]
#[command(name = "tollgate", version, about = "Idempotency and rate limiting gateway")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty runs against an in-process store
    #[arg(long, env = "REDIS_URL", default_value = "")]
    pub redis_url: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Lifetime of idempotency entries
    #[arg(long, env = "IDEMPOTENCY_TTL", default_value = "24h", value_parser = parse_duration)]
    pub idempotency_ttl: Duration,

    /// Upper bound on how long an idempotency lock may be held
    #[arg(long, env = "LOCK_TTL", default_value = "30s", value_parser = parse_duration)]
    pub lock_ttl: Duration,

    /// Cap on the soft delay applied in the throttle zone
    #[arg(long, env = "MAX_THROTTLE_DELAY", default_value = "1s", value_parser = parse_duration)]
    pub max_throttle_delay: Duration,

    #[arg(long, env = "THROTTLE_THRESHOLD", default_value_t = DEFAULT_THROTTLE_THRESHOLD)]
    pub throttle_threshold: f64,

    #[arg(long, env = "DEFAULT_BUCKET_CAPACITY", default_value_t = 200)]
    pub default_bucket_capacity: u32,

    #[arg(long, env = "DEFAULT_REFILL_TOKENS", default_value_t = 200)]
    pub default_refill_tokens: u32,

    #[arg(long, env = "DEFAULT_REFILL_PERIOD", default_value = "60s", value_parser = parse_duration)]
    pub default_refill_period: Duration,

    /// Behaviour when the rate limit store is unreachable: open or closed
    #[arg(long, env = "LIMITER_FAILURE_POLICY", default_value = "closed")]
    pub limiter_failure_policy: LimiterFailurePolicy,

    /// JSON file with per-route overrides
    #[arg(long, env = "ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,

    /// Key clients by X-Forwarded-For / X-Real-IP. Only enable behind a
    /// proxy that overwrites those headers.
    #[arg(long, env = "TRUST_FORWARDED_HEADERS")]
    pub trust_forwarded_headers: bool,

    /// How often the in-process store sweeps expired entries
    #[arg(long, env = "STORE_SWEEP_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub store_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: String::new(),
            log_level: "info".to_string(),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            max_throttle_delay: DEFAULT_MAX_THROTTLE_DELAY,
            throttle_threshold: DEFAULT_THROTTLE_THRESHOLD,
            default_bucket_capacity: 200,
            default_refill_tokens: 200,
            default_refill_period: Duration::from_secs(60),
            limiter_failure_policy: LimiterFailurePolicy::Closed,
            routes_file: None,
            trust_forwarded_headers: false,
            store_sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from command line and environment variables
    pub fn from_env() -> Self {
        Config::parse()
    }

    /// Whether a shared Redis store is configured.
    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }

    /// Policy applied to routes without an override.
    pub fn default_policy(&self) -> RoutePolicy {
        RoutePolicy {
            bucket: BucketSpec::new(
                self.default_bucket_capacity,
                self.default_refill_tokens,
                self.default_refill_period,
            ),
            cost: 1,
            throttle_threshold: self.throttle_threshold,
            idempotency: None,
        }
    }

    /// Resolve the route table from the defaults, the built-in payment route
    /// and the optional routes file. File rules replace built-in ones.
    pub fn route_policies(&self) -> TollgateResult<RoutePolicies> {
        let mut rules = RouteRules {
            routes: vec![RouteRule::new("/api/payments", "POST").idempotent(KeyOrigin::Server)],
        };
        if let Some(path) = &self.routes_file {
            rules.routes.extend(RouteRules::load(path)?.routes);
        }
        RoutePolicies::from_rules(self.default_policy(), &rules).map_err(|e| match e {
            TollgateError::Configuration(_) => e,
            other => TollgateError::Configuration(other.to_string()),
        })
    }
}
