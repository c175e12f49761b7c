use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::error::{TollgateError, TollgateResult};
use crate::orchestrator::Guarded;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub total_requests: u64,
    /// Handler actually executed
    pub executed_requests: u64,
    pub throttled_requests: u64,
    pub rate_limited_requests: u64,
    pub replayed_requests: u64,
    pub conflicts: u64,
    pub failed_requests: u64,
    /// Admitted without a rate limit decision because the store was down
    pub degraded_requests: u64,
    pub last_reset: u64,
}

impl Default for RouteMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            executed_requests: 0,
            throttled_requests: 0,
            rate_limited_requests: 0,
            replayed_requests: 0,
            conflicts: 0,
            failed_requests: 0,
            degraded_requests: 0,
            last_reset: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// How a guarded request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Executed { throttled: bool, degraded: bool },
    Replayed { throttled: bool, degraded: bool },
    RateLimited,
    Conflict,
    Failed,
}

impl RequestOutcome {
    pub fn of<T>(result: &TollgateResult<Guarded<T>>) -> Self {
        match result {
            Ok(guarded) if guarded.replayed => RequestOutcome::Replayed {
                throttled: guarded.admission.throttled,
                degraded: guarded.admission.degraded,
            },
            Ok(guarded) => RequestOutcome::Executed {
                throttled: guarded.admission.throttled,
                degraded: guarded.admission.degraded,
            },
            Err(TollgateError::RateLimited { .. }) => RequestOutcome::RateLimited,
            Err(TollgateError::Conflict(_)) => RequestOutcome::Conflict,
            Err(_) => RequestOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    route_metrics: Arc<RwLock<HashMap<String, RouteMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_request(&self, route: &str, outcome: RequestOutcome) {
        let mut metrics = self.route_metrics.write().await;
        let route_metrics = metrics.entry(route.to_string()).or_default();

        route_metrics.total_requests += 1;
        match outcome {
            RequestOutcome::Executed { throttled, degraded } => {
                route_metrics.executed_requests += 1;
                route_metrics.throttled_requests += u64::from(throttled);
                route_metrics.degraded_requests += u64::from(degraded);
            }
            RequestOutcome::Replayed { throttled, degraded } => {
                route_metrics.replayed_requests += 1;
                route_metrics.throttled_requests += u64::from(throttled);
                route_metrics.degraded_requests += u64::from(degraded);
            }
            RequestOutcome::RateLimited => route_metrics.rate_limited_requests += 1,
            RequestOutcome::Conflict => route_metrics.conflicts += 1,
            RequestOutcome::Failed => route_metrics.failed_requests += 1,
        }
    }

    pub async fn get_route_metrics(&self, route: &str) -> Option<RouteMetrics> {
        let metrics = self.route_metrics.read().await;
        metrics.get(route).cloned()
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, RouteMetrics> {
        let metrics = self.route_metrics.read().await;
        metrics.clone()
    }

    pub async fn get_global_metrics(&self) -> RouteMetrics {
        let metrics = self.route_metrics.read().await;
        let mut global = RouteMetrics::default();

        for route_metrics in metrics.values() {
            global.total_requests += route_metrics.total_requests;
            global.executed_requests += route_metrics.executed_requests;
            global.throttled_requests += route_metrics.throttled_requests;
            global.rate_limited_requests += route_metrics.rate_limited_requests;
            global.replayed_requests += route_metrics.replayed_requests;
            global.conflicts += route_metrics.conflicts;
            global.failed_requests += route_metrics.failed_requests;
            global.degraded_requests += route_metrics.degraded_requests;
        }

        global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttler::Admission;
    use std::time::Duration;

    #[tokio::test]
    async fn test_outcomes_are_counted_per_route() {
        let metrics = MetricsCollector::new();
        let route = "POST /api/payments";

        metrics
            .record_request(route, RequestOutcome::Executed { throttled: false, degraded: false })
            .await;
        metrics
            .record_request(route, RequestOutcome::Replayed { throttled: true, degraded: false })
            .await;
        metrics.record_request(route, RequestOutcome::RateLimited).await;
        metrics.record_request("GET /health", RequestOutcome::Conflict).await;

        let payments = metrics.get_route_metrics(route).await.unwrap();
        assert_eq!(payments.total_requests, 3);
        assert_eq!(payments.executed_requests, 1);
        assert_eq!(payments.replayed_requests, 1);
        assert_eq!(payments.throttled_requests, 1);
        assert_eq!(payments.rate_limited_requests, 1);
        assert_eq!(payments.degraded_requests, 0);

        let global = metrics.get_global_metrics().await;
        assert_eq!(global.total_requests, 4);
        assert_eq!(global.conflicts, 1);
    }

    #[test]
    fn test_outcome_from_error() {
        let result: TollgateResult<Guarded<()>> = Err(TollgateError::Conflict("k".into()));
        assert_eq!(RequestOutcome::of(&result), RequestOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_degraded_admissions_are_counted() {
        let metrics = MetricsCollector::new();
        let admission = Admission {
            limit: 10,
            remaining: 10,
            throttled: false,
            delayed: Duration::ZERO,
            degraded: true,
        };
        let result: TollgateResult<Guarded<()>> = Ok(Guarded {
            value: (),
            replayed: false,
            admission,
        });

        let outcome = RequestOutcome::of(&result);
        assert_eq!(
            outcome,
            RequestOutcome::Executed {
                throttled: false,
                degraded: true
            }
        );

        metrics.record_request("POST /api/payments", outcome).await;
        let global = metrics.get_global_metrics().await;
        assert_eq!(global.degraded_requests, 1);
        assert_eq!(global.executed_requests, 1);
    }
}
