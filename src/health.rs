use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::store::SharedStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// `redis` or `memory`
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn SharedStore>,
    backend: &'static str,
    started: Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn SharedStore>, backend: &'static str) -> Self {
        Self {
            store,
            backend,
            started: Instant::now(),
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let store_status = self.check_store().await;

        // Without the store nothing can be admitted or deduplicated
        let overall_status = if store_status.is_healthy() {
            "healthy"
        } else {
            "unhealthy"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            dependencies: DependencyStatus {
                store: store_status,
            },
        }
    }

    pub async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => ServiceStatus {
                backend: self.backend.to_string(),
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => {
                tracing::warn!(backend = self.backend, error = %e, "Store health check failed");
                ServiceStatus {
                    backend: self.backend.to_string(),
                    status: "unavailable".to_string(),
                    response_time_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
