use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::TollgateResult;
use crate::handlers::{
    create_payment, evict_key, health_check, issue_key, key_status, metrics, rate_limit_status,
    readiness_check, AppState,
};
use crate::middleware::guard_middleware;
use crate::store::{MemoryStore, RedisStore, SharedStore};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the router. Guarded routes go through rate limiting, throttling
/// and, where their policy says so, idempotency.
pub fn create_app(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/api/payments", post(create_payment))
        .route("/api/idempotency-keys", post(issue_key))
        .route("/api/idempotency-keys/:key", get(key_status).delete(evict_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guard_middleware,
        ));

    Router::new()
        .merge(guarded)
        .route("/api/rate-limit", get(rate_limit_status))
        // Health, readiness and metrics endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub async fn new(config: Config) -> TollgateResult<Self> {
        ConfigValidator::validate_config(&config)?;

        let (store, backend): (Arc<dyn SharedStore>, &'static str) = if config.uses_redis() {
            let store = RedisStore::connect(&config.redis_url).await?;
            tracing::info!("Connected to Redis store");
            (Arc::new(store), "redis")
        } else {
            tracing::warn!("REDIS_URL is empty, using the in-process store (single instance only)");
            (
                Arc::new(MemoryStore::new().with_sweep_interval(config.store_sweep_interval)),
                "memory",
            )
        };

        let state = AppState::new(&config, store, backend)?;
        tracing::info!(
            routes = state.policies.len(),
            failure_policy = %config.limiter_failure_policy,
            "Route policies resolved"
        );

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Tollgate server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
