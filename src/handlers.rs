use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use validator::Validate;

use crate::config::Config;
use crate::error::{ErrorResponse, TollgateError, TollgateResult};
use crate::health::HealthChecker;
use crate::idempotency::IdempotencyStore;
use crate::key_generator::{client_identity, BucketKey};
use crate::lock::LockManager;
use crate::metrics::MetricsCollector;
use crate::orchestrator::RequestOrchestrator;
use crate::rate_limit_config::RoutePolicies;
use crate::rate_limiter::RateLimiter;
use crate::response::{
    KeyIssuedResponse, KeyStatusResponse, RateLimitStatusResponse, ReadinessResponse,
};
use crate::store::SharedStore;
use crate::throttler::{in_throttle_zone, ThrottleController};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RequestOrchestrator,
    pub policies: Arc<RoutePolicies>,
    pub metrics: MetricsCollector,
    pub health: HealthChecker,
    /// Key clients by forwarding headers instead of the socket peer
    pub trust_forwarded_headers: bool,
}

impl AppState {
    /// Wire every component over one shared store.
    pub fn new(
        config: &Config,
        store: Arc<dyn SharedStore>,
        backend: &'static str,
    ) -> TollgateResult<Self> {
        let policies = config.route_policies()?;
        let throttle = ThrottleController::new(
            RateLimiter::new(Arc::clone(&store)),
            config.max_throttle_delay,
            config.limiter_failure_policy,
        );
        let orchestrator = RequestOrchestrator::new(
            throttle,
            IdempotencyStore::new(Arc::clone(&store), config.idempotency_ttl),
            LockManager::new(Arc::clone(&store)),
            config.lock_ttl,
        );

        Ok(Self {
            orchestrator,
            policies: Arc::new(policies),
            metrics: MetricsCollector::new(),
            health: HealthChecker::new(store, backend),
            trust_forwarded_headers: config.trust_forwarded_headers,
        })
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        self.orchestrator.idempotency()
    }

    pub fn limiter(&self) -> &RateLimiter {
        self.orchestrator.throttle().limiter()
    }
}

/// Issue a server-generated idempotency key
pub async fn issue_key(State(state): State<AppState>) -> TollgateResult<impl IntoResponse> {
    let idempotency = state.idempotency();
    let key = idempotency.generate().await?;

    Ok((
        StatusCode::CREATED,
        Json(KeyIssuedResponse {
            key,
            expires_in_secs: idempotency.ttl().as_secs(),
        }),
    ))
}

/// Status of an idempotency key: 200 resolved, 202 pending
pub async fn key_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> TollgateResult<impl IntoResponse> {
    let entry = state.idempotency().lookup(&key).await?;
    let status = if entry.is_resolved() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((status, Json(KeyStatusResponse::new(key, entry))))
}

/// Evict an idempotency key
pub async fn evict_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> TollgateResult<StatusCode> {
    if state.idempotency().evict(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TollgateError::UnknownKey(key))
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitQuery {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Remaining capacity of the caller's bucket for a route, without consuming
pub async fn rate_limit_status(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<RateLimitQuery>,
) -> TollgateResult<Json<RateLimitStatusResponse>> {
    let client = client_identity(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.trust_forwarded_headers,
    );
    let policy = state.policies.resolve(&query.path, &query.method);
    let bucket = BucketKey::new(&client, &query.path, &query.method);

    let remaining = state.limiter().remaining(&bucket, &policy.bucket).await?;
    let after_next = remaining.saturating_sub(policy.cost as u64);

    Ok(Json(RateLimitStatusResponse {
        bucket: bucket.to_string(),
        limit: policy.bucket.capacity as u64,
        remaining,
        throttle_threshold: policy.throttle_threshold,
        throttled: in_throttle_zone(after_next, policy.bucket.capacity, policy.throttle_threshold),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct PaymentRequest {
    #[validate(range(min = 1))]
    pub amount_cents: u64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub payment_id: String,
    pub amount_cents: u64,
    pub currency: String,
    pub reference: String,
    pub status: String,
    pub created_at: u64,
}

/// Sample protected operation. Deduplication and rate limiting come from
/// the guard middleware in front of it.
pub async fn create_payment(Json(payload): Json<PaymentRequest>) -> Response {
    if let Err(errors) = payload.validate() {
        let message = errors.to_string();
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse::new(
                "validation_error",
                &message,
                StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            )),
        )
            .into_response();
    }

    let payment = PaymentResponse {
        payment_id: uuid::Uuid::new_v4().to_string(),
        amount_cents: payload.amount_cents,
        currency: payload.currency.to_ascii_uppercase(),
        reference: payload.reference,
        status: "accepted".to_string(),
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };
    tracing::info!(payment_id = %payment.payment_id, amount_cents = payment.amount_cents, "Payment accepted");

    (StatusCode::CREATED, Json(payment)).into_response()
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.check_health().await;
    let status = if health.dependencies.store.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(health))
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.health.check_store().await;

    if store.is_healthy() {
        (StatusCode::OK, Json(ReadinessResponse::ready(&store.backend)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse::not_ready(&store.backend)),
        )
    }
}

/// Per-route and global request counters
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "global": state.metrics.get_global_metrics().await,
        "routes": state.metrics.get_all_metrics().await,
    }))
}
