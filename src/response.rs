use serde::Serialize;

use crate::idempotency::IdempotencyValue;

#[derive(Debug, Serialize)]
pub struct KeyIssuedResponse {
    pub key: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct KeyStatusResponse {
    pub key: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl KeyStatusResponse {
    pub fn new(key: String, entry: IdempotencyValue) -> Self {
        match entry {
            IdempotencyValue::Pending => Self {
                key,
                state: "pending",
                value: None,
            },
            IdempotencyValue::Resolved(value) => Self {
                key,
                state: "resolved",
                value: Some(value),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatusResponse {
    pub bucket: String,
    pub limit: u64,
    pub remaining: u64,
    pub throttle_threshold: f64,
    /// The next request would be admitted inside the throttle zone
    pub throttled: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub store: String,
}

impl ReadinessResponse {
    pub fn ready(store: &str) -> Self {
        Self {
            status: "ready",
            store: store.to_string(),
        }
    }

    pub fn not_ready(store: &str) -> Self {
        Self {
            status: "not_ready",
            store: store.to_string(),
        }
    }
}
