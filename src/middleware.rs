//! axum middleware that puts the orchestrator in front of a route.
//!
//! The downstream handler is the opaque unit of work: its response is
//! captured as a [`StoredResponse`], cached under the idempotency key and
//! replayed verbatim to duplicates. Non-success responses are passed
//! through without being cached.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{TollgateError, TollgateResult};
use crate::handlers::AppState;
use crate::key_generator::{client_identity, BucketKey};
use crate::metrics::RequestOutcome;
use crate::orchestrator::Invocation;
use crate::throttler::Admission;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_DEGRADED_HEADER: &str = "x-ratelimit-degraded";
pub const THROTTLED_HEADER: &str = "x-throttled";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";
pub const BODY_OMITTED_HEADER: &str = "idempotent-body-omitted";

/// Largest handler response body kept in the idempotency store. Larger
/// bodies are delivered to the first caller and replayed without a body.
pub const MAX_CACHED_BODY: usize = 2 * 1024 * 1024;

/// Largest handler response body buffered at all.
const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

/// Per-connection headers that must not be replayed.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// A handler response in cacheable form. Headers keep their order and
/// repeats; the body is raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "CachedResponse", try_from = "CachedResponse")]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// The body could not be kept; replays carry status and headers only
    pub body_omitted: bool,
}

/// Wire form of [`StoredResponse`] inside the idempotency store.
#[derive(Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    #[serde(default)]
    headers: Vec<(String, String)>,
    /// Base64 of the body bytes
    #[serde(default)]
    body: String,
    #[serde(default)]
    body_omitted: bool,
}

impl From<StoredResponse> for CachedResponse {
    fn from(response: StoredResponse) -> Self {
        let body_omitted = response.body_omitted || response.body.len() > MAX_CACHED_BODY;
        if body_omitted && !response.body_omitted {
            tracing::warn!(
                status = response.status,
                body_bytes = response.body.len(),
                "Handler response too large to cache, replays will omit the body"
            );
        }
        Self {
            status: response.status,
            headers: response.headers,
            body: if body_omitted {
                String::new()
            } else {
                STANDARD.encode(&response.body)
            },
            body_omitted,
        }
    }
}

impl TryFrom<CachedResponse> for StoredResponse {
    type Error = String;

    fn try_from(cached: CachedResponse) -> Result<Self, Self::Error> {
        let body = STANDARD
            .decode(cached.body.as_bytes())
            .map_err(|e| format!("invalid cached body: {}", e))?;
        Ok(Self {
            status: cached.status,
            headers: cached.headers,
            body: Bytes::from(body),
            body_omitted: cached.body_omitted,
        })
    }
}

impl StoredResponse {
    /// Buffer a handler response. Non-2xx responses become
    /// [`TollgateError::Handler`] so they reach the caller but are not
    /// cached. A 2xx response always captures: the handler has run, so the
    /// key must resolve even when the body cannot be read.
    pub async fn capture(response: Response) -> TollgateResult<Self> {
        let (parts, body) = response.into_parts();
        let status = parts.status.as_u16();
        let (body, body_omitted) = match to_bytes(body, MAX_BUFFERED_BODY).await {
            Ok(bytes) => (bytes, false),
            Err(e) => {
                tracing::warn!(status, error = %e, "Failed to buffer handler response body");
                (Bytes::new(), true)
            }
        };

        let stored = Self {
            status,
            headers: replayable_headers(&parts.headers),
            body,
            body_omitted,
        };

        if !parts.status.is_success() {
            return Err(TollgateError::Handler(stored));
        }
        Ok(stored)
    }
}

fn replayable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| match value.to_str() {
            Ok(value) => Some((name.as_str().to_string(), value.to_string())),
            Err(_) => {
                tracing::debug!(header = %name, "Dropping non-ASCII header from captured response");
                None
            }
        })
        .collect()
}

impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::debug!(header = %name, "Skipping invalid stored header"),
            }
        }
        if self.body_omitted {
            headers.remove(header::CONTENT_TYPE);
            headers.insert(BODY_OMITTED_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}

/// Rate limit, throttle and deduplicate the wrapped route.
pub async fn guard_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer, state.trust_forwarded_headers);
    // Undecodable bytes survive as U+FFFD and fail key validation
    let presented_key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

    let policy = state.policies.resolve(&path, &method);
    let bucket = BucketKey::new(&client, &path, &method);
    let route = format!("{} {}", method, path);

    tracing::debug!(
        route = %route,
        client = %client,
        idempotency_key = presented_key.as_deref().unwrap_or("-"),
        "Guarding request"
    );

    let invocation = Invocation {
        bucket: &bucket,
        policy,
        idempotency_key: presented_key.as_deref(),
    };
    let result = state
        .orchestrator
        .run(invocation, move || async move {
            StoredResponse::capture(next.run(request).await).await
        })
        .await;

    state
        .metrics
        .record_request(&route, RequestOutcome::of(&result))
        .await;

    match result {
        Ok(guarded) => {
            let mut response = guarded.value.into_response();
            apply_admission_headers(&mut response, &guarded.admission);
            if guarded.replayed {
                response
                    .headers_mut()
                    .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
            }
            response
        }
        Err(e) => {
            match &e {
                TollgateError::Handler(response) => tracing::debug!(
                    route = %route,
                    status = response.status,
                    "Handler returned an error response"
                ),
                other => tracing::warn!(route = %route, error = %other, "Request rejected"),
            }
            e.into_response()
        }
    }
}

fn apply_admission_headers(response: &mut Response, admission: &Admission) {
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(admission.limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(admission.remaining));
    headers.insert(
        THROTTLED_HEADER,
        HeaderValue::from_static(if admission.throttled { "true" } else { "false" }),
    );
    if admission.degraded {
        headers.insert(RATE_LIMIT_DEGRADED_HEADER, HeaderValue::from_static("true"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::AppendHeaders;
    use axum::Json;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_capture_success_response() {
        let response = (StatusCode::CREATED, Json(json!({"id": 1}))).into_response();
        let stored = StoredResponse::capture(response).await.unwrap();

        assert_eq!(stored.status, 201);
        assert!(stored
            .headers
            .contains(&("content-type".to_string(), "application/json".to_string())));
        assert_eq!(stored.body, Bytes::from_static(br#"{"id":1}"#));
        assert!(!stored.body_omitted);
    }

    #[tokio::test]
    async fn test_capture_error_response_is_not_cacheable() {
        let response = (StatusCode::UNPROCESSABLE_ENTITY, "declined").into_response();

        match StoredResponse::capture(response).await {
            Err(TollgateError::Handler(stored)) => {
                assert_eq!(stored.status, 422);
                assert_eq!(stored.body, Bytes::from_static(b"declined"));
            }
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_binary_body_survives_the_store() {
        let payload: Vec<u8> = vec![0xff, 0xfe, 0x00, 0x89, b'P', b'N', b'G'];
        let response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload.clone(),
        )
            .into_response();

        let stored = StoredResponse::capture(response).await.unwrap();
        let cached = serde_json::to_value(&stored).unwrap();
        let restored: StoredResponse = serde_json::from_value(cached).unwrap();
        assert_eq!(restored, stored);

        let replay = restored.into_response();
        assert_eq!(replay.headers()[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(body_bytes(replay).await.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_replay_keeps_location_and_repeated_headers() {
        let response = (
            StatusCode::CREATED,
            AppendHeaders([
                (header::LOCATION, "/api/payments/pay_123"),
                (header::SET_COOKIE, "a=1"),
                (header::SET_COOKIE, "b=2"),
                (header::CONNECTION, "keep-alive"),
            ]),
            "created",
        )
            .into_response();

        let stored = StoredResponse::capture(response).await.unwrap();
        assert!(stored.headers.iter().all(|(name, _)| name != "connection"));

        let restored: StoredResponse =
            serde_json::from_value(serde_json::to_value(&stored).unwrap()).unwrap();
        let replay = restored.into_response();

        assert_eq!(replay.status(), StatusCode::CREATED);
        assert_eq!(replay.headers()[header::LOCATION], "/api/payments/pay_123");
        let cookies: Vec<&str> = replay
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(replay.headers().get(header::CONNECTION).is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_cached_without_body() {
        let big = vec![b'x'; MAX_CACHED_BODY + 1];
        let response = (
            StatusCode::CREATED,
            [(header::LOCATION, "/exports/7")],
            big.clone(),
        )
            .into_response();

        let stored = StoredResponse::capture(response).await.unwrap();
        assert_eq!(stored.body.len(), big.len());
        assert!(!stored.body_omitted);

        let cached = serde_json::to_value(&stored).unwrap();
        assert_eq!(cached["body_omitted"], true);
        assert_eq!(cached["body"], "");

        let replay = serde_json::from_value::<StoredResponse>(cached)
            .unwrap()
            .into_response();
        assert_eq!(replay.status(), StatusCode::CREATED);
        assert_eq!(replay.headers()[header::LOCATION], "/exports/7");
        assert_eq!(replay.headers()[BODY_OMITTED_HEADER], "true");
        assert!(body_bytes(replay).await.is_empty());
    }

    #[test]
    fn test_degraded_admission_is_flagged() {
        let mut admission = Admission {
            limit: 10,
            remaining: 10,
            throttled: false,
            delayed: Duration::ZERO,
            degraded: false,
        };
        let mut response = StatusCode::OK.into_response();
        apply_admission_headers(&mut response, &admission);
        assert!(response.headers().get(RATE_LIMIT_DEGRADED_HEADER).is_none());

        admission.degraded = true;
        let mut response = StatusCode::OK.into_response();
        apply_admission_headers(&mut response, &admission);
        assert_eq!(response.headers()[RATE_LIMIT_DEGRADED_HEADER], "true");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "10");
    }
}
