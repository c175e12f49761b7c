//! Store key derivation for rate limiting and idempotency.

use axum::http::HeaderMap;
use regex::Regex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::LazyLock;

static UNSAFE_SEGMENT_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid segment regex"));

/// Store key of one token bucket: one per (client, endpoint, method).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(client: &str, path: &str, method: &str) -> Self {
        Self(format!(
            "rate_limit:{}:{}:{}",
            sanitize_segment(client),
            normalize_endpoint(path),
            normalize_method(method)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key of an idempotency value entry.
pub fn idempotency_key(key: &str) -> String {
    format!("idempotency:{}", key)
}

/// Store key of the lock guarding an idempotency key. Namespaced apart from
/// the value entry so the two can never collide.
pub fn lock_key(key: &str) -> String {
    format!("idempotency_lock:{}", key)
}

/// Strip path separators and replace anything outside `[A-Za-z0-9._-]`, so
/// the path is safe as a single `:`-delimited key segment.
pub fn normalize_endpoint(path: &str) -> String {
    sanitize_segment(&path.replace('/', ""))
}

pub fn normalize_method(method: &str) -> String {
    sanitize_segment(&method.to_ascii_uppercase())
}

fn sanitize_segment(segment: &str) -> String {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return "_".to_string();
    }
    UNSAFE_SEGMENT_CHARS.replace_all(trimmed, "_").into_owned()
}

/// Client network identity. The socket peer address is authoritative;
/// `X-Forwarded-For` (first hop) and `X-Real-IP` are only honoured when the
/// service sits behind a proxy that overwrites them.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> String {
    if trust_forwarded {
        if let Some(forwarded) = forwarded_client(headers) {
            return forwarded;
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return Some(first_ip.to_string());
                }
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|real_ip| real_ip.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}
