use regex::Regex;
use std::sync::LazyLock;

use crate::error::{TollgateError, TollgateResult};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

// Printable ASCII, no whitespace
static IDEMPOTENCY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\x21-\x7E]+$").expect("valid idempotency key regex"));

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates a client-presented idempotency key.
    pub fn validate_idempotency_key(key: &str) -> TollgateResult<()> {
        if key.is_empty() {
            return Err(TollgateError::MissingKey);
        }

        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(TollgateError::InvalidKey(format!(
                "key must be at most {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        if !IDEMPOTENCY_KEY.is_match(key) {
            return Err(TollgateError::InvalidKey(
                "key may only contain printable ASCII characters without whitespace".to_string(),
            ));
        }

        Ok(())
    }
}
