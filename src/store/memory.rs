//! In-process store for single-instance deployments and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::SharedStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{TollgateError, TollgateResult};
use crate::token_bucket::{BucketSpec, Consumption, TokenBucket};

/// Default spacing between full sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum Slot {
    Text(String),
    Bucket(TokenBucket),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, Entry>,
    next_sweep: Instant,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        before - self.map.len()
    }
}

/// Mutex-guarded map with per-entry expiry read from an injected clock.
///
/// Each trait method holds the lock for its whole read-modify-write, which
/// gives the same atomicity the Redis scripts give across processes.
/// Expired entries are dropped lazily on access, and the whole map is swept
/// at most once per sweep interval so keys that are never touched again do
/// not accumulate.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<Entries>>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now() + DEFAULT_SWEEP_INTERVAL;
        Self {
            entries: Arc::new(Mutex::new(Entries {
                map: HashMap::new(),
                next_sweep,
            })),
            clock,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        if let Ok(mut entries) = self.entries.lock() {
            entries.next_sweep = self.clock.now() + interval;
        }
        self
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock_entries()
            .map(|entries| entries.map.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> TollgateResult<usize> {
        let now = self.clock.now();
        let mut entries = self.lock_entries()?;
        let purged = entries.purge_expired(now);
        entries.next_sweep = now + self.sweep_interval;
        Ok(purged)
    }

    fn lock_entries(&self) -> TollgateResult<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| TollgateError::Internal("Failed to acquire store lock".into()))
    }

    /// Lock the map and drop `key` if it has expired. Sweeps the whole map
    /// when the sweep interval has elapsed.
    fn live_entries(&self, key: &str) -> TollgateResult<(MutexGuard<'_, Entries>, Instant)> {
        let now = self.clock.now();
        let mut entries = self.lock_entries()?;
        if now >= entries.next_sweep {
            let purged = entries.purge_expired(now);
            entries.next_sweep = now + self.sweep_interval;
            if purged > 0 {
                tracing::debug!(purged, remaining = entries.map.len(), "Swept expired store entries");
            }
        } else if entries.map.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.map.remove(key);
        }
        Ok((entries, now))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn text(entry: Option<&Entry>) -> Option<&str> {
    match entry {
        Some(Entry {
            slot: Slot::Text(value),
            ..
        }) => Some(value.as_str()),
        _ => None,
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>> {
        let (entries, _) = self.live_entries(key)?;
        Ok(text(entries.map.get(key)).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()> {
        let (mut entries, now) = self.live_entries(key)?;
        entries.map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<bool> {
        let (mut entries, now) = self.live_entries(key)?;
        if entries.map.contains_key(key) {
            return Ok(false);
        }
        entries.map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> TollgateResult<bool> {
        let (mut entries, now) = self.live_entries(key)?;
        if text(entries.map.get(key)) != Some(expected) {
            return Ok(false);
        }
        entries.map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> TollgateResult<bool> {
        let (mut entries, _) = self.live_entries(key)?;
        Ok(entries.map.remove(key).is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> TollgateResult<bool> {
        let (mut entries, _) = self.live_entries(key)?;
        if text(entries.map.get(key)) != Some(expected) {
            return Ok(false);
        }
        entries.map.remove(key);
        Ok(true)
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: &BucketSpec,
        cost: u32,
    ) -> TollgateResult<Consumption> {
        let (mut entries, now) = self.live_entries(key)?;

        let mut bucket = match entries.map.remove(key) {
            Some(Entry {
                slot: Slot::Bucket(bucket),
                ..
            }) => bucket,
            _ => TokenBucket::full(spec, now),
        };

        let outcome = bucket.take(spec, cost, now);
        entries.map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bucket(bucket),
                expires_at: now + spec.idle_ttl(),
            },
        );

        Ok(outcome)
    }

    async fn ping(&self) -> TollgateResult<String> {
        Ok("PONG".to_string())
    }
}
