//! TLS session resumption cache
//!
//! A bounded, time-limited map from conversation identity to opaque
//! resumption material. Expiry is coarse: rather than tracking a deadline
//! per entry, the whole cache is cleared once its age passes the configured
//! timeout. A per-entry age check on lookup covers entries that are stale
//! but survived the last flush.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Hard ceiling on cache key length, matching the EAP-TLS session id limit.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque TLS resumption material, produced and consumed by the TLS engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMaterial(pub Vec<u8>);

struct Entry {
    material: SessionMaterial,
    created_at: Instant,
}

struct CacheInner {
    entries: HashMap<Vec<u8>, Entry>,
    /// Insertion order; front is oldest. Keys are re-pushed on overwrite.
    order: VecDeque<Vec<u8>>,
    last_flushed: Instant,
}

/// Bounded TLS session cache with coarse whole-cache expiry.
///
/// Shared across conversations behind a mutex; every operation is a short
/// critical section.
pub struct SessionCache {
    enabled: bool,
    capacity: usize,
    timeout: Duration,
    inner: Mutex<CacheInner>,
}

impl SessionCache {
    pub fn new(enabled: bool, capacity: usize, timeout: Duration) -> Self {
        SessionCache {
            enabled,
            capacity,
            timeout,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                last_flushed: Instant::now(),
            }),
        }
    }

    /// Store resumption material under `key`, silently overwriting any
    /// previous entry. Oversize keys are dropped with a warning; a full
    /// cache evicts its oldest entry first.
    pub fn store(&self, key: &[u8], material: SessionMaterial) {
        self.store_at(key, material, Instant::now());
    }

    /// Fetch resumption material for `key`, if present and fresh.
    pub fn lookup(&self, key: &[u8]) -> Option<SessionMaterial> {
        self.lookup_at(key, Instant::now())
    }

    fn store_at(&self, key: &[u8], material: SessionMaterial, now: Instant) {
        if !self.enabled {
            return;
        }
        if key.len() > MAX_SESSION_ID_LEN {
            warn!(len = key.len(), "session cache key too long, not caching");
            return;
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::flush_if_stale(&mut inner, self.timeout, now);

        if inner.entries.contains_key(key) {
            inner.order.retain(|k| k.as_slice() != key);
        } else {
            while inner.entries.len() >= self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        debug!("session cache full, evicting oldest entry");
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        inner.order.push_back(key.to_vec());
        inner.entries.insert(
            key.to_vec(),
            Entry {
                material,
                created_at: now,
            },
        );
    }

    fn lookup_at(&self, key: &[u8], now: Instant) -> Option<SessionMaterial> {
        if !self.enabled {
            return None;
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::flush_if_stale(&mut inner, self.timeout, now);

        let entry = inner.entries.get(key)?;
        if now.duration_since(entry.created_at) > self.timeout {
            // Stale entry that survived the last coarse flush
            return None;
        }
        Some(entry.material.clone())
    }

    fn flush_if_stale(inner: &mut CacheInner, timeout: Duration, now: Instant) {
        if now.duration_since(inner.last_flushed) > timeout {
            let dropped = inner.entries.len();
            if dropped > 0 {
                debug!(dropped, "flushing session cache");
            }
            inner.entries.clear();
            inner.order.clear();
            inner.last_flushed = now;
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
