// ABOUTME: Keyed pool of reusable client handles with keepalive expiry.
// ABOUTME: Lends handles exclusively and reclaims them, discarding stale or broken ones.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::binding::ClientHandle;
use crate::config::{ConnectionConfig, PoolConfig};
use crate::endpoint::{Endpoint, ServiceName};
use crate::error::{PoolExhaustionError, RpcError};
use crate::opener::ConnectionOpener;

/// Identity of one idle list: an endpoint plus the multiplexed service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub endpoint: Endpoint,
    pub service: Option<ServiceName>,
}

impl PoolKey {
    pub fn new(endpoint: &Endpoint, service: Option<&ServiceName>) -> Self {
        Self {
            endpoint: endpoint.clone(),
            service: service.cloned(),
        }
    }
}

/// An idle handle owned by the pool.
#[derive(Debug)]
pub struct PoolEntry {
    pub handle: ClientHandle,
    pub last_used_at: Instant,
    pub endpoint: Endpoint,
    pub service: Option<ServiceName>,
}

impl PoolEntry {
    fn is_expired(&self, now: Instant, keepalive: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_used_at) > keepalive
    }
}

/// Counters describing pool activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles created through the opener.
    pub opened: u64,
    /// Borrows served from an idle list.
    pub reused: u64,
    /// Healthy releases pushed back onto an idle list.
    pub returned: u64,
    /// Handles closed on release (unhealthy, already closed, or pool drained).
    pub discarded: u64,
    /// Idle handles closed because they outlived the keepalive.
    pub expired: u64,
    /// Handles currently idle across all keys.
    pub idle: usize,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
    expired: AtomicU64,
}

struct KeyedSlot {
    idle: Mutex<Vec<PoolEntry>>,
    permits: Option<Arc<Semaphore>>,
    consecutive_failures: AtomicU32,
}

impl KeyedSlot {
    fn new(max_outstanding: Option<usize>) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: max_outstanding.map(|n| Arc::new(Semaphore::new(n))),
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

struct PoolInner {
    opener: ConnectionOpener,
    config: PoolConfig,
    slots: Mutex<HashMap<PoolKey, Arc<KeyedSlot>>>,
    counters: Counters,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolInner {
    fn slot(&self, key: &PoolKey) -> Arc<KeyedSlot> {
        let mut slots = lock(&self.slots);
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyedSlot::new(self.config.max_outstanding)))
            .clone()
    }

    /// Forget keys with no idle handles, no borrow in progress and nothing
    /// checked out.
    fn prune_unused_slots(&self) {
        let mut slots = lock(&self.slots);
        slots.retain(|_, slot| !self.is_unused(slot));
    }

    fn is_unused(&self, slot: &Arc<KeyedSlot>) -> bool {
        let none_checked_out = match (&slot.permits, self.config.max_outstanding) {
            (Some(permits), Some(max)) => permits.available_permits() == max,
            _ => true,
        };
        Arc::strong_count(slot) == 1 && none_checked_out && lock(&slot.idle).is_empty()
    }

    /// Remove and return every expired entry of a slot.
    fn split_expired(&self, slot: &KeyedSlot, now: Instant) -> Vec<PoolEntry> {
        let keepalive = self.config.keepalive;
        let mut idle = lock(&slot.idle);
        let (expired, live): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|entry| entry.is_expired(now, keepalive));
        *idle = live;
        expired
    }

    /// Split off expired entries, then pop the freshest live one.
    fn take_idle(&self, slot: &KeyedSlot, now: Instant) -> (Option<PoolEntry>, Vec<PoolEntry>) {
        let expired = self.split_expired(slot, now);
        let reused = lock(&slot.idle).pop();
        (reused, expired)
    }

    fn discard_expired(&self, expired: Vec<PoolEntry>) -> usize {
        let count = expired.len();
        for mut entry in expired {
            tracing::debug!(
                handle = %entry.handle.id(),
                endpoint = %entry.endpoint,
                service = ?entry.service,
                "closing idle handle past keepalive"
            );
            entry.handle.close();
        }
        self.counters
            .expired
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn put_back(&self, key: &PoolKey, mut handle: ClientHandle, healthy: bool) {
        if !healthy || !handle.is_open() || self.closed.load(Ordering::Acquire) {
            tracing::debug!(
                handle = %handle.id(),
                endpoint = %key.endpoint,
                healthy,
                "discarding released handle"
            );
            handle.close();
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let slot = self.slot(key);
        lock(&slot.idle).push(PoolEntry {
            handle,
            last_used_at: Instant::now(),
            endpoint: key.endpoint.clone(),
            service: key.service.clone(),
        });
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool of client handles keyed by endpoint and service.
///
/// Cloning is cheap; clones share the same idle lists. Idle-list mutation
/// happens under a short per-key lock. Opening new handles (the slow path)
/// runs with no lock held.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(opener: ConnectionOpener, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                opener,
                config,
                slots: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pool over real TCP/TLS connections with default health checks.
    pub fn tcp(config: PoolConfig) -> Self {
        Self::new(ConnectionOpener::tcp(), config)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lend a handle for `(endpoint, service)`.
    ///
    /// Reuses the most recently returned idle handle that is within the
    /// keepalive, otherwise opens a new one. Expired idle handles found on
    /// the way are closed. Fails with [`RpcError::PoolClosed`] once the pool
    /// has been drained.
    pub async fn borrow(
        &self,
        endpoint: &Endpoint,
        service: Option<&ServiceName>,
        config: &ConnectionConfig,
    ) -> Result<PooledHandle, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::PoolClosed);
        }

        let key = PoolKey::new(endpoint, service);
        let slot = self.inner.slot(&key);
        let permit = self.acquire_permit(&key, &slot).await?;

        let (reused, expired) = self.inner.take_idle(&slot, Instant::now());
        self.inner.discard_expired(expired);

        if let Some(entry) = reused {
            self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                handle = %entry.handle.id(),
                endpoint = %endpoint,
                "reusing idle handle"
            );
            return Ok(self.lend(entry.handle, key, permit));
        }

        match self.inner.opener.open(endpoint, service, config).await {
            Ok(handle) => {
                slot.consecutive_failures.store(0, Ordering::Relaxed);
                self.inner.counters.opened.fetch_add(1, Ordering::Relaxed);
                Ok(self.lend(handle, key, permit))
            }
            Err(e) => {
                let failures = slot.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures > 1 {
                    tracing::error!(
                        endpoint = %endpoint,
                        service = ?service,
                        attempts = e.attempts,
                        consecutive_failures = failures,
                        "backend still unreachable"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Return a borrowed handle.
    ///
    /// Healthy handles go back on the idle list with a fresh timestamp.
    /// Unhealthy ones are closed and never handed out again.
    pub fn release(&self, handle: PooledHandle, healthy: bool) {
        handle.release(healthy);
    }

    /// Close every idle handle past the keepalive and forget keys left
    /// unused. Returns how many handles closed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let slots: Vec<Arc<KeyedSlot>> = lock(&self.inner.slots).values().cloned().collect();
        let mut closed = 0;
        for slot in slots {
            let expired = self.inner.split_expired(&slot, now);
            closed += self.inner.discard_expired(expired);
        }
        self.inner.prune_unused_slots();
        closed
    }

    /// Idle handles currently held for one key.
    pub fn idle_count(&self, endpoint: &Endpoint, service: Option<&ServiceName>) -> usize {
        let key = PoolKey::new(endpoint, service);
        let slot = lock(&self.inner.slots).get(&key).cloned();
        slot.map(|s| lock(&s.idle).len()).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        let idle = lock(&self.inner.slots)
            .values()
            .map(|slot| lock(&slot.idle).len())
            .sum();
        PoolStats {
            opened: c.opened.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            returned: c.returned.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            idle,
        }
    }

    /// Close all idle handles and stop pooling. Handles released afterwards
    /// are closed instead of kept and further borrows fail. Returns how many
    /// idle handles closed.
    pub fn drain(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        let slots: Vec<Arc<KeyedSlot>> = lock(&self.inner.slots).drain().map(|(_, s)| s).collect();

        let mut closed = 0;
        for slot in slots {
            let entries: Vec<PoolEntry> = lock(&slot.idle).drain(..).collect();
            for mut entry in entries {
                entry.handle.close();
                closed += 1;
            }
        }
        tracing::info!(closed, "connection pool drained");
        closed
    }

    async fn acquire_permit(
        &self,
        key: &PoolKey,
        slot: &KeyedSlot,
    ) -> Result<Option<OwnedSemaphorePermit>, RpcError> {
        let Some(permits) = &slot.permits else {
            return Ok(None);
        };

        let waited = self.inner.config.acquire_timeout;
        match tokio::time::timeout(waited, permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Some(permit)),
            // The semaphore is never closed; treat closure like a timeout.
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    endpoint = %key.endpoint,
                    service = ?key.service,
                    ?waited,
                    "no pooled handle available"
                );
                Err(PoolExhaustionError {
                    endpoint: key.endpoint.clone(),
                    service: key.service.clone(),
                    waited,
                }
                .into())
            }
        }
    }

    fn lend(
        &self,
        handle: ClientHandle,
        key: PoolKey,
        permit: Option<OwnedSemaphorePermit>,
    ) -> PooledHandle {
        PooledHandle {
            handle,
            key,
            pool: self.inner.clone(),
            permit,
            released: false,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A handle checked out of the pool.
///
/// Derefs to [`ClientHandle`]. Releasing consumes it; dropping it without a
/// release (for example when the borrowing task is cancelled) discards the
/// handle as unhealthy.
pub struct PooledHandle {
    handle: ClientHandle,
    key: PoolKey,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl PooledHandle {
    /// Hand the handle back to its pool.
    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let handle = std::mem::replace(&mut self.handle, ClientHandle::detached());
        self.pool.put_back(&self.key, handle, healthy);
        self.permit.take();
    }
}

impl Deref for PooledHandle {
    type Target = ClientHandle;

    fn deref(&self) -> &ClientHandle {
        &self.handle
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut ClientHandle {
        &mut self.handle
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                handle = %self.handle.id(),
                endpoint = %self.key.endpoint,
                service = ?self.key.service,
                "pooled handle dropped without release, discarding"
            );
            self.finish(false);
        }
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("handle", &self.handle)
            .field("key", &self.key)
            .finish()
    }
}
