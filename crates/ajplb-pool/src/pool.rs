use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::protocol::AJP_DEF_PACKET_SIZE;
use ajplb_common::RuntimeRegistry;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::endpoint::Endpoint;

/// Endpoint pool configuration.
///
/// # Fields
///
/// - `min`: endpoints kept even when idle
/// - `soft_max`: above this count idle endpoints are trimmed by [`ConnectionPool::maintain`]
/// - `hard_max`: endpoints that may exist at once; acquisition beyond it waits
/// - `idle_timeout`: idle endpoints older than this are evicted; `None` keeps them
/// - `acquire_timeout`: how long [`ConnectionPool::acquire`] waits for a free slot
/// - `packet_size`: message buffer capacity of each endpoint
///
/// # Default Configuration
///
/// - `min`: 0
/// - `soft_max` / `hard_max`: 32
/// - `idle_timeout`: none
/// - `acquire_timeout`: 200 ms
/// - `packet_size`: 8192
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min: usize,
    pub soft_max: usize,
    pub hard_max: usize,
    pub idle_timeout: Option<Duration>,
    pub acquire_timeout: Duration,
    pub packet_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            soft_max: 32,
            hard_max: 32,
            idle_timeout: None,
            acquire_timeout: Duration::from_millis(200),
            packet_size: AJP_DEF_PACKET_SIZE,
        }
    }
}

impl PoolConfig {
    /// Clamps the limits so that `min <= soft_max <= hard_max` and `hard_max >= 1`.
    pub fn normalized(mut self) -> Self {
        self.hard_max = self.hard_max.max(1);
        if self.soft_max == 0 || self.soft_max > self.hard_max {
            self.soft_max = self.hard_max;
        }
        self.min = self.min.min(self.soft_max);
        self
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub in_use: usize,
    pub connected: usize,
    pub hard_max: usize,
}

struct PoolInner {
    /// Free endpoints, most recently released last
    free: Vec<Endpoint>,
    total: usize,
    in_use: usize,
}

struct PoolShared {
    worker: String,
    config: PoolConfig,
    /// Live idle timeout in milliseconds, 0 when endpoints never expire
    idle_timeout_ms: AtomicU64,
    registry: Arc<RuntimeRegistry>,
    permits: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
}

impl PoolShared {
    fn inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> PooledEndpoint {
        let endpoint = {
            let mut inner = self.inner();
            inner.in_use += 1;
            match inner.free.pop() {
                Some(endpoint) => endpoint,
                None => {
                    inner.total += 1;
                    Endpoint::new(
                        self.registry.next_endpoint_id(),
                        self.worker.as_str(),
                        self.config.packet_size,
                        self.registry.now(),
                    )
                }
            }
        };
        trace!(worker = %self.worker, endpoint = endpoint.id(), "endpoint checked out");
        PooledEndpoint {
            endpoint: Some(endpoint),
            shared: Arc::clone(self),
            _permit: permit,
        }
    }

    fn recycle(&self, mut endpoint: Endpoint) {
        if endpoint.close_on_recycle || !endpoint.reuse {
            endpoint.close();
        }
        endpoint.close_on_recycle = false;
        endpoint.touch(self.registry.now());
        trace!(worker = %self.worker, endpoint = endpoint.id(), connected = endpoint.is_connected(), "endpoint released");

        let mut inner = self.inner();
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.free.push(endpoint);
    }
}

/// Bounded pool of [`Endpoint`]s belonging to one worker.
///
/// At most `hard_max` endpoints exist at once. Each checked-out endpoint
/// holds a semaphore permit, so a caller that finds the pool exhausted
/// waits up to the acquire timeout for another caller to release one.
/// Released endpoints are reused last-in-first-out; the socket they carry,
/// if still open, is reused without reconnecting.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ajplb_common::RuntimeRegistry;
/// use ajplb_pool::{ConnectionPool, PoolConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(RuntimeRegistry::in_memory());
/// let pool = ConnectionPool::new("node1", PoolConfig::default(), registry);
///
/// let endpoint = pool.acquire().await?;
/// // connect and exchange...
/// pool.release(endpoint);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(worker: impl Into<String>, config: PoolConfig, registry: Arc<RuntimeRegistry>) -> Self {
        let config = config.normalized();
        Self {
            shared: Arc::new(PoolShared {
                worker: worker.into(),
                permits: Arc::new(Semaphore::new(config.hard_max)),
                inner: Mutex::new(PoolInner {
                    free: Vec::with_capacity(config.hard_max),
                    total: 0,
                    in_use: 0,
                }),
                idle_timeout_ms: AtomicU64::new(timeout_ms(config.idle_timeout)),
                config,
                registry,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn worker(&self) -> &str {
        &self.shared.worker
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.shared.idle_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Changes the idle timeout used by later maintenance passes.
    pub fn set_idle_timeout(&self, idle_timeout: Option<Duration>) {
        self.shared
            .idle_timeout_ms
            .store(timeout_ms(idle_timeout), Ordering::Relaxed);
    }

    /// Acquires an endpoint, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledEndpoint> {
        self.acquire_within(self.shared.config.acquire_timeout).await
    }

    /// Acquires an endpoint, waiting up to `timeout`.
    ///
    /// A zero `timeout` never waits.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` if `timeout` is zero and every endpoint is in use
    /// - `PoolTimeout` if no endpoint was released within `timeout`
    pub async fn acquire_within(&self, timeout: Duration) -> Result<PooledEndpoint> {
        let permits = Arc::clone(&self.shared.permits);
        let permit = if timeout.is_zero() {
            permits
                .try_acquire_owned()
                .map_err(|_| AjpError::PoolExhausted(self.shared.worker.clone()))?
        } else {
            match tokio::time::timeout(timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(AjpError::PoolExhausted(self.shared.worker.clone())),
                Err(_) => {
                    debug!(worker = %self.shared.worker, timeout_ms = timeout.as_millis() as u64, "endpoint acquisition timed out");
                    return Err(AjpError::PoolTimeout(timeout.as_millis() as u64));
                }
            }
        };
        Ok(self.shared.checkout(permit))
    }

    /// Returns an endpoint to the pool.
    ///
    /// Equivalent to dropping it; provided for readability at call sites.
    pub fn release(&self, endpoint: PooledEndpoint) {
        drop(endpoint);
    }

    /// Takes free, connected endpoints idle for at least `idle_for`.
    ///
    /// Only endpoints for which a permit is immediately available are
    /// taken, so callers never wait behind live traffic. Used for
    /// interval keep-alive probes.
    pub fn checkout_idle(&self, idle_for: Duration) -> Vec<PooledEndpoint> {
        let now = self.shared.registry.now();
        let mut taken = Vec::new();
        loop {
            let Ok(permit) = Arc::clone(&self.shared.permits).try_acquire_owned() else {
                break;
            };
            let endpoint = {
                let mut inner = self.shared.inner();
                let found = inner.free.iter().position(|ep| {
                    ep.is_connected() && ep.idle_for(now) >= idle_for
                });
                match found {
                    Some(idx) => {
                        inner.in_use += 1;
                        inner.free.remove(idx)
                    }
                    None => break,
                }
            };
            taken.push(PooledEndpoint {
                endpoint: Some(endpoint),
                shared: Arc::clone(&self.shared),
                _permit: permit,
            });
        }
        taken
    }

    /// Evicts idle endpoints.
    ///
    /// Free endpoints idle longer than the idle timeout are closed and
    /// removed while more than `min` exist; afterwards free endpoints are
    /// trimmed down to `soft_max`. Endpoints in use are never touched.
    /// Returns how many endpoints were removed.
    pub fn maintain(&self, now: SystemTime) -> usize {
        let config = &self.shared.config;
        let idle_timeout = self.idle_timeout();
        let evicted: Vec<Endpoint> = {
            let mut inner = self.shared.inner();
            let mut evicted = Vec::new();

            if let Some(idle_timeout) = idle_timeout {
                // oldest first
                let mut idx = 0;
                while idx < inner.free.len() && inner.total > config.min {
                    if inner.free[idx].idle_for(now) > idle_timeout {
                        evicted.push(inner.free.remove(idx));
                        inner.total -= 1;
                    } else {
                        idx += 1;
                    }
                }
            }

            while inner.total > config.soft_max && inner.total > config.min && !inner.free.is_empty() {
                evicted.push(inner.free.remove(0));
                inner.total -= 1;
            }
            evicted
        };

        if !evicted.is_empty() {
            debug!(worker = %self.shared.worker, count = evicted.len(), "evicted idle endpoints");
        }
        let count = evicted.len();
        for mut endpoint in evicted {
            endpoint.close();
        }
        count
    }

    /// Closes the sockets of every free endpoint, keeping the endpoints.
    pub fn close_idle(&self) -> usize {
        let mut inner = self.shared.inner();
        let mut closed = 0;
        for endpoint in inner.free.iter_mut().filter(|ep| ep.is_connected()) {
            endpoint.close();
            closed += 1;
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner();
        PoolStats {
            total: inner.total,
            free: inner.free.len(),
            in_use: inner.in_use,
            connected: inner.free.iter().filter(|ep| ep.is_connected()).count(),
            hard_max: self.shared.config.hard_max,
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> u64 {
    timeout.map(|t| (t.as_millis() as u64).max(1)).unwrap_or(0)
}

/// An endpoint checked out of a [`ConnectionPool`].
///
/// Dereferences to the [`Endpoint`]. Dropping it hands the endpoint back
/// to the pool and frees its slot.
pub struct PooledEndpoint {
    endpoint: Option<Endpoint>,
    shared: Arc<PoolShared>,
    // released after the endpoint is back on the free list
    _permit: OwnedSemaphorePermit,
}

impl PooledEndpoint {
    /// Destroys the endpoint instead of recycling it.
    pub fn discard(mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.close();
            let mut inner = self.shared.inner();
            inner.in_use = inner.in_use.saturating_sub(1);
            inner.total = inner.total.saturating_sub(1);
        }
    }
}

impl Deref for PooledEndpoint {
    type Target = Endpoint;

    fn deref(&self) -> &Endpoint {
        // only None after discard or drop
        self.endpoint.as_ref().unwrap_or_else(|| unreachable!("endpoint already returned"))
    }
}

impl DerefMut for PooledEndpoint {
    fn deref_mut(&mut self) -> &mut Endpoint {
        self.endpoint.as_mut().unwrap_or_else(|| unreachable!("endpoint already returned"))
    }
}

impl Drop for PooledEndpoint {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            self.shared.recycle(endpoint);
        }
    }
}

impl std::fmt::Debug for PooledEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledEndpoint").field(&self.endpoint).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ajplb_common::runtime::{Clock, InMemoryStore, ManualClock};

    fn registry_at(secs: u64) -> (Arc<ManualClock>, Arc<RuntimeRegistry>) {
        let clock = Arc::new(ManualClock::at_unix(secs));
        let registry = Arc::new(RuntimeRegistry::new(clock.clone(), Arc::new(InMemoryStore::new())));
        (clock, registry)
    }

    fn pool(config: PoolConfig) -> (Arc<ManualClock>, ConnectionPool) {
        let (clock, registry) = registry_at(1_000);
        (clock, ConnectionPool::new("node1", config, registry))
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.hard_max, 32);
        assert_eq!(config.acquire_timeout, Duration::from_millis(200));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_config_normalized() {
        let config = PoolConfig {
            min: 10,
            soft_max: 50,
            hard_max: 4,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.soft_max, 4);
        assert_eq!(config.min, 4);

        let config = PoolConfig {
            hard_max: 0,
            soft_max: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.hard_max, 1);
        assert_eq!(config.soft_max, 1);
    }

    #[tokio::test]
    async fn test_acquire_creates_lazily() {
        let (_, pool) = pool(PoolConfig::default());
        assert_eq!(pool.stats().total, 0);

        let ep = pool.acquire().await.unwrap();
        assert!(!ep.is_connected());
        assert_eq!(ep.worker(), "node1");
        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_release_reuses_lifo() {
        let (_, pool) = pool(PoolConfig::default());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let (id_a, id_b) = (a.id(), b.id());
        pool.release(a);
        pool.release(b);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id_b);
        assert_ne!(id_a, id_b);
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_waits() {
        let (_, pool) = pool(PoolConfig {
            hard_max: 1,
            ..Default::default()
        });
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire_within(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, AjpError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_hard_max() {
        let (_, pool) = pool(PoolConfig {
            hard_max: 2,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let started = std::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, AjpError::PoolTimeout(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_endpoint() {
        let (_, pool) = pool(PoolConfig {
            hard_max: 1,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let held = pool.acquire().await.unwrap();
        let id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|ep| ep.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let (_, pool) = pool(PoolConfig {
            hard_max: 1,
            ..Default::default()
        });
        let ep = pool.acquire().await.unwrap();
        let id = ep.id();
        ep.discard();
        assert_eq!(pool.stats().total, 0);

        let fresh = pool.acquire_within(Duration::ZERO).await.unwrap();
        assert_ne!(fresh.id(), id);
    }

    #[tokio::test]
    async fn test_maintain_evicts_idle_above_min() {
        let (clock, pool) = pool(PoolConfig {
            min: 1,
            idle_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let eps: Vec<_> = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        drop(eps);
        assert_eq!(pool.stats().free, 3);

        clock.advance(Duration::from_secs(10));
        assert_eq!(pool.maintain(clock.now()), 0);

        clock.advance(Duration::from_secs(31));
        assert_eq!(pool.maintain(clock.now()), 2);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_can_change_live() {
        let (clock, pool) = pool(PoolConfig::default());
        drop(pool.acquire().await.unwrap());
        clock.advance(Duration::from_secs(600));
        assert_eq!(pool.maintain(clock.now()), 0);

        pool.set_idle_timeout(Some(Duration::from_secs(300)));
        assert_eq!(pool.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(pool.maintain(clock.now()), 1);
    }

    #[tokio::test]
    async fn test_maintain_never_touches_in_use() {
        let (clock, pool) = pool(PoolConfig {
            idle_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let held = pool.acquire().await.unwrap();
        clock.advance(Duration::from_secs(60));
        assert_eq!(pool.maintain(clock.now()), 0);
        assert_eq!(pool.stats().in_use, 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_maintain_trims_to_soft_max() {
        let (clock, pool) = pool(PoolConfig {
            soft_max: 2,
            hard_max: 4,
            ..Default::default()
        });
        let eps: Vec<_> = acquire_n(&pool, 4).await;
        drop(eps);

        assert_eq!(pool.maintain(clock.now()), 2);
        assert_eq!(pool.stats().total, 2);
    }

    async fn acquire_n(pool: &ConnectionPool, n: usize) -> Vec<PooledEndpoint> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(pool.acquire().await.unwrap());
        }
        out
    }
}
