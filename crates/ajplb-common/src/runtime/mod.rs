//! Process-wide runtime context.
//!
//! A [`RuntimeRegistry`] bundles what used to be hidden global state: the
//! clock, the cross-process [`SharedStore`] and id counters. It is created
//! once at startup and handed to every pool, worker and balancer
//! constructor, so tests can build fully isolated instances with a
//! [`ManualClock`] and an [`InMemoryStore`].

pub mod image;
pub mod shared;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use image::ImageStore;
pub use shared::{
    BalancerRecord, InMemoryStore, MemberRecord, Record, SharedStore, StoreGuard, WorkerRecord,
};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at `secs` seconds after the Unix epoch.
    pub fn at_unix(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Seconds since the Unix epoch, saturating at zero for earlier times.
pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Shared context injected into pools, workers and balancers.
pub struct RuntimeRegistry {
    clock: Arc<dyn Clock>,
    store: Arc<dyn SharedStore>,
    started: SystemTime,
    next_endpoint_id: AtomicU64,
}

impl RuntimeRegistry {
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn SharedStore>) -> Self {
        let started = clock.now();
        Self {
            clock,
            store,
            started,
            next_endpoint_id: AtomicU64::new(1),
        }
    }

    /// System clock and a private in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(InMemoryStore::new()))
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Current time as Unix seconds, the resolution used by runtime records.
    pub fn unix_now(&self) -> u64 {
        unix_secs(self.clock.now())
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Process-unique id for a new endpoint.
    pub fn next_endpoint_id(&self) -> u64 {
        self.next_endpoint_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
