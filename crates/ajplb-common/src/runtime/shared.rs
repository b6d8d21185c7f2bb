//! Cross-process runtime state seam.
//!
//! Mutable counters of workers, balancer members and balancers are
//! mirrored into a [`SharedStore`] as fixed records. Every push bumps the
//! record's sequence number; a reader re-pulls a record only when the
//! stored sequence is newer than the one it last saw.
//!
//! Two lock levels exist. Each `pull_*`/`push_*` call is atomic on its
//! own. [`SharedStore::lock`] additionally hands out a coarse guard that
//! a pessimistic balancer holds across pull, select and push.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::states::{Activation, LbMethod, LockMode, MemberState, WorkerState};

/// Runtime mirror of one AJP worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub addr_sequence: u32,
    pub state: WorkerState,
    pub busy: u32,
    pub max_busy: u32,
    pub error_time: u64,
    pub readed: u64,
    pub transferred: u64,
    pub used: u64,
    pub errors: u32,
    pub client_errors: u32,
    pub reply_timeouts: u32,
    pub last_reset: u64,
    pub last_maintain: u64,
    pub sequence: u64,
}

/// Runtime mirror of one balancer member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub balancer: String,
    pub name: String,
    pub route: String,
    pub domain: String,
    pub redirect: String,
    pub distance: u32,
    pub activation: Activation,
    pub state: MemberState,
    pub lb_factor: u32,
    pub lb_mult: u64,
    pub lb_value: u64,
    pub busy: u32,
    pub max_busy: u32,
    pub error_time: u64,
    pub elected: u64,
    pub errors: u32,
    pub sequence: u64,
}

/// Runtime mirror of one balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerRecord {
    pub name: String,
    pub busy: u32,
    pub max_busy: u32,
    pub sticky_session: bool,
    pub sticky_session_force: bool,
    pub method: LbMethod,
    pub lock: LockMode,
    pub retries: u32,
    pub retry_interval_ms: u32,
    pub recover_wait_time: u32,
    pub error_escalation_time: u32,
    pub max_reply_timeouts: u32,
    pub last_reset: u64,
    pub last_maintain: u64,
    pub sequence: u64,
}

/// Any stored record, as returned by [`SharedStore::records`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Worker(WorkerRecord),
    Member(MemberRecord),
    Balancer(BalancerRecord),
}

/// Coarse store lock held by pessimistic balancers.
pub struct StoreGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl<'a> StoreGuard<'a> {
    /// Locks `mutex`, recovering from poisoning since the guarded unit
    /// carries no data.
    pub fn acquire(mutex: &'a Mutex<()>) -> Self {
        Self {
            _guard: mutex.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

/// The pull/push seam to the cross-process runtime store.
pub trait SharedStore: Send + Sync {
    /// Coarse lock spanning several pull/push calls.
    fn lock(&self) -> StoreGuard<'_>;

    fn pull_worker(&self, name: &str) -> Option<WorkerRecord>;

    /// Stores the record and returns its new sequence number.
    fn push_worker(&self, record: &WorkerRecord) -> u64;

    fn pull_member(&self, balancer: &str, member: &str) -> Option<MemberRecord>;

    fn push_member(&self, record: &MemberRecord) -> u64;

    fn pull_balancer(&self, name: &str) -> Option<BalancerRecord>;

    fn push_balancer(&self, record: &BalancerRecord) -> u64;

    /// Every stored record, in insertion order.
    fn records(&self) -> Vec<Record>;
}

#[derive(Default)]
struct Tables {
    order: Vec<(u8, String)>,
    workers: HashMap<String, WorkerRecord>,
    members: HashMap<String, MemberRecord>,
    balancers: HashMap<String, BalancerRecord>,
}

fn member_key(balancer: &str, member: &str) -> String {
    format!("{}/{}", balancer, member)
}

/// Process-local [`SharedStore`].
#[derive(Default)]
pub struct InMemoryStore {
    coarse: Mutex<()>,
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn next_sequence(stored: Option<u64>, incoming: u64) -> u64 {
    stored.unwrap_or(0).max(incoming) + 1
}

impl SharedStore for InMemoryStore {
    fn lock(&self) -> StoreGuard<'_> {
        StoreGuard::acquire(&self.coarse)
    }

    fn pull_worker(&self, name: &str) -> Option<WorkerRecord> {
        self.tables().workers.get(name).cloned()
    }

    fn push_worker(&self, record: &WorkerRecord) -> u64 {
        let mut t = self.tables();
        let seq = next_sequence(t.workers.get(&record.name).map(|r| r.sequence), record.sequence);
        if !t.workers.contains_key(&record.name) {
            t.order.push((0, record.name.clone()));
        }
        let mut stored = record.clone();
        stored.sequence = seq;
        t.workers.insert(record.name.clone(), stored);
        seq
    }

    fn pull_member(&self, balancer: &str, member: &str) -> Option<MemberRecord> {
        self.tables().members.get(&member_key(balancer, member)).cloned()
    }

    fn push_member(&self, record: &MemberRecord) -> u64 {
        let key = member_key(&record.balancer, &record.name);
        let mut t = self.tables();
        let seq = next_sequence(t.members.get(&key).map(|r| r.sequence), record.sequence);
        if !t.members.contains_key(&key) {
            t.order.push((1, key.clone()));
        }
        let mut stored = record.clone();
        stored.sequence = seq;
        t.members.insert(key, stored);
        seq
    }

    fn pull_balancer(&self, name: &str) -> Option<BalancerRecord> {
        self.tables().balancers.get(name).cloned()
    }

    fn push_balancer(&self, record: &BalancerRecord) -> u64 {
        let mut t = self.tables();
        let seq = next_sequence(t.balancers.get(&record.name).map(|r| r.sequence), record.sequence);
        if !t.balancers.contains_key(&record.name) {
            t.order.push((2, record.name.clone()));
        }
        let mut stored = record.clone();
        stored.sequence = seq;
        t.balancers.insert(record.name.clone(), stored);
        seq
    }

    fn records(&self) -> Vec<Record> {
        let t = self.tables();
        t.order
            .iter()
            .filter_map(|(kind, key)| match kind {
                0 => t.workers.get(key).cloned().map(Record::Worker),
                1 => t.members.get(key).cloned().map(Record::Member),
                _ => t.balancers.get(key).cloned().map(Record::Balancer),
            })
            .collect()
    }
}
