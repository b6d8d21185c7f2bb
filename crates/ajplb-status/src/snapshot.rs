use ajplb_balancer::{AjpWorker, Balancer, BalancerMember, Connector};
use ajplb_common::runtime::unix_secs;
use ajplb_common::{Activation, MemberState};
use serde::{Deserialize, Serialize};

/// Status of the whole connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub version: String,
    pub uptime_secs: u64,
    pub read_only: bool,
    pub balancers: Vec<BalancerSnapshot>,
    /// Workers not owned by any balancer
    pub workers: Vec<WorkerSnapshot>,
}

impl StatusSnapshot {
    pub fn capture(connector: &Connector) -> Self {
        let registry = connector.registry();
        let uptime_secs = registry
            .now()
            .duration_since(registry.started())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let balancers: Vec<BalancerSnapshot> =
            connector.balancers().iter().map(|b| BalancerSnapshot::capture(b)).collect();
        let workers = connector
            .workers()
            .iter()
            .filter(|w| {
                !balancers
                    .iter()
                    .any(|b| b.members.iter().any(|m| m.name == w.name()))
            })
            .map(|w| WorkerSnapshot::capture(w))
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs,
            read_only: connector.read_only(),
            balancers,
            workers,
        }
    }
}

/// Settings, counters and members of one balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerSnapshot {
    pub name: String,
    pub method: String,
    pub lock: String,
    pub sticky_session: bool,
    pub sticky_session_force: bool,
    pub session_cookie: String,
    pub session_path: String,
    pub retries: u32,
    pub retry_interval_ms: u32,
    pub recover_wait_time_secs: u32,
    pub error_escalation_time_secs: u32,
    pub max_reply_timeouts: u32,
    pub busy: u32,
    pub max_busy: u32,
    pub last_maintain: u64,
    pub last_reset: u64,
    /// Active members serving normally
    pub good: usize,
    /// Members disabled, busy or recovering
    pub degraded: usize,
    /// Members stopped or quarantined
    pub bad: usize,
    pub members: Vec<MemberSnapshot>,
}

impl BalancerSnapshot {
    pub fn capture(balancer: &Balancer) -> Self {
        let settings = balancer.settings();
        let current = balancer.member_snapshot();
        let mut counts = [0usize; 3];
        for member in &current {
            counts[health_class(member) as usize] += 1;
        }
        let members = current.iter().map(MemberSnapshot::capture).collect();

        Self {
            name: balancer.name().to_string(),
            method: settings.method.to_string(),
            lock: settings.lock.to_string(),
            sticky_session: settings.sticky_session,
            sticky_session_force: settings.sticky_session_force,
            session_cookie: settings.session_cookie,
            session_path: settings.session_path,
            retries: settings.retries,
            retry_interval_ms: settings.retry_interval_ms,
            recover_wait_time_secs: settings.recover_wait_time_secs,
            error_escalation_time_secs: settings.error_escalation_time_secs,
            max_reply_timeouts: settings.max_reply_timeouts,
            busy: balancer.busy(),
            max_busy: balancer.max_busy(),
            last_maintain: balancer.last_maintain(),
            last_reset: balancer.last_reset(),
            good: counts[Health::Good as usize],
            degraded: counts[Health::Degraded as usize],
            bad: counts[Health::Bad as usize],
            members,
        }
    }
}

#[derive(Clone, Copy)]
enum Health {
    Good = 0,
    Degraded = 1,
    Bad = 2,
}

fn health_class(member: &BalancerMember) -> Health {
    if member.activation == Activation::Stopped || member.state.is_quarantined() {
        Health::Bad
    } else if member.activation == Activation::Disabled
        || matches!(member.state, MemberState::Busy | MemberState::Recover)
    {
        Health::Degraded
    } else {
        Health::Good
    }
}

/// One balancer member and the worker behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub name: String,
    pub route: String,
    pub redirect: String,
    pub domain: String,
    pub distance: u32,
    pub activation: String,
    pub state: String,
    pub lb_factor: u32,
    pub lb_mult: u64,
    pub lb_value: u64,
    pub busy: u32,
    pub max_busy: u32,
    pub elected: u64,
    pub errors: u32,
    pub error_time: Option<u64>,
    pub worker: WorkerSnapshot,
}

impl MemberSnapshot {
    pub fn capture(member: &BalancerMember) -> Self {
        Self {
            name: member.name().to_string(),
            route: member.route.clone(),
            redirect: member.redirect.clone(),
            domain: member.domain.clone(),
            distance: member.distance,
            activation: member.activation.to_string(),
            state: member.state.to_string(),
            lb_factor: member.lb_factor,
            lb_mult: member.lb_mult,
            lb_value: member.lb_value,
            busy: member.busy,
            max_busy: member.max_busy,
            elected: member.elected,
            errors: member.errors,
            error_time: member.error_time.map(unix_secs),
            worker: WorkerSnapshot::capture(member.worker()),
        }
    }
}

/// Configuration, counters and pool occupancy of one AJP worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub state: String,
    pub ping_mode: String,
    pub connect_timeout_ms: u64,
    pub prepost_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub retries: u32,
    pub retry_interval_ms: u64,
    pub recovery_options: u32,
    pub max_packet_size: usize,
    pub cache_timeout_secs: u64,
    pub busy: u32,
    pub max_busy: u32,
    pub used: u64,
    pub readed: u64,
    pub transferred: u64,
    pub errors: u32,
    pub client_errors: u32,
    pub reply_timeouts: u32,
    pub error_time: Option<u64>,
    pub last_reset: u64,
    pub pool_total: usize,
    pub pool_free: usize,
    pub pool_connected: usize,
}

impl WorkerSnapshot {
    pub fn capture(worker: &AjpWorker) -> Self {
        let config = worker.config();
        let record = worker.to_record();
        let pool = worker.pool().stats();
        Self {
            name: record.name,
            host: record.host,
            port: record.port,
            state: record.state.to_string(),
            ping_mode: config.ping_mode.to_string(),
            connect_timeout_ms: config.connect_timeout_ms,
            prepost_timeout_ms: config.prepost_timeout_ms,
            reply_timeout_ms: config.reply_timeout_ms,
            retries: config.retries,
            retry_interval_ms: config.retry_interval_ms,
            recovery_options: config.recovery_options,
            max_packet_size: config.max_packet_size,
            cache_timeout_secs: config.cache_timeout_secs,
            busy: record.busy,
            max_busy: record.max_busy,
            used: record.used,
            readed: record.readed,
            transferred: record.transferred,
            errors: record.errors,
            client_errors: record.client_errors,
            reply_timeouts: record.reply_timeouts,
            error_time: worker.error_time().map(unix_secs),
            last_reset: record.last_reset,
            pool_total: pool.total,
            pool_free: pool.free,
            pool_connected: pool.connected,
        }
    }
}
