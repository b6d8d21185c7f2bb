//! Connector configuration loaded from TOML.
//!
//! ```toml
//! [[worker]]
//! name = "node1"
//! host = "10.0.0.1"
//! ping_mode = "CP"
//!
//! [[worker]]
//! name = "node2"
//! host = "10.0.0.2"
//!
//! [[balancer]]
//! name = "lb"
//! method = "Busyness"
//!
//! [[balancer.member]]
//! worker = "node1"
//! lb_factor = 70
//!
//! [[balancer.member]]
//! worker = "node2"
//! lb_factor = 30
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::protocol::{AJP_DEF_PACKET_SIZE, AJP_MAX_PACKET_SIZE};
use ajplb_common::transport::SocketOptions;
use ajplb_common::{Activation, LbMethod, LockMode};
use ajplb_pool::PoolConfig;
use serde::{Deserialize, Serialize};

pub const AJP13_DEF_PORT: u16 = 8009;

/// Largest accepted member `lb_factor`.
pub const MAX_LB_FACTOR: u32 = 10_000;

/// CPING/CPONG usage flags of a worker.
///
/// Parsed from letters (`C`onnect, `P`repost, `I`nterval, `A`ll) or from
/// the numeric flag value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PingMode(u8);

impl PingMode {
    pub const NONE: PingMode = PingMode(0);
    pub const CONNECT: PingMode = PingMode(1);
    pub const PREPOST: PingMode = PingMode(2);
    pub const INTERVAL: PingMode = PingMode(4);
    pub const ALL: PingMode = PingMode(7);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: PingMode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for PingMode {
    type Output = PingMode;

    fn bitor(self, rhs: PingMode) -> PingMode {
        PingMode(self.0 | rhs.0)
    }
}

impl fmt::Display for PingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(PingMode::CONNECT) {
            f.write_str("C")?;
        }
        if self.contains(PingMode::PREPOST) {
            f.write_str("P")?;
        }
        if self.contains(PingMode::INTERVAL) {
            f.write_str("I")?;
        }
        Ok(())
    }
}

impl FromStr for PingMode {
    type Err = AjpError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(bits) = s.parse::<u8>() {
            if bits <= PingMode::ALL.0 {
                return Ok(PingMode(bits));
            }
        }
        let mut mode = PingMode::NONE;
        for c in s.chars() {
            mode = mode
                | match c.to_ascii_uppercase() {
                    'C' => PingMode::CONNECT,
                    'P' => PingMode::PREPOST,
                    'I' => PingMode::INTERVAL,
                    'A' => PingMode::ALL,
                    _ => return Err(AjpError::Config(format!("invalid ping_mode '{}'", s))),
                };
        }
        Ok(mode)
    }
}

impl TryFrom<String> for PingMode {
    type Error = AjpError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PingMode> for String {
    fn from(mode: PingMode) -> String {
        mode.to_string()
    }
}

/// Recovery option flags.
pub mod recovery {
    /// Do not fail over once the request reached the backend.
    pub const ABORT_IF_TCGETREQUEST: u32 = 0x0001;
    /// Do not fail over once response headers were received.
    pub const ABORT_IF_TCSENDHEADER: u32 = 0x0002;
    /// Close the backend connection when the client side fails.
    pub const ABORT_IF_CLIENTERROR: u32 = 0x0004;
    /// HEAD requests may always fail over.
    pub const ALWAYS_HTTP_HEAD: u32 = 0x0008;
    /// GET requests may always fail over.
    pub const ALWAYS_HTTP_GET: u32 = 0x0010;
}

/// One AJP backend.
///
/// Timeouts of 0 mean "not set". `connect_timeout_ms` and
/// `prepost_timeout_ms` fall back to `ping_timeout_ms` when their
/// ping mode is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub socket_timeout_ms: u64,
    pub socket_connect_timeout_ms: u64,
    pub socket_keepalive: bool,
    pub socket_buffer: u32,
    pub ping_mode: PingMode,
    pub ping_timeout_ms: u64,
    /// Idle time after which interval pings probe a pooled connection
    pub ping_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub prepost_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    /// Attempts per request on this worker
    pub retries: u32,
    pub retry_interval_ms: u64,
    /// Fixed quarantine interval; unset means `60 + 60 * retries` seconds
    pub retry_secs: Option<u64>,
    pub recovery_options: u32,
    pub max_packet_size: usize,
    pub cache_size: usize,
    pub cache_min: usize,
    pub cache_soft_max: usize,
    pub cache_timeout_secs: u64,
    pub cache_acquire_timeout_ms: u64,
    pub secret: Option<String>,
    /// Response statuses treated as a worker failure
    pub http_status_fail: Vec<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "localhost".to_string(),
            port: AJP13_DEF_PORT,
            socket_timeout_ms: 0,
            socket_connect_timeout_ms: 5000,
            socket_keepalive: false,
            socket_buffer: 0,
            ping_mode: PingMode::NONE,
            ping_timeout_ms: 10000,
            ping_interval_secs: 100,
            connect_timeout_ms: 0,
            prepost_timeout_ms: 0,
            reply_timeout_ms: 0,
            retries: 2,
            retry_interval_ms: 100,
            retry_secs: None,
            recovery_options: 0,
            max_packet_size: AJP_DEF_PACKET_SIZE,
            cache_size: 32,
            cache_min: 0,
            cache_soft_max: 0,
            cache_timeout_secs: 0,
            cache_acquire_timeout_ms: 200,
            secret: None,
            http_status_fail: Vec::new(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AjpError::Config("worker name must not be empty".into()));
        }
        if self.host.is_empty() {
            return Err(AjpError::Config(format!("worker '{}': host must not be empty", self.name)));
        }
        if self.port == 0 {
            return Err(AjpError::Config(format!("worker '{}': port must not be 0", self.name)));
        }
        if !(AJP_DEF_PACKET_SIZE..=AJP_MAX_PACKET_SIZE).contains(&self.max_packet_size) {
            return Err(AjpError::Config(format!(
                "worker '{}': max_packet_size {} outside {}..={}",
                self.name, self.max_packet_size, AJP_DEF_PACKET_SIZE, AJP_MAX_PACKET_SIZE
            )));
        }
        if self.cache_size == 0 {
            return Err(AjpError::Config(format!("worker '{}': cache_size must be at least 1", self.name)));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min: self.cache_min,
            soft_max: self.cache_soft_max,
            hard_max: self.cache_size,
            idle_timeout: self.cache_idle_timeout(),
            acquire_timeout: Duration::from_millis(self.cache_acquire_timeout_ms),
            packet_size: self.max_packet_size,
        }
        .normalized()
    }

    pub fn cache_idle_timeout(&self) -> Option<Duration> {
        (self.cache_timeout_secs > 0).then(|| Duration::from_secs(self.cache_timeout_secs))
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            connect_timeout: millis(self.socket_connect_timeout_ms)
                .unwrap_or_else(|| SocketOptions::default().connect_timeout),
            io_timeout: self.socket_timeout(),
            keepalive: self.socket_keepalive,
            buffer_size: (self.socket_buffer > 0).then_some(self.socket_buffer),
        }
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        millis(self.socket_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        millis(self.reply_timeout_ms).or_else(|| self.socket_timeout())
    }

    pub fn ping_timeout(&self) -> Duration {
        millis(self.ping_timeout_ms).unwrap_or(Duration::from_secs(10))
    }

    /// CPING timeout after connect, if connect pings are enabled.
    pub fn connect_ping_timeout(&self) -> Option<Duration> {
        self.ping_mode
            .contains(PingMode::CONNECT)
            .then(|| millis(self.connect_timeout_ms).unwrap_or_else(|| self.ping_timeout()))
    }

    /// CPING timeout before each request, if prepost pings are enabled.
    pub fn prepost_ping_timeout(&self) -> Option<Duration> {
        self.ping_mode
            .contains(PingMode::PREPOST)
            .then(|| millis(self.prepost_timeout_ms).unwrap_or_else(|| self.ping_timeout()))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// One member of a balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemberConfig {
    pub worker: String,
    /// Session route; defaults to the worker name
    pub route: Option<String>,
    pub redirect: Option<String>,
    /// Defaults to the route prefix before the first `.`, if any
    pub domain: Option<String>,
    pub distance: u32,
    pub activation: Activation,
    pub lb_factor: u32,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            worker: String::new(),
            route: None,
            redirect: None,
            domain: None,
            distance: 0,
            activation: Activation::Active,
            lb_factor: 1,
        }
    }
}

impl MemberConfig {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            ..Default::default()
        }
    }

    pub fn effective_route(&self) -> String {
        self.route.clone().unwrap_or_else(|| self.worker.clone())
    }

    pub fn effective_domain(&self) -> String {
        match &self.domain {
            Some(domain) => domain.clone(),
            None => domain_of_route(&self.effective_route()),
        }
    }
}

/// Domain implied by a route such as `dc1.node3`, empty if the route has no dot.
pub fn domain_of_route(route: &str) -> String {
    route
        .split_once('.')
        .map(|(domain, _)| domain.to_string())
        .unwrap_or_default()
}

/// A named group of members sharing load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalancerConfig {
    pub name: String,
    #[serde(rename = "member")]
    pub members: Vec<MemberConfig>,
    pub sticky_session: bool,
    pub sticky_session_force: bool,
    pub session_cookie: String,
    pub session_path: String,
    pub method: LbMethod,
    pub lock: LockMode,
    /// Failover attempts after the first member failed
    pub retries: u32,
    pub retry_interval_ms: u32,
    pub recover_wait_time_secs: u32,
    pub error_escalation_time_secs: u32,
    pub max_reply_timeouts: u32,
    pub maintain_time_secs: u32,
    /// How long selection waits for a usable member; 0 fails immediately
    pub timeout_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            members: Vec::new(),
            sticky_session: true,
            sticky_session_force: false,
            session_cookie: "JSESSIONID".to_string(),
            session_path: ";jsessionid".to_string(),
            method: LbMethod::Requests,
            lock: LockMode::Optimistic,
            retries: 2,
            retry_interval_ms: 100,
            recover_wait_time_secs: 60,
            error_escalation_time_secs: 30,
            max_reply_timeouts: 0,
            maintain_time_secs: 60,
            timeout_ms: 0,
        }
    }
}

impl BalancerConfig {
    pub fn new(name: impl Into<String>, members: Vec<MemberConfig>) -> Self {
        Self {
            name: name.into(),
            members,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AjpError::Config("balancer name must not be empty".into()));
        }
        if self.members.is_empty() {
            return Err(AjpError::Config(format!("balancer '{}' has no members", self.name)));
        }
        if self.session_cookie.is_empty() {
            return Err(AjpError::Config(format!(
                "balancer '{}': session_cookie must not be empty",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(member.worker.as_str()) {
                return Err(AjpError::Config(format!(
                    "balancer '{}': worker '{}' listed twice",
                    self.name, member.worker
                )));
            }
            if member.lb_factor > MAX_LB_FACTOR {
                return Err(AjpError::Config(format!(
                    "balancer '{}': member '{}' lb_factor {} exceeds {}",
                    self.name, member.worker, member.lb_factor, MAX_LB_FACTOR
                )));
            }
        }
        Ok(())
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintainConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// CPING members in error once their recovery window elapsed
    pub probe: bool,
}

impl Default for MaintainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            probe: true,
        }
    }
}

/// Administrative interface settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    pub read_only: bool,
}

/// Top-level connector configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    #[serde(rename = "worker")]
    pub workers: Vec<WorkerConfig>,
    #[serde(rename = "balancer")]
    pub balancers: Vec<BalancerConfig>,
    pub maintain: MaintainConfig,
    pub status: StatusConfig,
    /// File holding the shared runtime image; in-memory state when unset
    pub runtime_image: Option<PathBuf>,
}

impl ConnectorConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// `Toml` for syntax errors and unknown keys, `Config` for invalid values.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ConnectorConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for worker in &self.workers {
            worker.validate()?;
            if !names.insert(worker.name.as_str()) {
                return Err(AjpError::Config(format!("duplicate worker name '{}'", worker.name)));
            }
        }
        for balancer in &self.balancers {
            balancer.validate()?;
            if !names.insert(balancer.name.as_str()) {
                return Err(AjpError::Config(format!(
                    "balancer name '{}' clashes with another worker or balancer",
                    balancer.name
                )));
            }
            for member in &balancer.members {
                if !self.workers.iter().any(|w| w.name == member.worker) {
                    return Err(AjpError::Config(format!(
                        "balancer '{}' references unknown worker '{}'",
                        balancer.name, member.worker
                    )));
                }
            }
        }
        if self.maintain.enabled && self.maintain.interval_secs == 0 {
            return Err(AjpError::Config("maintain.interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        runtime_image = "/tmp/ajplb.image"

        [[worker]]
        name = "node1"
        host = "10.0.0.1"
        ping_mode = "CP"
        http_status_fail = [503]

        [[worker]]
        name = "node2"
        host = "10.0.0.2"
        port = 8010
        retry_secs = 5

        [[balancer]]
        name = "lb"
        method = "Busyness"
        lock = "Pessimistic"
        sticky_session_force = true

        [[balancer.member]]
        worker = "node1"
        route = "dc1.n1"
        lb_factor = 70

        [[balancer.member]]
        worker = "node2"
        lb_factor = 30
        activation = "Disabled"

        [maintain]
        interval_secs = 5

        [status]
        read_only = true
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ConnectorConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].port, AJP13_DEF_PORT);
        assert_eq!(config.workers[0].ping_mode, PingMode::CONNECT | PingMode::PREPOST);
        assert_eq!(config.workers[0].http_status_fail, vec![503]);
        assert_eq!(config.workers[1].retry_secs, Some(5));

        let lb = &config.balancers[0];
        assert_eq!(lb.method, LbMethod::Busyness);
        assert_eq!(lb.lock, LockMode::Pessimistic);
        assert!(lb.sticky_session);
        assert!(lb.sticky_session_force);
        assert_eq!(lb.session_cookie, "JSESSIONID");
        assert_eq!(lb.members[0].effective_domain(), "dc1");
        assert_eq!(lb.members[1].effective_route(), "node2");
        assert_eq!(lb.members[1].activation, Activation::Disabled);

        assert_eq!(config.maintain.interval_secs, 5);
        assert!(config.status.read_only);
        assert!(config.runtime_image.is_some());
    }

    #[test]
    fn test_defaults() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.port, 8009);
        assert_eq!(worker.max_packet_size, 8192);
        assert_eq!(worker.ping_timeout_ms, 10000);
        assert_eq!(worker.socket_connect_timeout_ms, 5000);
        assert_eq!(worker.cache_acquire_timeout_ms, 200);
        assert_eq!(worker.retries, 2);
        assert_eq!(worker.retry_interval_ms, 100);

        let lb = BalancerConfig::default();
        assert_eq!(lb.recover_wait_time_secs, 60);
        assert_eq!(lb.error_escalation_time_secs, 30);
        assert_eq!(lb.max_reply_timeouts, 0);
        assert_eq!(lb.maintain_time_secs, 60);
        assert_eq!(lb.session_path, ";jsessionid");
        assert_eq!(MemberConfig::default().lb_factor, 1);
    }

    #[test]
    fn test_unknown_member_worker_rejected() {
        let err = ConnectorConfig::from_toml_str(
            r#"
            [[balancer]]
            name = "lb"
            [[balancer.member]]
            worker = "ghost"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AjpError::Config(msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_packet_size_range_enforced() {
        let mut worker = WorkerConfig::new("w", "localhost", 8009);
        worker.max_packet_size = 4096;
        assert!(worker.validate().is_err());
        worker.max_packet_size = 65536;
        assert!(worker.validate().is_ok());
        worker.max_packet_size = 65537;
        assert!(worker.validate().is_err());
    }

    #[test]
    fn test_lb_factor_capped() {
        let mut member = MemberConfig::new("w");
        member.lb_factor = MAX_LB_FACTOR;
        let mut lb = BalancerConfig::new("lb", vec![member]);
        assert!(lb.validate().is_ok());
        lb.members[0].lb_factor = 3_000_000_000;
        let err = lb.validate().unwrap_err();
        assert!(matches!(err, AjpError::Config(msg) if msg.contains("lb_factor")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ConnectorConfig::from_toml_str("[[worker]]\nname = \"w\"\nhots = \"x\"\n").unwrap_err();
        assert!(matches!(err, AjpError::Toml(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = ConnectorConfig::default();
        config.workers.push(WorkerConfig::new("w", "localhost", 8009));
        config.balancers.push(BalancerConfig::new("w", vec![MemberConfig::new("w")]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ping_mode_parsing() {
        assert_eq!("A".parse::<PingMode>().unwrap(), PingMode::ALL);
        assert_eq!("ci".parse::<PingMode>().unwrap(), PingMode::CONNECT | PingMode::INTERVAL);
        assert_eq!("2".parse::<PingMode>().unwrap(), PingMode::PREPOST);
        assert!("X".parse::<PingMode>().is_err());
        assert_eq!(PingMode::ALL.to_string(), "CPI");
        assert!(!PingMode::NONE.contains(PingMode::NONE));
    }

    #[test]
    fn test_ping_timeouts_fall_back() {
        let mut worker = WorkerConfig::default();
        assert_eq!(worker.connect_ping_timeout(), None);
        worker.ping_mode = PingMode::ALL;
        worker.prepost_timeout_ms = 500;
        assert_eq!(worker.connect_ping_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(worker.prepost_ping_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_domain_of_route() {
        assert_eq!(domain_of_route("dc1.node3"), "dc1");
        assert_eq!(domain_of_route("node3"), "");
    }
}
