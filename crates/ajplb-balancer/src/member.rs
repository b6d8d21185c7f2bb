use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ajplb_common::runtime::{unix_secs, MemberRecord};
use ajplb_common::{Activation, MemberState};
use tracing::{info, warn};

use crate::config::{domain_of_route, MemberConfig};
use crate::worker::AjpWorker;

/// A worker's participation in one balancer.
///
/// Members live in the balancer's ordered list and are identified by
/// their index there. All mutation happens under the balancer's member
/// lock.
#[derive(Debug, Clone)]
pub struct BalancerMember {
    worker: Arc<AjpWorker>,
    pub route: String,
    pub redirect: String,
    pub domain: String,
    pub distance: u32,
    pub activation: Activation,
    pub state: MemberState,
    pub lb_factor: u32,
    pub lb_mult: u64,
    pub lb_value: u64,
    /// Requests currently routed through this member
    pub busy: u32,
    pub max_busy: u32,
    pub error_time: Option<SystemTime>,
    pub elected: u64,
    pub errors: u32,
    /// Last shared store sequence seen or written
    pub sequence: u64,
}

impl BalancerMember {
    pub fn new(config: &MemberConfig, worker: Arc<AjpWorker>) -> Self {
        Self {
            worker,
            route: config.effective_route(),
            redirect: config.redirect.clone().unwrap_or_default(),
            domain: config.effective_domain(),
            distance: config.distance,
            activation: config.activation,
            state: MemberState::Idle,
            lb_factor: config.lb_factor,
            lb_mult: 1,
            lb_value: 0,
            busy: 0,
            max_busy: 0,
            error_time: None,
            elected: 0,
            errors: 0,
            sequence: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn worker(&self) -> &Arc<AjpWorker> {
        &self.worker
    }

    /// Active and not quarantined.
    pub fn is_usable(&self) -> bool {
        self.activation == Activation::Active && !self.state.is_quarantined()
    }

    /// Sets the route, deriving the domain from it when none is configured.
    pub fn set_route(&mut self, route: String) {
        if self.domain.is_empty() {
            self.domain = domain_of_route(&route);
        }
        self.route = route;
    }

    pub fn note_selected(&mut self) {
        self.elected += 1;
        self.busy += 1;
        self.max_busy = self.max_busy.max(self.busy);
    }

    pub fn note_finished(&mut self) {
        self.busy = self.busy.saturating_sub(1);
    }

    /// A request succeeded on this member.
    pub fn on_success(&mut self) {
        if matches!(
            self.state,
            MemberState::Idle | MemberState::Busy | MemberState::Recover
        ) {
            if self.state == MemberState::Recover {
                info!(member = %self.name(), "member recovered");
            }
            self.state = MemberState::Ok;
        }
    }

    /// The member's pool had no endpoint to spare.
    pub fn on_busy(&mut self) {
        if !self.state.is_quarantined() {
            self.state = MemberState::Busy;
        }
    }

    /// A request failed on this member.
    ///
    /// A member failing while in recovery escalates to FORCE once it has
    /// been failing for longer than `escalation`.
    pub fn on_failure(&mut self, now: SystemTime, escalation: Duration, reason: &str) {
        let failing_for = self
            .error_time
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or(Duration::ZERO);
        self.errors += 1;
        if self.state == MemberState::Recover && failing_for >= escalation {
            self.state = MemberState::Force;
        } else {
            self.state = MemberState::Error;
        }
        self.error_time = Some(now);
        warn!(
            member = %self.name(),
            state = %self.state,
            error_time = unix_secs(now),
            reason,
            "member quarantined"
        );
    }

    /// Moves a quarantined member to RECOVER once its window has passed.
    ///
    /// The window is `recover_wait` after an ERROR and half of it, at
    /// least one second, after a FORCE. Returns whether the state changed.
    pub fn try_recover(&mut self, now: SystemTime, recover_wait: Duration) -> bool {
        let window = match self.state {
            MemberState::Error => recover_wait,
            MemberState::Force => (recover_wait / 2).max(Duration::from_secs(1)),
            _ => return false,
        };
        let elapsed = self
            .error_time
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or(window);
        if elapsed < window {
            return false;
        }
        self.state = MemberState::Recover;
        info!(member = %self.name(), "member entering recovery");
        true
    }

    /// Whether the recovery window of an ERROR member has passed.
    pub fn recovery_due(&self, now: SystemTime, recover_wait: Duration) -> bool {
        self.state == MemberState::Error
            && self
                .error_time
                .and_then(|t| now.duration_since(t).ok())
                .map_or(true, |elapsed| elapsed >= recover_wait)
    }

    /// Clears counters and returns the member to IDLE.
    pub fn reset(&mut self) {
        self.state = MemberState::Idle;
        self.lb_value = 0;
        self.max_busy = self.busy;
        self.error_time = None;
        self.elected = 0;
        self.errors = 0;
    }

    pub fn to_record(&self, balancer: &str) -> MemberRecord {
        MemberRecord {
            balancer: balancer.to_string(),
            name: self.name().to_string(),
            route: self.route.clone(),
            domain: self.domain.clone(),
            redirect: self.redirect.clone(),
            distance: self.distance,
            activation: self.activation,
            state: self.state,
            lb_factor: self.lb_factor,
            lb_mult: self.lb_mult,
            lb_value: self.lb_value,
            busy: self.busy,
            max_busy: self.max_busy,
            error_time: self.error_time.map(unix_secs).unwrap_or(0),
            elected: self.elected,
            errors: self.errors,
            sequence: self.sequence,
        }
    }

    /// Adopts a record written elsewhere if it is newer than what this
    /// member last saw. Returns whether it was applied.
    pub fn apply_record(&mut self, record: &MemberRecord) -> bool {
        if record.sequence <= self.sequence {
            return false;
        }
        self.route = record.route.clone();
        self.domain = record.domain.clone();
        self.redirect = record.redirect.clone();
        self.distance = record.distance;
        self.activation = record.activation;
        self.state = record.state;
        self.lb_factor = record.lb_factor;
        self.lb_mult = record.lb_mult.max(1);
        self.lb_value = record.lb_value;
        self.busy = record.busy;
        self.max_busy = record.max_busy;
        self.error_time = (record.error_time > 0).then(|| UNIX_EPOCH + Duration::from_secs(record.error_time));
        self.elected = record.elected;
        self.errors = record.errors;
        self.sequence = record.sequence;
        true
    }
}

/// Greatest common divisor.
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple, saturating on overflow.
fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return a.max(b);
    }
    (a / gcd(a, b)).saturating_mul(b)
}

/// Recomputes every member's `lb_mult` from the current factors.
///
/// `lb_mult` is the least common multiple of all factors divided by the
/// member's own factor, so adding it per selection charges light members
/// more than heavy ones. A zero factor counts as one.
pub fn update_mult(members: &mut [BalancerMember]) {
    let factor = |m: &BalancerMember| m.lb_factor.max(1) as u64;
    let lcm = members.iter().map(factor).fold(1, lcm);
    for member in members.iter_mut() {
        member.lb_mult = (lcm / factor(member)).max(1);
    }
}

/// Moves the total factor of active members towards 100.
///
/// A deficit goes to zero-factor members if there are any, otherwise it
/// is spread over all of them; an excess is taken from every member that
/// can afford its share.
pub fn normalize_factors(members: &mut [BalancerMember]) {
    let active: Vec<usize> = members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.activation == Activation::Active)
        .map(|(i, _)| i)
        .collect();
    if active.is_empty() {
        return;
    }
    let sum: u64 = active.iter().map(|&i| u64::from(members[i].lb_factor)).sum();
    if sum < 100 {
        let zeros: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| members[i].lb_factor == 0)
            .collect();
        let targets = if zeros.is_empty() { active } else { zeros };
        // sum < 100 here, so the share fits a u32
        let share = ((100 - sum) / targets.len() as u64) as u32;
        for i in targets {
            members[i].lb_factor += share;
        }
    } else if sum > 100 {
        let share = (sum - 100) / active.len() as u64;
        for i in active {
            let factor = u64::from(members[i].lb_factor);
            if factor > share {
                members[i].lb_factor = (factor - share) as u32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use ajplb_common::RuntimeRegistry;

    fn member(name: &str, factor: u32) -> BalancerMember {
        let registry = Arc::new(RuntimeRegistry::in_memory());
        let worker = Arc::new(AjpWorker::new(WorkerConfig::new(name, "127.0.0.1", 8009), registry).unwrap());
        let mut config = MemberConfig::new(name);
        config.lb_factor = factor;
        BalancerMember::new(&config, worker)
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_defaults_from_config() {
        let mut config = MemberConfig::new("node1");
        config.route = Some("dc2.n1".into());
        let worker = member("node1", 1).worker().clone();
        let m = BalancerMember::new(&config, worker);
        assert_eq!(m.route, "dc2.n1");
        assert_eq!(m.domain, "dc2");
        assert_eq!(m.state, MemberState::Idle);
        assert!(m.is_usable());
    }

    #[test]
    fn test_mult_is_inverse_weight() {
        let mut members = vec![member("a", 70), member("b", 30)];
        update_mult(&mut members);
        assert_eq!(members[0].lb_mult, 3);
        assert_eq!(members[1].lb_mult, 7);

        let mut members = vec![member("a", 0), member("b", 4)];
        update_mult(&mut members);
        assert_eq!(members[0].lb_mult, 4);
        assert_eq!(members[1].lb_mult, 1);
    }

    #[test]
    fn test_normalize_spreads_deficit() {
        let mut members = vec![member("a", 1), member("b", 1)];
        normalize_factors(&mut members);
        assert_eq!(members[0].lb_factor, 50);
        assert_eq!(members[1].lb_factor, 50);
    }

    #[test]
    fn test_normalize_prefers_zero_factors() {
        let mut members = vec![member("a", 40), member("b", 0), member("c", 0)];
        normalize_factors(&mut members);
        assert_eq!(members[0].lb_factor, 40);
        assert_eq!(members[1].lb_factor, 30);
        assert_eq!(members[2].lb_factor, 30);
    }

    #[test]
    fn test_normalize_trims_excess() {
        let mut members = vec![member("a", 80), member("b", 80), member("c", 10)];
        normalize_factors(&mut members);
        // excess 70, share 23; c cannot afford it
        assert_eq!(members[0].lb_factor, 57);
        assert_eq!(members[1].lb_factor, 57);
        assert_eq!(members[2].lb_factor, 10);
    }

    #[test]
    fn test_normalize_large_factors() {
        let mut members = vec![member("a", u32::MAX), member("b", u32::MAX)];
        normalize_factors(&mut members);
        assert_eq!(members[0].lb_factor, 50);
        assert_eq!(members[1].lb_factor, 50);
    }

    #[test]
    fn test_normalize_ignores_inactive() {
        let mut members = vec![member("a", 50), member("b", 50), member("c", 7)];
        members[2].activation = Activation::Stopped;
        normalize_factors(&mut members);
        assert_eq!(members[0].lb_factor, 50);
        assert_eq!(members[2].lb_factor, 7);
    }

    #[test]
    fn test_error_recover_ok() {
        let mut m = member("a", 1);
        m.on_failure(at(100), Duration::from_secs(30), "refused");
        assert_eq!(m.state, MemberState::Error);
        assert!(!m.is_usable());

        assert!(!m.try_recover(at(159), Duration::from_secs(60)));
        assert!(m.try_recover(at(160), Duration::from_secs(60)));
        assert_eq!(m.state, MemberState::Recover);
        assert!(m.is_usable());

        m.on_success();
        assert_eq!(m.state, MemberState::Ok);
    }

    #[test]
    fn test_recover_failure_escalates_to_force() {
        let mut m = member("a", 1);
        m.on_failure(at(100), Duration::from_secs(30), "refused");
        m.try_recover(at(160), Duration::from_secs(60));
        m.on_failure(at(161), Duration::from_secs(30), "still refused");
        assert_eq!(m.state, MemberState::Force);
        assert_eq!(m.errors, 2);

        // forced members get half the window
        assert!(!m.try_recover(at(190), Duration::from_secs(60)));
        assert!(m.try_recover(at(191), Duration::from_secs(60)));
        assert_eq!(m.state, MemberState::Recover);
    }

    #[test]
    fn test_recover_failure_within_escalation_returns_to_error() {
        let mut m = member("a", 1);
        m.on_failure(at(100), Duration::from_secs(300), "refused");
        m.try_recover(at(160), Duration::from_secs(60));
        m.on_failure(at(170), Duration::from_secs(300), "refused");
        assert_eq!(m.state, MemberState::Error);
        assert_eq!(m.error_time, Some(at(170)));
    }

    #[test]
    fn test_busy_does_not_override_quarantine() {
        let mut m = member("a", 1);
        m.on_busy();
        assert_eq!(m.state, MemberState::Busy);
        assert!(m.is_usable());
        m.on_failure(at(1), Duration::from_secs(30), "x");
        m.on_busy();
        assert_eq!(m.state, MemberState::Error);
    }

    #[test]
    fn test_set_route_derives_domain_once() {
        let mut m = member("a", 1);
        m.set_route("dc1.a".into());
        assert_eq!(m.domain, "dc1");
        m.set_route("dc9.a".into());
        assert_eq!(m.domain, "dc1");
    }

    #[test]
    fn test_record_applies_only_when_newer() {
        let mut m = member("a", 1);
        let mut record = m.to_record("lb");
        record.lb_value = 42;
        record.state = MemberState::Error;
        record.error_time = 500;
        record.sequence = 3;
        assert!(m.apply_record(&record));
        assert_eq!(m.lb_value, 42);
        assert_eq!(m.error_time, Some(at(500)));

        record.lb_value = 1;
        assert!(!m.apply_record(&record));
        assert_eq!(m.lb_value, 42);
    }
}
