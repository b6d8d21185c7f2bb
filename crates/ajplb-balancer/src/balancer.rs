//! Session-sticky weighted load balancer over AJP workers.
//!
//! A [`Balancer`] owns an ordered list of [`BalancerMember`]s. Members are
//! addressed by their index in that list. Every request goes through
//! [`Balancer::service`], which selects a member, runs the exchange on its
//! worker and records the outcome, failing over to other members when the
//! failure allows it.
//!
//! # Selection
//!
//! 1. A session route is taken from the `;jsessionid=` path parameter or
//!    the session cookie. The member owning that route wins outright.
//! 2. Otherwise members are ranked by `(busy state, distance, load)` and
//!    the lowest rank wins; ties go to the lowest index.
//!
//! Load accounting follows the configured [`LbMethod`]. Each charged
//! selection adds the member's `lb_mult` to its `lb_value`, which makes
//! the long-run share of each member proportional to its `lb_factor`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::protocol::{ForwardRequest, ForwardResponse};
use ajplb_common::runtime::{unix_secs, BalancerRecord, SharedStore, StoreGuard};
use ajplb_common::{Activation, LbMethod, LockMode, MemberState, RuntimeRegistry};
use tracing::{debug, info, warn};

use crate::config::{BalancerConfig, MAX_LB_FACTOR};
use crate::member::{normalize_factors, update_mult, BalancerMember};
use crate::worker::{AjpWorker, BusyGuard, ExchangeFailure};

/// Slack allowed when deciding whether a maintenance pass is due.
const MAINTAIN_TOLERANCE_SECS: u64 = 2;

/// Runtime-adjustable balancer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerSettings {
    pub sticky_session: bool,
    pub sticky_session_force: bool,
    pub session_cookie: String,
    pub session_path: String,
    pub method: LbMethod,
    pub lock: LockMode,
    pub retries: u32,
    pub retry_interval_ms: u32,
    pub recover_wait_time_secs: u32,
    pub error_escalation_time_secs: u32,
    pub max_reply_timeouts: u32,
    pub maintain_time_secs: u32,
    pub timeout_ms: u64,
}

impl From<&BalancerConfig> for BalancerSettings {
    fn from(config: &BalancerConfig) -> Self {
        Self {
            sticky_session: config.sticky_session,
            sticky_session_force: config.sticky_session_force,
            session_cookie: config.session_cookie.clone(),
            session_path: config.session_path.clone(),
            method: config.method,
            lock: config.lock,
            retries: config.retries,
            retry_interval_ms: config.retry_interval_ms,
            recover_wait_time_secs: config.recover_wait_time_secs,
            error_escalation_time_secs: config.error_escalation_time_secs,
            max_reply_timeouts: config.max_reply_timeouts,
            maintain_time_secs: config.maintain_time_secs,
            timeout_ms: config.timeout_ms,
        }
    }
}

impl BalancerSettings {
    /// Never shorter than one second.
    pub fn recover_wait(&self) -> Duration {
        Duration::from_secs(self.recover_wait_time_secs.max(1) as u64)
    }

    pub fn error_escalation(&self) -> Duration {
        Duration::from_secs(self.error_escalation_time_secs as u64)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A live change to a balancer setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerUpdate {
    Retries(u32),
    RetryIntervalMs(u32),
    RecoverWaitTimeSecs(u32),
    ErrorEscalationTimeSecs(u32),
    MaxReplyTimeouts(u32),
    StickySession(bool),
    StickySessionForce(bool),
    Method(LbMethod),
    Lock(LockMode),
}

/// A live change to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberUpdate {
    Activation(Activation),
    /// Must be at least 1
    Factor(u32),
    Route(String),
    Redirect(String),
    Domain(String),
    Distance(u32),
}

/// The member chosen for one request.
#[derive(Debug, Clone)]
pub struct Selection {
    pub index: usize,
    pub worker: Arc<AjpWorker>,
    pub route: String,
    /// Chosen through the request's session route
    pub sticky: bool,
}

impl Selection {
    pub fn name(&self) -> &str {
        self.worker.name()
    }
}

/// What happened to a request on the selected member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes exchanged with the backend
    Success { bytes: u64 },
    /// The member's pool had no endpoint to spare
    Busy,
    /// The request itself was bad; the member is not blamed
    ClientError,
    /// The backend did not answer in time
    ReplyTimeout,
    Failure(String),
}

impl From<&ExchangeFailure> for Outcome {
    fn from(failure: &ExchangeFailure) -> Self {
        if failure.is_busy() {
            Outcome::Busy
        } else if failure.is_client_error() {
            Outcome::ClientError
        } else if failure.is_reply_timeout() {
            Outcome::ReplyTimeout
        } else {
            Outcome::Failure(failure.to_string())
        }
    }
}

/// Session routes carried by a request, most specific first.
///
/// The path parameter named by `session_path` comes first, then every
/// cookie named `session_cookie` in header order. A session id of the form
/// `<id>.<route>` yields `route`; an id without a dot is a route itself.
pub fn session_routes(request: &ForwardRequest, session_path: &str, session_cookie: &str) -> Vec<String> {
    let mut ids = Vec::new();
    if let Some(id) = path_session_id(&request.uri, session_path) {
        ids.push(id);
    }
    for header in request.cookies() {
        for pair in header.split([';', ',']) {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            if name.trim() == session_cookie {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    ids.push(value);
                }
            }
        }
    }
    ids.into_iter()
        .map(route_of_session)
        .filter(|route| !route.is_empty())
        .map(str::to_string)
        .collect()
}

fn route_of_session(id: &str) -> &str {
    id.split_once('.').map_or(id, |(_, route)| route)
}

fn path_session_id<'a>(uri: &'a str, session_path: &str) -> Option<&'a str> {
    let name = session_path.trim_start_matches(';');
    if name.is_empty() {
        return None;
    }
    let mut rest = uri;
    while let Some(pos) = rest.find(';') {
        rest = &rest[pos + 1..];
        let matches = rest
            .get(..name.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(name));
        if !matches {
            continue;
        }
        if let Some(value) = rest[name.len()..].strip_prefix('=') {
            let end = value.find([';', '?', '#', '/']).unwrap_or(value.len());
            if end > 0 {
                return Some(&value[..end]);
            }
        }
    }
    None
}

enum StickyMatch {
    /// A usable member serves the route
    Member(usize),
    /// The route names a domain rather than a member
    Domain(String),
    /// The route's member exists but cannot take the request
    Unusable { domain: String },
    None,
}

/// Resets the maintenance owner flag when the pass ends.
struct MaintainOwner<'a>(&'a AtomicBool);

impl Drop for MaintainOwner<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A named group of members sharing load and sessions.
pub struct Balancer {
    name: String,
    settings: RwLock<BalancerSettings>,
    members: Mutex<Vec<BalancerMember>>,
    registry: Arc<RuntimeRegistry>,
    busy: AtomicU32,
    max_busy: AtomicU32,
    last_maintain: AtomicU64,
    maintaining: AtomicBool,
    last_reset: AtomicU64,
    sequence: AtomicU64,
}

impl Balancer {
    /// Builds a balancer over already constructed workers.
    ///
    /// State found in the shared store (left by another process or a
    /// previous run) is adopted; otherwise the initial state is pushed.
    ///
    /// # Errors
    ///
    /// - `Config` if `config` does not validate
    /// - `UnknownWorker` if a member names a worker not in `workers`
    pub fn new(
        config: &BalancerConfig,
        workers: &HashMap<String, Arc<AjpWorker>>,
        registry: Arc<RuntimeRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let mut members = config
            .members
            .iter()
            .map(|mc| {
                workers
                    .get(&mc.worker)
                    .map(|w| BalancerMember::new(mc, Arc::clone(w)))
                    .ok_or_else(|| AjpError::UnknownWorker(mc.worker.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        update_mult(&mut members);

        let now = registry.unix_now();
        let balancer = Self {
            name: config.name.clone(),
            settings: RwLock::new(BalancerSettings::from(config)),
            members: Mutex::new(Vec::new()),
            busy: AtomicU32::new(0),
            max_busy: AtomicU32::new(0),
            last_maintain: AtomicU64::new(now),
            maintaining: AtomicBool::new(false),
            last_reset: AtomicU64::new(now),
            sequence: AtomicU64::new(0),
            registry,
        };

        let store = balancer.registry.store();
        for member in members.iter_mut() {
            match store.pull_member(&balancer.name, member.name()) {
                Some(record) => {
                    member.apply_record(&record);
                }
                None => member.sequence = store.push_member(&member.to_record(&balancer.name)),
            }
        }
        *balancer.members() = members;
        if !balancer.sync_from_store() {
            balancer.push_state();
        }
        info!(balancer = %balancer.name, members = config.members.len(), "balancer created");
        Ok(balancer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> BalancerSettings {
        self.settings.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn members(&self) -> MutexGuard<'_, Vec<BalancerMember>> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn max_busy(&self) -> u32 {
        self.max_busy.load(Ordering::Relaxed)
    }

    pub fn last_maintain(&self) -> u64 {
        self.last_maintain.load(Ordering::Relaxed)
    }

    pub fn last_reset(&self) -> u64 {
        self.last_reset.load(Ordering::Relaxed)
    }

    // --- selection ---

    /// Picks a member for `request` without waiting.
    ///
    /// Members listed in `exclude` are skipped. Returns `Ok(None)` when no
    /// member is usable right now.
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` when the request's session member cannot serve
    /// it and sticky sessions are forced.
    pub fn try_select(&self, request: &ForwardRequest, exclude: &[usize]) -> Result<Option<Selection>> {
        self.sync_from_store();
        let settings = self.settings();
        let now = self.registry.now();
        let store = Arc::clone(self.registry.store());
        let _guard = store_guard(settings.lock, &store);
        let mut members = self.members();
        self.pull_members(&mut members);
        self.recover_due(&mut members, now, &settings);

        let routes = if settings.sticky_session {
            session_routes(request, &settings.session_path, &settings.session_cookie)
        } else {
            Vec::new()
        };
        let mut preferred_domain = None;
        if !routes.is_empty() {
            let unavailable = |route: &str| {
                AjpError::ServiceUnavailable(format!(
                    "balancer '{}': session route '{}' is not available",
                    self.name, route
                ))
            };
            match find_sticky(&members, &routes, exclude) {
                StickyMatch::Member(index) => {
                    return Ok(Some(self.elect(&mut members, index, true, &settings)));
                }
                StickyMatch::Domain(domain) => {
                    if let Some(index) = best_candidate(&members, settings.method, exclude, Some(&domain), true) {
                        return Ok(Some(self.elect(&mut members, index, true, &settings)));
                    }
                    if settings.sticky_session_force {
                        return Err(unavailable(&routes[0]));
                    }
                }
                StickyMatch::Unusable { domain } => {
                    if settings.sticky_session_force {
                        return Err(unavailable(&routes[0]));
                    }
                    if !domain.is_empty() {
                        preferred_domain = Some(domain);
                    }
                }
                StickyMatch::None => {
                    if settings.sticky_session_force {
                        return Err(unavailable(&routes[0]));
                    }
                }
            }
        }

        Ok(
            best_candidate(&members, settings.method, exclude, preferred_domain.as_deref(), false)
                .map(|index| self.elect(&mut members, index, false, &settings)),
        )
    }

    /// Picks a member, waiting up to the balancer timeout for one to
    /// become usable.
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` when no member could be selected.
    pub async fn select(&self, request: &ForwardRequest, exclude: &[usize]) -> Result<Selection> {
        let timeout = self.settings().timeout();
        let step = (timeout / 100).max(Duration::from_millis(1));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(selection) = self.try_select(request, exclude)? {
                return Ok(selection);
            }
            if tokio::time::Instant::now() + step > deadline {
                return Err(AjpError::ServiceUnavailable(format!(
                    "balancer '{}' has no usable member",
                    self.name
                )));
            }
            tokio::time::sleep(step).await;
        }
    }

    /// Charges a selection and returns it.
    fn elect(
        &self,
        members: &mut [BalancerMember],
        index: usize,
        sticky: bool,
        settings: &BalancerSettings,
    ) -> Selection {
        let member = &mut members[index];
        member.note_selected();
        let charge = match settings.method {
            LbMethod::Requests | LbMethod::Busyness => true,
            LbMethod::Sessions => !sticky,
            LbMethod::Traffic => false,
        };
        if charge {
            member.lb_value = member.lb_value.saturating_add(member.lb_mult);
        }
        self.push_member(member);
        debug!(balancer = %self.name, member = %member.name(), sticky, lb_value = member.lb_value, "member selected");
        Selection {
            index,
            worker: Arc::clone(member.worker()),
            route: member.route.clone(),
            sticky,
        }
    }

    /// Applies the result of a request to the selected member.
    pub fn record_outcome(&self, selection: &Selection, outcome: &Outcome) {
        let settings = self.settings();
        let now = self.registry.now();
        let store = Arc::clone(self.registry.store());
        let _guard = store_guard(settings.lock, &store);
        let mut members = self.members();
        let Some(member) = members.get_mut(selection.index) else {
            return;
        };
        if let Some(record) = store.pull_member(&self.name, member.name()) {
            member.apply_record(&record);
        }
        member.note_finished();
        match outcome {
            Outcome::Success { bytes } => {
                member.on_success();
                if settings.method == LbMethod::Traffic {
                    member.lb_value = member
                        .lb_value
                        .saturating_add(bytes.saturating_mul(member.lb_mult));
                }
            }
            Outcome::Busy => member.on_busy(),
            Outcome::ClientError => {}
            Outcome::ReplyTimeout => {
                let timeouts = member.worker().reply_timeouts();
                if timeouts > settings.max_reply_timeouts {
                    member.on_failure(
                        now,
                        settings.error_escalation(),
                        &format!("{} reply timeouts", timeouts),
                    );
                }
            }
            Outcome::Failure(reason) => member.on_failure(now, settings.error_escalation(), reason),
        }
        self.push_member(member);
    }

    /// Forwards `request` to a member, failing over on recoverable errors.
    ///
    /// Up to `1 + retries` members are tried, each at most once, with
    /// `retry_interval_ms` between attempts.
    ///
    /// # Errors
    ///
    /// Only `ServiceUnavailable`.
    pub async fn service(&self, request: &ForwardRequest) -> Result<ForwardResponse> {
        self.maintain(self.registry.now());
        let settings = self.settings();
        let _busy = BusyGuard::enter(&self.busy, &self.max_busy);

        let mut routed = request.clone();
        let mut tried = Vec::new();
        let mut last_failure: Option<String> = None;
        for attempt in 0..=settings.retries {
            if attempt > 0 {
                tokio::time::sleep(settings.retry_interval()).await;
            }
            let selection = match self.select(request, &tried).await {
                Ok(selection) => selection,
                Err(e) => {
                    return Err(match last_failure {
                        Some(failure) => AjpError::ServiceUnavailable(format!(
                            "balancer '{}': no member left after failure: {}",
                            self.name, failure
                        )),
                        None => e,
                    })
                }
            };
            tried.push(selection.index);
            routed.route = (!selection.route.is_empty()).then(|| selection.route.clone());

            match selection.worker.service(&routed).await {
                Ok(served) => {
                    self.record_outcome(&selection, &Outcome::Success { bytes: served.bytes });
                    return Ok(served.response);
                }
                Err(failure) => {
                    self.record_outcome(&selection, &Outcome::from(&failure));
                    if !failure.recoverable {
                        warn!(balancer = %self.name, member = %selection.name(), error = %failure, "unrecoverable failure, not failing over");
                        return Err(AjpError::ServiceUnavailable(format!(
                            "member '{}' failed: {}",
                            selection.name(),
                            failure
                        )));
                    }
                    debug!(balancer = %self.name, member = %selection.name(), attempt, error = %failure, "failing over");
                    last_failure = Some(format!("member '{}': {}", selection.name(), failure));
                }
            }
        }
        Err(AjpError::ServiceUnavailable(format!(
            "balancer '{}' gave up after {} attempt(s); last failure: {}",
            self.name,
            tried.len(),
            last_failure.unwrap_or_default()
        )))
    }

    // --- maintenance ---

    /// Runs a maintenance pass if one is due. Returns whether it ran.
    ///
    /// Per elapsed interval `lb_value` and the workers' reply timeout
    /// counters are halved. Quarantined members whose window passed move
    /// to RECOVER, factors are renormalized and idle endpoints evicted.
    pub fn maintain(&self, now: SystemTime) -> bool {
        let settings = self.settings();
        let now_secs = unix_secs(now);
        let interval = settings.maintain_time_secs as u64;
        let elapsed = now_secs.saturating_sub(self.last_maintain.load(Ordering::Acquire));
        if elapsed + MAINTAIN_TOLERANCE_SECS < interval {
            return false;
        }
        if self
            .maintaining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _owner = MaintainOwner(&self.maintaining);
        let intervals = elapsed.checked_div(interval).unwrap_or(1).clamp(1, 63) as u32;

        let workers: Vec<Arc<AjpWorker>> = {
            let store = Arc::clone(self.registry.store());
            let _guard = store_guard(settings.lock, &store);
            let mut members = self.members();
            self.pull_members(&mut members);
            for member in members.iter_mut() {
                member.lb_value >>= intervals;
                if member.state == MemberState::Busy {
                    member.state = MemberState::Ok;
                }
            }
            self.recover_due(&mut members, now, &settings);
            normalize_factors(&mut members);
            update_mult(&mut members);
            for member in members.iter_mut() {
                self.push_member(member);
            }
            let workers = members.iter().map(|m| Arc::clone(m.worker())).collect();
            workers
        };

        self.last_maintain.store(now_secs, Ordering::Release);
        self.push_state();
        for worker in &workers {
            worker.decay_reply_timeouts(intervals);
            worker.maintain(now);
        }
        debug!(balancer = %self.name, intervals, "maintenance pass finished");
        true
    }

    /// Moves ERROR/FORCE members whose window passed to RECOVER.
    ///
    /// Outside BUSYNESS a recovered member starts at the highest current
    /// `lb_value` so it rejoins at its normal share.
    fn recover_due(&self, members: &mut [BalancerMember], now: SystemTime, settings: &BalancerSettings) {
        let max_value = max_lb_value(members);
        for member in members.iter_mut() {
            if member.try_recover(now, settings.recover_wait()) {
                if settings.method != LbMethod::Busyness {
                    member.lb_value = max_value;
                }
                member.worker().lift_quarantine();
                self.push_member(member);
            }
        }
    }

    /// ERROR members due for an active probe, switched to PROBE.
    pub fn begin_probes(&self, now: SystemTime) -> Vec<(usize, Arc<AjpWorker>)> {
        let settings = self.settings();
        let mut members = self.members();
        let mut due = Vec::new();
        for (index, member) in members.iter_mut().enumerate() {
            if member.activation != Activation::Stopped && member.recovery_due(now, settings.recover_wait()) {
                member.state = MemberState::Probe;
                self.push_member(member);
                due.push((index, Arc::clone(member.worker())));
            }
        }
        due
    }

    /// Ends a probe started by [`begin_probes`](Self::begin_probes).
    pub fn finish_probe(&self, index: usize, ok: bool) {
        let now = self.registry.now();
        let method = self.settings().method;
        let mut members = self.members();
        let max_value = max_lb_value(&members);
        let Some(member) = members.get_mut(index) else {
            return;
        };
        if member.state != MemberState::Probe {
            return;
        }
        if ok {
            member.state = MemberState::Recover;
            if method != LbMethod::Busyness {
                member.lb_value = max_value;
            }
            member.worker().lift_quarantine();
            info!(balancer = %self.name, member = %member.name(), "probe succeeded, member entering recovery");
        } else {
            member.state = MemberState::Error;
            member.error_time = Some(now);
            warn!(balancer = %self.name, member = %member.name(), error_time = unix_secs(now), "probe failed");
        }
        self.push_member(member);
    }

    // --- administration ---

    /// Snapshot of every member, refreshed from the shared store.
    pub fn member_snapshot(&self) -> Vec<BalancerMember> {
        let mut members = self.members();
        self.pull_members(&mut members);
        members.clone()
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members().iter().position(|m| m.name() == name)
    }

    pub fn workers(&self) -> Vec<Arc<AjpWorker>> {
        self.members().iter().map(|m| Arc::clone(m.worker())).collect()
    }

    pub fn apply_update(&self, update: BalancerUpdate) -> Result<()> {
        {
            let mut s = self.settings.write().unwrap_or_else(|p| p.into_inner());
            match update {
                BalancerUpdate::Retries(v) => s.retries = v,
                BalancerUpdate::RetryIntervalMs(v) => s.retry_interval_ms = v,
                BalancerUpdate::RecoverWaitTimeSecs(v) => {
                    if v == 0 {
                        return Err(AjpError::Config("recover_wait_time_secs must be at least 1".into()));
                    }
                    s.recover_wait_time_secs = v;
                }
                BalancerUpdate::ErrorEscalationTimeSecs(v) => s.error_escalation_time_secs = v,
                BalancerUpdate::MaxReplyTimeouts(v) => s.max_reply_timeouts = v,
                BalancerUpdate::StickySession(v) => s.sticky_session = v,
                BalancerUpdate::StickySessionForce(v) => s.sticky_session_force = v,
                BalancerUpdate::Method(v) => s.method = v,
                BalancerUpdate::Lock(v) => s.lock = v,
            }
        }
        info!(balancer = %self.name, "balancer settings updated");
        self.push_state();
        Ok(())
    }

    /// Applies a change to the member at `index`.
    ///
    /// # Errors
    ///
    /// - `UnknownWorker` if there is no such member
    /// - `Config` if the value is invalid; nothing is changed then
    pub fn apply_member_update(&self, index: usize, update: MemberUpdate) -> Result<()> {
        let mut members = self.members();
        let max_value = max_lb_value(&members);
        let member = members
            .get_mut(index)
            .ok_or_else(|| AjpError::UnknownWorker(format!("{}[{}]", self.name, index)))?;
        let mut remult = false;
        match update {
            MemberUpdate::Activation(activation) => {
                if activation != member.activation {
                    member.activation = activation;
                    member.lb_value = max_value;
                }
            }
            MemberUpdate::Factor(factor) => {
                if factor == 0 || factor > MAX_LB_FACTOR {
                    return Err(AjpError::Config(format!(
                        "member '{}': lb_factor must be between 1 and {}",
                        member.name(),
                        MAX_LB_FACTOR
                    )));
                }
                member.lb_factor = factor;
                remult = true;
            }
            MemberUpdate::Route(route) => member.set_route(route),
            MemberUpdate::Redirect(redirect) => member.redirect = redirect,
            MemberUpdate::Domain(domain) => member.domain = domain,
            MemberUpdate::Distance(distance) => member.distance = distance,
        }
        info!(balancer = %self.name, member = %member.name(), "member updated");
        if remult {
            update_mult(&mut members);
            for member in members.iter_mut() {
                self.push_member(member);
            }
        } else {
            self.push_member(&mut members[index]);
        }
        Ok(())
    }

    /// Resets the balancer, all members and their workers.
    pub fn reset(&self) {
        {
            let mut members = self.members();
            for member in members.iter_mut() {
                member.reset();
                member.worker().reset();
                self.push_member(member);
            }
        }
        self.max_busy.store(self.busy(), Ordering::Relaxed);
        self.last_reset.store(self.registry.unix_now(), Ordering::Relaxed);
        info!(balancer = %self.name, "balancer reset");
        self.push_state();
    }

    pub fn reset_member(&self, index: usize) -> Result<()> {
        let mut members = self.members();
        let member = members
            .get_mut(index)
            .ok_or_else(|| AjpError::UnknownWorker(format!("{}[{}]", self.name, index)))?;
        member.reset();
        member.worker().reset();
        self.push_member(member);
        Ok(())
    }

    /// Puts a quarantined member back into RECOVER right away.
    ///
    /// # Errors
    ///
    /// `Config` unless the member is in ERROR, FORCE or PROBE.
    pub fn recover_member(&self, index: usize) -> Result<()> {
        let method = self.settings().method;
        let mut members = self.members();
        let max_value = max_lb_value(&members);
        let member = members
            .get_mut(index)
            .ok_or_else(|| AjpError::UnknownWorker(format!("{}[{}]", self.name, index)))?;
        if !member.state.is_quarantined() {
            return Err(AjpError::Config(format!(
                "member '{}' is {} and cannot be recovered",
                member.name(),
                member.state
            )));
        }
        if method != LbMethod::Busyness {
            member.lb_value = max_value;
        }
        member.worker().clear_reply_timeouts();
        member.worker().lift_quarantine();
        member.state = MemberState::Recover;
        info!(balancer = %self.name, member = %member.name(), "member recovery forced");
        self.push_member(member);
        Ok(())
    }

    // --- shared state ---

    fn push_member(&self, member: &mut BalancerMember) {
        member.sequence = self.registry.store().push_member(&member.to_record(&self.name));
    }

    fn pull_members(&self, members: &mut [BalancerMember]) {
        let store = self.registry.store();
        for member in members.iter_mut() {
            if let Some(record) = store.pull_member(&self.name, member.name()) {
                member.apply_record(&record);
            }
        }
    }

    pub fn to_record(&self) -> BalancerRecord {
        let s = self.settings();
        BalancerRecord {
            name: self.name.clone(),
            busy: self.busy(),
            max_busy: self.max_busy(),
            sticky_session: s.sticky_session,
            sticky_session_force: s.sticky_session_force,
            method: s.method,
            lock: s.lock,
            retries: s.retries,
            retry_interval_ms: s.retry_interval_ms,
            recover_wait_time: s.recover_wait_time_secs,
            error_escalation_time: s.error_escalation_time_secs,
            max_reply_timeouts: s.max_reply_timeouts,
            last_reset: self.last_reset(),
            last_maintain: self.last_maintain(),
            sequence: self.sequence.load(Ordering::Acquire),
        }
    }

    pub fn push_state(&self) {
        let sequence = self.registry.store().push_balancer(&self.to_record());
        self.sequence.store(sequence, Ordering::Release);
    }

    /// Adopts newer settings written by another process. Returns whether
    /// anything was applied.
    pub fn sync_from_store(&self) -> bool {
        let Some(record) = self.registry.store().pull_balancer(&self.name) else {
            return false;
        };
        if record.sequence <= self.sequence.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut s = self.settings.write().unwrap_or_else(|p| p.into_inner());
            s.sticky_session = record.sticky_session;
            s.sticky_session_force = record.sticky_session_force;
            s.method = record.method;
            s.lock = record.lock;
            s.retries = record.retries;
            s.retry_interval_ms = record.retry_interval_ms;
            s.recover_wait_time_secs = record.recover_wait_time;
            s.error_escalation_time_secs = record.error_escalation_time;
            s.max_reply_timeouts = record.max_reply_timeouts;
        }
        self.last_reset.store(record.last_reset, Ordering::Relaxed);
        self.last_maintain.fetch_max(record.last_maintain, Ordering::AcqRel);
        self.sequence.store(record.sequence, Ordering::Release);
        debug!(balancer = %self.name, sequence = record.sequence, "balancer settings pulled from shared store");
        true
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("name", &self.name)
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}

fn max_lb_value(members: &[BalancerMember]) -> u64 {
    members.iter().map(|m| m.lb_value).max().unwrap_or(0)
}

/// Takes the coarse store lock when the balancer runs pessimistically.
fn store_guard(lock: LockMode, store: &Arc<dyn SharedStore>) -> Option<StoreGuard<'_>> {
    (lock == LockMode::Pessimistic).then(|| store.lock())
}

/// Resolves session routes to a member, following one redirect hop.
fn find_sticky(members: &[BalancerMember], routes: &[String], exclude: &[usize]) -> StickyMatch {
    let usable = |i: usize| members[i].is_usable() && !exclude.contains(&i);
    for route in routes {
        if let Some(index) = members.iter().position(|m| m.route == *route) {
            if usable(index) {
                return StickyMatch::Member(index);
            }
            let member = &members[index];
            if !member.redirect.is_empty() {
                let target = members
                    .iter()
                    .position(|m| m.route == member.redirect || m.name() == member.redirect);
                if let Some(target) = target.filter(|&t| usable(t)) {
                    debug!(member = %member.name(), redirect = %member.redirect, "following session redirect");
                    return StickyMatch::Member(target);
                }
            }
            return StickyMatch::Unusable {
                domain: member.domain.clone(),
            };
        }
        if members.iter().any(|m| !m.domain.is_empty() && m.domain == *route) {
            return StickyMatch::Domain(route.clone());
        }
    }
    StickyMatch::None
}

/// Index of the least loaded usable member.
///
/// With a `domain`, members of that domain are considered first; when
/// `strict` is set nobody else is.
fn best_candidate(
    members: &[BalancerMember],
    method: LbMethod,
    exclude: &[usize],
    domain: Option<&str>,
    strict: bool,
) -> Option<usize> {
    let pick = |in_domain: Option<&str>| {
        members
            .iter()
            .enumerate()
            .filter(|(i, m)| m.is_usable() && !exclude.contains(i))
            .filter(|(_, m)| in_domain.map_or(true, |d| m.domain == d))
            .min_by_key(|(_, m)| rank(m, method))
            .map(|(i, _)| i)
    };
    match domain {
        Some(d) => pick(Some(d)).or_else(|| if strict { None } else { pick(None) }),
        None => pick(None),
    }
}

fn rank(member: &BalancerMember, method: LbMethod) -> (bool, u32, u64, u64) {
    let load = match method {
        LbMethod::Busyness => (member.busy as u64).saturating_mul(member.lb_mult),
        _ => member.lb_value,
    };
    (member.state == MemberState::Busy, member.distance, load, member.lb_value)
}
