use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ajplb_common::protocol::codes::{AJP13_SW_HEADER, JK_AJP13_CPONG_REPLY};
use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::protocol::request::{encode_body_chunk, encode_cping, max_body_chunk};
use ajplb_common::protocol::{ForwardRequest, ForwardResponse, ReplyPacket};
use ajplb_common::runtime::{unix_secs, WorkerRecord};
use ajplb_common::transport::TcpTransport;
use ajplb_common::{RuntimeRegistry, WorkerState};
use ajplb_pool::{ConnectionPool, Endpoint};
use tracing::{debug, info, warn};

use crate::config::{recovery, PingMode, WorkerConfig};

/// Upper bound of the computed quarantine interval.
pub const MAX_RETRY_INTERVAL_SECS: u64 = 3600;

/// How far an exchange got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// The request could not be encoded
    Prepare,
    /// No endpoint was available in the pool
    Acquire,
    /// Connecting or the pre-request CPING failed
    Connect,
    /// Writing the request failed
    Send,
    /// The request was sent, no headers arrived yet
    Reply,
    /// Headers arrived, the body did not complete
    Body,
}

/// A failed exchange with one worker.
#[derive(Debug)]
pub struct ExchangeFailure {
    pub error: AjpError,
    pub phase: ExchangePhase,
    /// Whether another member may still be tried for the same request
    pub recoverable: bool,
}

impl ExchangeFailure {
    /// Pool backpressure rather than a backend fault.
    pub fn is_busy(&self) -> bool {
        self.phase == ExchangePhase::Acquire
    }

    /// The backend did not answer within the reply timeout.
    pub fn is_reply_timeout(&self) -> bool {
        self.error.is_timeout() && matches!(self.phase, ExchangePhase::Reply | ExchangePhase::Body)
    }

    /// The request itself was at fault, not the backend.
    pub fn is_client_error(&self) -> bool {
        self.phase == ExchangePhase::Prepare
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (phase {:?})", self.error, self.phase)
    }
}

/// A completed exchange.
#[derive(Debug, Clone)]
pub struct Served {
    pub response: ForwardResponse,
    /// Bytes written to and read from the backend, headers included
    pub bytes: u64,
}

/// Whether a failure in `phase` still allows failover under `options`.
pub fn is_recoverable(options: u32, phase: ExchangePhase, request: &ForwardRequest) -> bool {
    match phase {
        ExchangePhase::Prepare => false,
        ExchangePhase::Acquire | ExchangePhase::Connect | ExchangePhase::Send => true,
        ExchangePhase::Reply | ExchangePhase::Body => {
            if (request.is_head() && options & recovery::ALWAYS_HTTP_HEAD != 0)
                || (request.is_get() && options & recovery::ALWAYS_HTTP_GET != 0)
            {
                return true;
            }
            let abort = match phase {
                ExchangePhase::Reply => recovery::ABORT_IF_TCGETREQUEST,
                _ => recovery::ABORT_IF_TCGETREQUEST | recovery::ABORT_IF_TCSENDHEADER,
            };
            options & abort == 0
        }
    }
}

/// Quarantine interval after `retries` failed re-tests.
///
/// An explicit `retry_secs` wins; otherwise the interval grows by a
/// minute per re-test up to [`MAX_RETRY_INTERVAL_SECS`].
pub fn quarantine_interval(retry_secs: Option<u64>, retries: u32) -> Duration {
    let secs = match retry_secs {
        Some(secs) => secs,
        None => (60 + 60 * retries as u64).min(MAX_RETRY_INTERVAL_SECS),
    };
    Duration::from_secs(secs)
}

/// A live change to a worker's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerUpdate {
    Host(String),
    Port(u16),
    CacheTimeoutSecs(u64),
    PingMode(PingMode),
    ConnectTimeoutMs(u64),
    PrepostTimeoutMs(u64),
    ReplyTimeoutMs(u64),
    Retries(u32),
    RetryIntervalMs(u64),
    RecoveryOptions(u32),
    MaxPacketSize(usize),
}

#[derive(Debug, Default)]
struct Health {
    in_error: bool,
    error_time: Option<SystemTime>,
    /// Re-tests since the last successful connect
    retries: u32,
}

#[derive(Debug, Default)]
struct Counters {
    busy: AtomicU32,
    max_busy: AtomicU32,
    used: AtomicU64,
    readed: AtomicU64,
    transferred: AtomicU64,
    errors: AtomicU32,
    client_errors: AtomicU32,
    reply_timeouts: AtomicU32,
}

/// Counts one in-flight request for as long as it lives.
pub(crate) struct BusyGuard<'a> {
    busy: &'a AtomicU32,
}

impl<'a> BusyGuard<'a> {
    pub(crate) fn enter(busy: &'a AtomicU32, max_busy: &AtomicU32) -> Self {
        let now = busy.fetch_add(1, Ordering::Relaxed) + 1;
        max_busy.fetch_max(now, Ordering::Relaxed);
        Self { busy }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .busy
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// One AJP13 backend together with its endpoint pool.
///
/// Holds the static configuration, the cached resolved addresses, the
/// error quarantine bookkeeping and the runtime counters mirrored into the
/// shared store. All methods take `&self`; a worker is shared as
/// `Arc<AjpWorker>` between balancers, the maintainer and the status
/// interface.
pub struct AjpWorker {
    name: String,
    config: RwLock<WorkerConfig>,
    pool: ConnectionPool,
    registry: Arc<RuntimeRegistry>,
    health: Mutex<Health>,
    addrs: RwLock<Option<Vec<SocketAddr>>>,
    addr_sequence: AtomicU32,
    probing: AtomicBool,
    counters: Counters,
    last_reset: AtomicU64,
    last_maintain: AtomicU64,
    sequence: AtomicU64,
}

impl AjpWorker {
    /// Creates a worker. Nothing is resolved or connected yet.
    ///
    /// # Errors
    ///
    /// `Config` if `config` does not validate.
    pub fn new(config: WorkerConfig, registry: Arc<RuntimeRegistry>) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(config.name.clone(), config.pool_config(), Arc::clone(&registry));
        let now = registry.unix_now();
        Ok(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            pool,
            health: Mutex::new(Health::default()),
            addrs: RwLock::new(None),
            addr_sequence: AtomicU32::new(0),
            probing: AtomicBool::new(false),
            counters: Counters::default(),
            last_reset: AtomicU64::new(now),
            last_maintain: AtomicU64::new(now),
            sequence: AtomicU64::new(0),
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> WorkerConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Applies a live configuration change.
    ///
    /// The change is validated as a whole; on error the previous
    /// configuration stays in place.
    pub fn apply_update(&self, update: WorkerUpdate) -> Result<()> {
        let mut invalidate = false;
        {
            let mut guard = self.config.write().unwrap_or_else(|p| p.into_inner());
            let mut next = guard.clone();
            match &update {
                WorkerUpdate::Host(host) => {
                    invalidate = *host != next.host;
                    next.host = host.clone();
                }
                WorkerUpdate::Port(port) => {
                    invalidate = *port != next.port;
                    next.port = *port;
                }
                WorkerUpdate::CacheTimeoutSecs(secs) => next.cache_timeout_secs = *secs,
                WorkerUpdate::PingMode(mode) => next.ping_mode = *mode,
                WorkerUpdate::ConnectTimeoutMs(ms) => next.connect_timeout_ms = *ms,
                WorkerUpdate::PrepostTimeoutMs(ms) => next.prepost_timeout_ms = *ms,
                WorkerUpdate::ReplyTimeoutMs(ms) => next.reply_timeout_ms = *ms,
                WorkerUpdate::Retries(n) => next.retries = *n,
                WorkerUpdate::RetryIntervalMs(ms) => next.retry_interval_ms = *ms,
                WorkerUpdate::RecoveryOptions(opts) => next.recovery_options = *opts,
                WorkerUpdate::MaxPacketSize(size) => next.max_packet_size = *size,
            }
            next.validate()?;
            if let WorkerUpdate::CacheTimeoutSecs(_) = update {
                self.pool.set_idle_timeout(next.cache_idle_timeout());
            }
            *guard = next;
        }
        info!(worker = %self.name, ?update, "worker configuration updated");
        if invalidate {
            self.invalidate_address();
        }
        self.push_state();
        Ok(())
    }

    // --- addresses ---

    pub fn addr_sequence(&self) -> u32 {
        self.addr_sequence.load(Ordering::Acquire)
    }

    /// Addresses of the backend, resolved once and then cached.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if let Some(addrs) = self.addrs.read().unwrap_or_else(|p| p.into_inner()).as_ref() {
            return Ok(addrs.clone());
        }
        let (host, port) = {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            (config.host.clone(), config.port)
        };
        let addrs = TcpTransport::resolve(&host, port).await?;
        debug!(worker = %self.name, %host, port, count = addrs.len(), "resolved backend address");
        *self.addrs.write().unwrap_or_else(|p| p.into_inner()) = Some(addrs.clone());
        Ok(addrs)
    }

    /// Forgets the resolved addresses.
    ///
    /// Idle sockets are closed and sockets in use are reconnected on
    /// their next use.
    pub fn invalidate_address(&self) {
        *self.addrs.write().unwrap_or_else(|p| p.into_inner()) = None;
        let sequence = self.addr_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let closed = self.pool.close_idle();
        info!(worker = %self.name, sequence, closed, "backend address invalidated");
    }

    // --- quarantine ---

    pub fn is_in_error(&self) -> bool {
        self.health().in_error
    }

    pub fn error_time(&self) -> Option<SystemTime> {
        self.health().error_time
    }

    pub fn retries(&self) -> u32 {
        self.health().retries
    }

    /// Current quarantine interval.
    pub fn retry_interval(&self) -> Duration {
        let retry_secs = self.config.read().unwrap_or_else(|p| p.into_inner()).retry_secs;
        quarantine_interval(retry_secs, self.health().retries)
    }

    /// Whether the worker may be tried at `now`.
    ///
    /// A worker in error is re-admitted once its quarantine interval has
    /// passed; each such re-test counts towards the next, longer interval.
    pub fn try_retry(&self, now: SystemTime) -> bool {
        let retry_secs = self.config.read().unwrap_or_else(|p| p.into_inner()).retry_secs;
        let mut health = self.health();
        if !health.in_error {
            return true;
        }
        let interval = quarantine_interval(retry_secs, health.retries);
        let elapsed = health
            .error_time
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or(Duration::ZERO);
        if elapsed < interval {
            return false;
        }
        health.retries = health.retries.saturating_add(1);
        health.in_error = false;
        info!(worker = %self.name, retries = health.retries, "retrying worker after quarantine");
        true
    }

    /// Flags the worker in error, keeping the original error time if it
    /// already was.
    pub fn mark_error(&self, now: SystemTime, reason: &AjpError) {
        {
            let mut health = self.health();
            if health.in_error {
                return;
            }
            health.in_error = true;
            health.error_time = Some(now);
        }
        warn!(worker = %self.name, error_time = unix_secs(now), reason = %reason, "worker in error state");
        self.push_state();
    }

    /// Ends the quarantine without resetting the retry count.
    pub fn lift_quarantine(&self) {
        let lifted = {
            let mut health = self.health();
            std::mem::replace(&mut health.in_error, false)
        };
        if lifted {
            info!(worker = %self.name, "worker quarantine lifted");
            self.push_state();
        }
    }

    /// Clears the error state after a successful connect.
    pub fn clear_error(&self) {
        let was_error = {
            let mut health = self.health();
            let was = health.in_error || health.retries > 0;
            *health = Health::default();
            was
        };
        if was_error {
            info!(worker = %self.name, "worker recovered");
            self.push_state();
        }
    }

    pub fn state(&self) -> WorkerState {
        if self.probing.load(Ordering::Relaxed) {
            WorkerState::Probe
        } else if self.is_in_error() {
            WorkerState::Error
        } else if self.counters.used.load(Ordering::Relaxed) == 0 {
            WorkerState::Idle
        } else {
            WorkerState::Ok
        }
    }

    // --- connection level ---

    /// Makes sure `ep` carries a live socket to this worker.
    ///
    /// A pooled socket is reused unless the peer closed it or the address
    /// changed since it was opened. Otherwise every resolved address is
    /// tried in order. Failure flags the worker in error; success clears
    /// the error and the retry count.
    pub async fn connect(&self, ep: &mut Endpoint) -> Result<()> {
        let sequence = self.addr_sequence();
        if ep.is_connected() {
            if ep.addr_sequence() != sequence {
                ep.close();
            } else if ep.check_alive() {
                return Ok(());
            }
        }

        let (opts, ping_timeout) = {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            (config.socket_options(), config.connect_ping_timeout())
        };
        let connected = match self.resolve().await {
            Ok(addrs) => TcpTransport::connect_any(&addrs, &opts).await,
            Err(e) => Err(e),
        };
        match connected {
            Ok((stream, peer)) => {
                debug!(worker = %self.name, endpoint = ep.id(), %peer, "connected to backend");
                ep.attach(stream, peer, sequence);
            }
            Err(e) => {
                ep.record_error(&e);
                self.mark_error(self.registry.now(), &e);
                return Err(e);
            }
        }

        if let Some(timeout) = ping_timeout {
            if let Err(e) = self.ping(ep, timeout).await {
                self.mark_error(self.registry.now(), &e);
                return Err(e);
            }
        }
        self.clear_error();
        Ok(())
    }

    /// CPING/CPONG round trip on a connected endpoint.
    ///
    /// The endpoint is closed if the round trip fails.
    pub async fn ping(&self, ep: &mut Endpoint, timeout: Duration) -> Result<()> {
        let result = async {
            encode_cping(ep.message_mut())?;
            ep.send(Some(timeout)).await?;
            ep.receive(AJP13_SW_HEADER, Some(timeout)).await?;
            match ep.message_mut().read_u8()? {
                JK_AJP13_CPONG_REPLY => Ok(()),
                code => Err(AjpError::Framing(format!(
                    "expected CPONG reply, got packet type {}",
                    code
                ))),
            }
        }
        .await;
        if let Err(e) = &result {
            debug!(worker = %self.name, endpoint = ep.id(), error = %e, "cping failed");
            ep.record_error(e);
            ep.close();
        }
        result
    }

    // --- request level ---

    /// Forwards one request.
    ///
    /// Connect and send failures are retried on this worker up to
    /// `retries` times, `retry_interval_ms` apart. Any other failure is
    /// returned at once for the caller to decide on failover.
    pub async fn service(&self, request: &ForwardRequest) -> std::result::Result<Served, ExchangeFailure> {
        let config = self.config();
        if !self.try_retry(self.registry.now()) {
            return Err(ExchangeFailure {
                error: AjpError::Connect(format!("worker '{}' is in error state", self.name)),
                phase: ExchangePhase::Connect,
                recoverable: true,
            });
        }
        let _busy = BusyGuard::enter(&self.counters.busy, &self.counters.max_busy);

        let attempts = config.retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(request, &config).await {
                Ok(served) => {
                    self.counters.used.fetch_add(1, Ordering::Relaxed);
                    return Ok(served);
                }
                Err(failure) => {
                    let retry_here = matches!(failure.phase, ExchangePhase::Connect | ExchangePhase::Send);
                    if retry_here && attempt < attempts {
                        debug!(worker = %self.name, attempt, error = %failure, "retrying request on same worker");
                        tokio::time::sleep(config.retry_interval()).await;
                        continue;
                    }
                    self.note_failure(&failure);
                    return Err(failure);
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &ForwardRequest,
        config: &WorkerConfig,
    ) -> std::result::Result<Served, ExchangeFailure> {
        let fail = |error: AjpError, phase: ExchangePhase| ExchangeFailure {
            recoverable: is_recoverable(config.recovery_options, phase, request),
            error,
            phase,
        };

        let mut ep = self
            .pool
            .acquire()
            .await
            .map_err(|e| fail(e, ExchangePhase::Acquire))?;
        ep.resize_message(config.max_packet_size);

        if let Err(e) = self.connect(&mut ep).await {
            ep.close_on_recycle = true;
            return Err(fail(e, ExchangePhase::Connect));
        }
        if let Some(timeout) = config.prepost_ping_timeout() {
            if let Err(e) = self.ping(&mut ep, timeout).await {
                return Err(fail(e, ExchangePhase::Connect));
            }
        }

        let result = self.exchange(&mut ep, request, config).await;
        let (read, written) = ep.take_byte_counts();
        self.counters.readed.fetch_add(read, Ordering::Relaxed);
        self.counters.transferred.fetch_add(written, Ordering::Relaxed);

        match result {
            Ok(response) => {
                if !response.reuse {
                    ep.close_on_recycle = true;
                }
                if config.http_status_fail.contains(&response.status) {
                    return Err(fail(AjpError::BackendStatus(response.status), ExchangePhase::Reply));
                }
                Ok(Served {
                    response,
                    bytes: read + written,
                })
            }
            Err((error, phase)) => {
                ep.record_error(&error);
                if phase != ExchangePhase::Prepare
                    || config.recovery_options & recovery::ABORT_IF_CLIENTERROR != 0
                {
                    ep.close_on_recycle = true;
                }
                Err(fail(error, phase))
            }
        }
    }

    /// Sends the request and its body, then collects the reply packets.
    async fn exchange(
        &self,
        ep: &mut Endpoint,
        request: &ForwardRequest,
        config: &WorkerConfig,
    ) -> std::result::Result<ForwardResponse, (AjpError, ExchangePhase)> {
        let io_timeout = config.socket_timeout();
        let reply_timeout = config.reply_timeout();
        let chunk = max_body_chunk(config.max_packet_size);

        let encoded = match (&config.secret, &request.secret) {
            (Some(secret), None) => {
                let mut with_secret = request.clone();
                with_secret.secret = Some(secret.clone());
                with_secret.encode(ep.message_mut())
            }
            _ => request.encode(ep.message_mut()),
        };
        encoded.map_err(|e| (e, ExchangePhase::Prepare))?;
        ep.send(io_timeout).await.map_err(|e| (e, ExchangePhase::Send))?;

        let body = &request.body;
        let mut offset = 0;
        if !body.is_empty() {
            offset = body.len().min(chunk);
            encode_body_chunk(ep.message_mut(), &body[..offset])
                .map_err(|e| (e, ExchangePhase::Prepare))?;
            ep.send(io_timeout).await.map_err(|e| (e, ExchangePhase::Send))?;
        }

        let mut response = ForwardResponse::default();
        let mut phase = ExchangePhase::Reply;
        loop {
            ep.receive(AJP13_SW_HEADER, reply_timeout)
                .await
                .map_err(|e| (e, phase))?;
            match ReplyPacket::decode(ep.message_mut()).map_err(|e| (e, phase))? {
                ReplyPacket::SendHeaders { status, reason, headers } => {
                    response.status = status;
                    response.reason = reason;
                    response.headers = headers;
                    phase = ExchangePhase::Body;
                }
                ReplyPacket::BodyChunk(data) => response.body.extend_from_slice(&data),
                ReplyPacket::GetBodyChunk(requested) => {
                    let end = (offset + (requested as usize).min(chunk)).min(body.len());
                    encode_body_chunk(ep.message_mut(), &body[offset..end]).map_err(|e| (e, phase))?;
                    offset = end;
                    ep.send(io_timeout).await.map_err(|e| (e, phase))?;
                }
                ReplyPacket::EndResponse { reuse } => {
                    if phase == ExchangePhase::Reply {
                        return Err((AjpError::Framing("end of response before headers".into()), phase));
                    }
                    response.reuse = reuse;
                    ep.reuse = reuse;
                    return Ok(response);
                }
                ReplyPacket::CPong => {
                    return Err((AjpError::Framing("unexpected CPONG reply".into()), phase));
                }
            }
        }
    }

    pub(crate) fn note_failure(&self, failure: &ExchangeFailure) {
        match failure.phase {
            ExchangePhase::Acquire => {}
            ExchangePhase::Prepare => {
                self.counters.client_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                if failure.is_reply_timeout() {
                    self.counters.reply_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                debug!(worker = %self.name, error = %failure, recoverable = failure.recoverable, "request failed");
            }
        }
    }

    // --- maintenance ---

    pub fn busy(&self) -> u32 {
        self.counters.busy.load(Ordering::Relaxed)
    }

    pub fn reply_timeouts(&self) -> u32 {
        self.counters.reply_timeouts.load(Ordering::Relaxed)
    }

    /// Halves the reply timeout counter once per elapsed interval.
    pub fn decay_reply_timeouts(&self, intervals: u32) {
        let shift = intervals.min(31);
        let _ = self
            .counters
            .reply_timeouts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v >> shift));
    }

    pub fn clear_reply_timeouts(&self) {
        self.counters.reply_timeouts.store(0, Ordering::Relaxed);
    }

    /// Evicts idle endpoints and mirrors the counters into the shared store.
    pub fn maintain(&self, now: SystemTime) -> usize {
        let evicted = self.pool.maintain(now);
        self.last_maintain.store(unix_secs(now), Ordering::Relaxed);
        self.push_state();
        evicted
    }

    /// CPINGs pooled connections idle for longer than the ping interval.
    ///
    /// Does nothing unless interval pings are enabled. Returns how many
    /// connections failed the probe and were closed.
    pub async fn keepalive_idle(&self) -> usize {
        let (enabled, idle_for, timeout) = {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            (
                config.ping_mode.contains(PingMode::INTERVAL),
                Duration::from_secs(config.ping_interval_secs),
                config.ping_timeout(),
            )
        };
        if !enabled {
            return 0;
        }
        let mut failed = 0;
        for mut ep in self.pool.checkout_idle(idle_for) {
            if self.ping(&mut ep, timeout).await.is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(worker = %self.name, failed, "closed idle connections failing cping");
        }
        failed
    }

    /// Connects and CPINGs regardless of quarantine.
    ///
    /// Success clears the worker's error state.
    pub async fn probe(&self) -> Result<()> {
        self.probing.store(true, Ordering::Relaxed);
        let timeout = self.config.read().unwrap_or_else(|p| p.into_inner()).ping_timeout();
        let result = async {
            let mut ep = self.pool.acquire().await?;
            self.connect(&mut ep).await?;
            self.ping(&mut ep, timeout).await
        }
        .await;
        self.probing.store(false, Ordering::Relaxed);
        match &result {
            Ok(()) => self.clear_error(),
            Err(e) => self.mark_error(self.registry.now(), e),
        }
        result
    }

    /// Zeroes the counters and clears the error state.
    pub fn reset(&self) {
        let c = &self.counters;
        c.max_busy.store(c.busy.load(Ordering::Relaxed), Ordering::Relaxed);
        for counter in [&c.used, &c.readed, &c.transferred] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in [&c.errors, &c.client_errors, &c.reply_timeouts] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_reset.store(self.registry.unix_now(), Ordering::Relaxed);
        *self.health() = Health::default();
        info!(worker = %self.name, "worker counters reset");
        self.push_state();
    }

    // --- shared state ---

    pub fn to_record(&self) -> WorkerRecord {
        let config = self.config();
        let health = self.health();
        let c = &self.counters;
        WorkerRecord {
            name: self.name.clone(),
            host: config.host,
            port: config.port,
            addr_sequence: self.addr_sequence(),
            state: if health.in_error {
                WorkerState::Error
            } else if self.probing.load(Ordering::Relaxed) {
                WorkerState::Probe
            } else if c.used.load(Ordering::Relaxed) == 0 {
                WorkerState::Idle
            } else {
                WorkerState::Ok
            },
            busy: c.busy.load(Ordering::Relaxed),
            max_busy: c.max_busy.load(Ordering::Relaxed),
            error_time: health.error_time.map(unix_secs).unwrap_or(0),
            readed: c.readed.load(Ordering::Relaxed),
            transferred: c.transferred.load(Ordering::Relaxed),
            used: c.used.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            client_errors: c.client_errors.load(Ordering::Relaxed),
            reply_timeouts: c.reply_timeouts.load(Ordering::Relaxed),
            last_reset: self.last_reset.load(Ordering::Relaxed),
            last_maintain: self.last_maintain.load(Ordering::Relaxed),
            sequence: self.sequence.load(Ordering::Acquire),
        }
    }

    /// Writes the current state to the shared store.
    pub fn push_state(&self) {
        let record = self.to_record();
        let sequence = self.registry.store().push_worker(&record);
        self.sequence.store(sequence, Ordering::Release);
    }

    /// Adopts a newer record written by another process.
    ///
    /// Address and error state are taken over; local counters are kept.
    /// Returns whether anything was applied.
    pub fn sync_from_store(&self) -> bool {
        let Some(record) = self.registry.store().pull_worker(&self.name) else {
            return false;
        };
        if record.sequence <= self.sequence.load(Ordering::Acquire) {
            return false;
        }
        let moved = {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            let moved = !record.host.is_empty() && (record.host != config.host || record.port != config.port);
            if moved {
                config.host = record.host.clone();
                config.port = record.port;
            }
            moved
        };
        if moved {
            self.invalidate_address();
        }
        {
            let mut health = self.health();
            health.in_error = record.state == WorkerState::Error;
            health.error_time = (record.error_time > 0)
                .then(|| UNIX_EPOCH + Duration::from_secs(record.error_time));
        }
        self.sequence.store(record.sequence, Ordering::Release);
        debug!(worker = %self.name, sequence = record.sequence, "worker state pulled from shared store");
        true
    }
}

impl fmt::Debug for AjpWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AjpWorker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("busy", &self.busy())
            .finish()
    }
}
