use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ajplb_common::RuntimeRegistry;
use tracing::{debug, info};

use crate::balancer::Balancer;
use crate::config::MaintainConfig;
use crate::worker::AjpWorker;

/// What one maintenance round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintainReport {
    /// Balancers whose maintenance pass was due and ran
    pub maintained: usize,
    pub probed: usize,
    pub recovered: usize,
    /// Idle connections closed after a failed keepalive CPING
    pub keepalive_failures: usize,
}

/// Background housekeeping for balancers and workers.
///
/// Each round runs due balancer maintenance, evicts idle endpoints of
/// workers outside any balancer, CPINGs quarantined members whose window
/// elapsed and keeps idle connections alive when interval pings are on.
pub struct Maintainer {
    balancers: Vec<Arc<Balancer>>,
    workers: Vec<Arc<AjpWorker>>,
    /// Workers not owned by any balancer
    standalone: Vec<Arc<AjpWorker>>,
    registry: Arc<RuntimeRegistry>,
    config: MaintainConfig,
}

impl Maintainer {
    /// Creates a maintainer.
    ///
    /// # Arguments
    /// * `balancers` - Balancers to maintain and probe
    /// * `workers` - Every configured worker
    /// * `registry` - Clock source
    /// * `config` - Round interval and probe switch
    pub fn new(
        balancers: Vec<Arc<Balancer>>,
        workers: Vec<Arc<AjpWorker>>,
        registry: Arc<RuntimeRegistry>,
        config: MaintainConfig,
    ) -> Self {
        let owned: Vec<String> = balancers
            .iter()
            .flat_map(|b| b.workers())
            .map(|w| w.name().to_string())
            .collect();
        let standalone = workers
            .iter()
            .filter(|w| !owned.iter().any(|name| name == w.name()))
            .cloned()
            .collect();
        Self {
            balancers,
            workers,
            standalone,
            registry,
            config,
        }
    }

    /// Starts the maintenance task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main maintenance loop
    async fn run(self) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(interval_secs = period.as_secs(), "maintainer started");
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            let report = self.run_once().await;
            if report != MaintainReport::default() {
                debug!(?report, "maintenance round finished");
            }
        }
    }

    /// Runs one maintenance round.
    pub async fn run_once(&self) -> MaintainReport {
        let mut report = MaintainReport::default();
        // Probes go first so lazy recovery does not skip them.
        if self.config.probe {
            let (probed, recovered) = self.probe_members().await;
            report.probed = probed;
            report.recovered = recovered;
        }

        let now = self.registry.now();
        report.maintained = self.balancers.iter().filter(|b| b.maintain(now)).count();
        for worker in &self.standalone {
            worker.maintain(now);
        }

        let keepalives = self.workers.iter().map(|w| w.keepalive_idle());
        report.keepalive_failures = futures::future::join_all(keepalives).await.into_iter().sum();
        report
    }

    /// Probes each due worker once, however many balancers it belongs to.
    async fn probe_members(&self) -> (usize, usize) {
        let now = self.registry.now();
        let mut due: HashMap<String, (Arc<AjpWorker>, Vec<(&Arc<Balancer>, usize)>)> = HashMap::new();
        for balancer in &self.balancers {
            for (index, worker) in balancer.begin_probes(now) {
                due.entry(worker.name().to_string())
                    .or_insert_with(|| (worker, Vec::new()))
                    .1
                    .push((balancer, index));
            }
        }
        if due.is_empty() {
            return (0, 0);
        }

        let probes = due.into_values().map(|(worker, members)| async move {
            let result = worker.probe().await;
            if let Err(e) = &result {
                debug!(worker = %worker.name(), error = %e, "probe failed");
            }
            (result.is_ok(), members)
        });
        let results = futures::future::join_all(probes).await;

        let probed = results.len();
        let mut recovered = 0;
        for (ok, members) in results {
            if ok {
                recovered += 1;
            }
            for (balancer, index) in members {
                balancer.finish_probe(index, ok);
            }
        }
        (probed, recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BalancerConfig, MemberConfig, WorkerConfig};
    use ajplb_common::runtime::{Clock, InMemoryStore, ManualClock};
    use ajplb_common::MemberState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn cpong_listener() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut packet = [0u8; 5];
                    while sock.read_exact(&mut packet).await.is_ok() {
                        if sock.write_all(&[0x41, 0x42, 0x00, 0x01, 9]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    async fn dead_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    fn setup(ports: &[(&str, u16)]) -> (Maintainer, Arc<Balancer>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(2_000_000));
        let registry = Arc::new(RuntimeRegistry::new(clock.clone(), Arc::new(InMemoryStore::new())));
        let workers: HashMap<String, Arc<AjpWorker>> = ports
            .iter()
            .map(|(name, port)| {
                let config = WorkerConfig::new(*name, "127.0.0.1", *port);
                (name.to_string(), Arc::new(AjpWorker::new(config, registry.clone()).unwrap()))
            })
            .collect();
        let members = ports.iter().map(|(name, _)| MemberConfig::new(*name)).collect();
        let balancer = Arc::new(
            Balancer::new(&BalancerConfig::new("lb", members), &workers, registry.clone()).unwrap(),
        );
        let maintainer = Maintainer::new(
            vec![balancer.clone()],
            workers.into_values().collect(),
            registry,
            MaintainConfig::default(),
        );
        (maintainer, balancer, clock)
    }

    fn quarantine(balancer: &Balancer, index: usize) {
        let worker = balancer.workers()[index].clone();
        let selection = crate::balancer::Selection {
            index,
            worker,
            route: String::new(),
            sticky: false,
        };
        balancer.record_outcome(&selection, &crate::balancer::Outcome::Failure("refused".into()));
    }

    #[test]
    fn test_maintain_config_default() {
        let config = MaintainConfig::default();
        assert!(config.enabled);
        assert!(config.probe);
        assert_eq!(config.interval_secs, 10);
    }

    #[tokio::test]
    async fn test_successful_probe_recovers_member() {
        let port = cpong_listener().await;
        let (maintainer, balancer, clock) = setup(&[("a", port)]);
        quarantine(&balancer, 0);

        let report = maintainer.run_once().await;
        assert_eq!(report.probed, 0);
        assert_eq!(balancer.member_snapshot()[0].state, MemberState::Error);

        clock.advance(Duration::from_secs(60));
        let report = maintainer.run_once().await;
        assert_eq!((report.probed, report.recovered), (1, 1));
        assert_eq!(balancer.member_snapshot()[0].state, MemberState::Recover);
    }

    #[tokio::test]
    async fn test_failed_probe_restarts_window() {
        let port = dead_port().await;
        let (maintainer, balancer, clock) = setup(&[("a", port)]);
        quarantine(&balancer, 0);

        clock.advance(Duration::from_secs(60));
        let report = maintainer.run_once().await;
        assert_eq!((report.probed, report.recovered), (1, 0));

        let member = &balancer.member_snapshot()[0];
        assert_eq!(member.state, MemberState::Error);
        assert_eq!(member.error_time, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_probe_disabled() {
        let port = cpong_listener().await;
        let (mut maintainer, balancer, clock) = setup(&[("a", port)]);
        maintainer.config.probe = false;
        quarantine(&balancer, 0);

        clock.advance(Duration::from_secs(61));
        let report = maintainer.run_once().await;
        assert_eq!(report.probed, 0);
        assert_eq!(report.maintained, 1);
        // Maintenance itself moved the member on lazily.
        assert_eq!(balancer.member_snapshot()[0].state, MemberState::Recover);
    }

    #[tokio::test]
    async fn test_standalone_workers_are_tracked() {
        let clock = Arc::new(ManualClock::at_unix(2_000_000));
        let registry = Arc::new(RuntimeRegistry::new(clock, Arc::new(InMemoryStore::new())));
        let worker = Arc::new(AjpWorker::new(WorkerConfig::new("solo", "127.0.0.1", 1), registry.clone()).unwrap());
        let maintainer = Maintainer::new(Vec::new(), vec![worker], registry, MaintainConfig::default());
        assert_eq!(maintainer.standalone.len(), 1);
        assert_eq!(maintainer.run_once().await, MaintainReport::default());
    }
}
