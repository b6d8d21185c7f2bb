use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::protocol::{ForwardRequest, ForwardResponse};
use ajplb_common::runtime::{ImageStore, InMemoryStore, SharedStore, SystemClock};
use ajplb_common::RuntimeRegistry;
use tracing::info;

use crate::balancer::Balancer;
use crate::config::ConnectorConfig;
use crate::maintainer::Maintainer;
use crate::worker::AjpWorker;

/// Workers and balancers built from one [`ConnectorConfig`].
///
/// # Example
///
/// ```no_run
/// use ajplb_balancer::{Connector, ConnectorConfig};
/// use ajplb_common::ForwardRequest;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = Connector::open(ConnectorConfig::load("ajplb.toml")?)?;
/// let _maintainer = connector.spawn_maintainer();
///
/// let response = connector.service("lb", &ForwardRequest::new("GET", "/")).await?;
/// println!("{}", response.status);
/// # Ok(())
/// # }
/// ```
pub struct Connector {
    config: ConnectorConfig,
    registry: Arc<RuntimeRegistry>,
    image: Option<(Arc<ImageStore>, PathBuf)>,
    workers: Vec<Arc<AjpWorker>>,
    balancers: Vec<Arc<Balancer>>,
}

impl Connector {
    /// Builds every worker and balancer on an existing registry.
    pub fn from_config(config: ConnectorConfig, registry: Arc<RuntimeRegistry>) -> Result<Self> {
        Self::build(config, registry, None)
    }

    /// Builds a connector on the system clock.
    ///
    /// With `runtime_image` set, shared state lives in an [`ImageStore`]
    /// loaded from that file when it exists; otherwise it is in memory.
    pub fn open(config: ConnectorConfig) -> Result<Self> {
        match config.runtime_image.clone() {
            Some(path) => {
                let image = if path.exists() {
                    info!(path = %path.display(), "loading runtime image");
                    ImageStore::load(&path)?
                } else {
                    ImageStore::new()
                };
                let image = Arc::new(image);
                let store: Arc<dyn SharedStore> = image.clone();
                let registry = Arc::new(RuntimeRegistry::new(Arc::new(SystemClock), store));
                Self::build(config, registry, Some((image, path)))
            }
            None => {
                let registry = Arc::new(RuntimeRegistry::new(
                    Arc::new(SystemClock),
                    Arc::new(InMemoryStore::new()),
                ));
                Self::build(config, registry, None)
            }
        }
    }

    fn build(
        config: ConnectorConfig,
        registry: Arc<RuntimeRegistry>,
        image: Option<(Arc<ImageStore>, PathBuf)>,
    ) -> Result<Self> {
        config.validate()?;
        let workers = config
            .workers
            .iter()
            .map(|wc| AjpWorker::new(wc.clone(), Arc::clone(&registry)).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        for worker in &workers {
            if !worker.sync_from_store() {
                worker.push_state();
            }
        }
        let by_name: HashMap<String, Arc<AjpWorker>> = workers
            .iter()
            .map(|w| (w.name().to_string(), Arc::clone(w)))
            .collect();
        let balancers = config
            .balancers
            .iter()
            .map(|bc| Balancer::new(bc, &by_name, Arc::clone(&registry)).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        info!(
            workers = workers.len(),
            balancers = balancers.len(),
            "connector ready"
        );
        Ok(Self {
            config,
            registry,
            image,
            workers,
            balancers,
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn read_only(&self) -> bool {
        self.config.status.read_only
    }

    pub fn workers(&self) -> &[Arc<AjpWorker>] {
        &self.workers
    }

    pub fn balancers(&self) -> &[Arc<Balancer>] {
        &self.balancers
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<AjpWorker>> {
        self.workers.iter().find(|w| w.name() == name)
    }

    pub fn balancer(&self, name: &str) -> Option<&Arc<Balancer>> {
        self.balancers.iter().find(|b| b.name() == name)
    }

    /// Forwards `request` to the balancer or worker called `name`.
    ///
    /// # Errors
    ///
    /// - `UnknownWorker` if nothing has that name
    /// - `ServiceUnavailable` from a balancer
    /// - The exchange error from a plain worker
    pub async fn service(&self, name: &str, request: &ForwardRequest) -> Result<ForwardResponse> {
        if let Some(balancer) = self.balancer(name) {
            return balancer.service(request).await;
        }
        let worker = self
            .worker(name)
            .ok_or_else(|| AjpError::UnknownWorker(name.to_string()))?;
        worker
            .service(request)
            .await
            .map(|served| served.response)
            .map_err(|failure| failure.error)
    }

    /// Writes the runtime image to its file. Returns whether there was
    /// one to write.
    pub fn persist(&self) -> Result<bool> {
        let Some((image, path)) = &self.image else {
            return Ok(false);
        };
        image.save(path)?;
        info!(path = %path.display(), "runtime image saved");
        Ok(true)
    }

    pub fn maintainer(&self) -> Maintainer {
        Maintainer::new(
            self.balancers.clone(),
            self.workers.clone(),
            Arc::clone(&self.registry),
            self.config.maintain.clone(),
        )
    }

    /// Starts background maintenance unless it is disabled.
    pub fn spawn_maintainer(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.config.maintain.enabled.then(|| self.maintainer().spawn())
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("workers", &self.workers.len())
            .field("balancers", &self.balancers.len())
            .field("image", &self.image.as_ref().map(|(_, p)| p))
            .finish()
    }
}
