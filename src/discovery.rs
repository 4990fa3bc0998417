// src/discovery.rs
//
// Consul-backed discovery engine: a background task keeps a snapshot of the
// healthy nodes for one service, requests read (or briefly wait for) it.

use crate::{
    config::DiscoveryConfig,
    registry_client::{ConsulClient, HealthClient, RegistryError},
    retry::Retrier,
};
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

/// Immutable snapshot of discovered `host:port` targets.
pub type NodeList = Arc<Vec<String>>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("consul: cannot discover servers for '{service}' within {waited:?}")]
    Timeout { service: String, waited: Duration },

    #[error("consul: no registry endpoints configured")]
    NoEndpoints,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: DiscoveryConfig,
    clients: Vec<Arc<dyn HealthClient>>,
    retrier: Retrier,
    nodes: RwLock<Option<NodeList>>,
    cursor: Mutex<usize>,
    worker: Mutex<Option<Worker>>,
}

/// Cheaply cloneable handle to one discovery engine.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("service", &self.inner.config.service)
            .field("endpoints", &self.inner.clients.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Discovery {
    /// Engine with one Consul client per configured endpoint and the default
    /// retry strategy. Nothing runs until `start` (or the first `get_nodes`).
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_retrier(config, Retrier::default())
    }

    pub fn with_retrier(config: DiscoveryConfig, retrier: Retrier) -> Self {
        let clients = config
            .endpoints
            .iter()
            .cloned()
            .map(|ep| Arc::new(ConsulClient::new(ep)) as Arc<dyn HealthClient>)
            .collect();
        Self::with_clients(config, clients, retrier)
    }

    /// Engine over explicit registry clients, rotated in the given order.
    pub fn with_clients(
        config: DiscoveryConfig,
        clients: Vec<Arc<dyn HealthClient>>,
        retrier: Retrier,
    ) -> Self {
        Discovery {
            inner: Arc::new(Inner {
                config,
                clients,
                retrier,
                nodes: RwLock::new(None),
                cursor: Mutex::new(0),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// False when no registry is configured; callers should pass requests through.
    pub fn is_enabled(&self) -> bool {
        !self.inner.clients.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    /// Launch the background refresh task. No-op if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(refresh_loop(Arc::downgrade(&self.inner), rx));
        *worker = Some(Worker { shutdown, handle });
        log::info!(
            "started discovery for service '{}' every {:?}",
            self.inner.config.service,
            self.inner.config.refresh_time
        );
    }

    /// Signal the background task to exit. Returns false when it was not running.
    pub fn stop(&self) -> bool {
        match self.inner.worker.lock().take() {
            Some(worker) => {
                let _ = worker.shutdown.send(true);
                log::info!("stopping discovery for service '{}'", self.inner.config.service);
                true
            }
            None => false,
        }
    }

    /// Like `stop`, but also waits for the task to finish.
    pub async fn shutdown(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                log::warn!("discovery task ended abnormally: {}", e);
            }
        }
    }

    fn next_client(&self) -> (usize, Arc<dyn HealthClient>) {
        let mut cursor = self.inner.cursor.lock();
        let idx = *cursor % self.inner.clients.len();
        *cursor = (idx + 1) % self.inner.clients.len();
        (idx, Arc::clone(&self.inner.clients[idx]))
    }

    /// Run one discovery cycle and return the mapped nodes. Every attempt made
    /// by the retrier goes to the next endpoint in rotation. The cache is not touched.
    pub async fn update_nodes(&self) -> Result<Vec<String>, DiscoveryError> {
        if self.inner.clients.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }
        let this = self;
        let config = &self.inner.config;

        let records = self
            .inner
            .retrier
            .run(move || async move {
                let (idx, client) = this.next_client();
                match client
                    .health(&config.service, config.tag.as_deref(), config.query_options.as_ref())
                    .await
                {
                    Ok((records, meta)) => {
                        log::debug!(
                            "endpoint #{} returned {} '{}' entries (index {})",
                            idx,
                            records.len(),
                            config.service,
                            meta.last_index
                        );
                        Ok(records)
                    }
                    Err(e) => {
                        log::debug!("endpoint #{} failed for '{}': {}", idx, config.service, e);
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(config.mapper.map(&records))
    }

    /// Run one cycle and publish the result. An empty result leaves the cache
    /// as it was; returns how many nodes were published.
    pub async fn refresh(&self) -> Result<usize, DiscoveryError> {
        let nodes = self.update_nodes().await?;
        Ok(self.publish(nodes))
    }

    fn publish(&self, nodes: Vec<String>) -> usize {
        if nodes.is_empty() {
            return 0;
        }
        let count = nodes.len();
        *self.inner.nodes.write() = Some(Arc::new(nodes));
        count
    }

    /// Current snapshot without waiting.
    pub fn nodes(&self) -> Option<NodeList> {
        self.inner.nodes.read().clone()
    }

    /// Nodes for the configured service, starting discovery if needed and
    /// waiting up to `wait_timeout` for the first non-empty list.
    pub async fn get_nodes(&self) -> Result<NodeList, DiscoveryError> {
        self.start();

        let config = &self.inner.config;
        let deadline = Instant::now() + config.wait_timeout;
        loop {
            if let Some(nodes) = self.nodes().filter(|n| !n.is_empty()) {
                return Ok(nodes);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DiscoveryError::Timeout {
                    service: config.service.clone(),
                    waited: config.wait_timeout,
                });
            }
            tokio::time::sleep(config.wait_interval.min(deadline - now)).await;
        }
    }
}

/// Background task. Holds only a weak handle between cycles so dropping every
/// `Discovery` also ends the loop.
async fn refresh_loop(inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let stopped = *shutdown.borrow();
        if stopped {
            break;
        }
        let Some(discovery) = inner.upgrade().map(|inner| Discovery { inner }) else {
            break;
        };
        let service = discovery.inner.config.service.clone();
        let interval = discovery.inner.config.refresh_time;

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            res = discovery.refresh() => match res {
                Ok(0) => log::warn!("no healthy '{}' instances discovered, keeping cached nodes", service),
                Ok(n) => log::debug!("published {} '{}' nodes", n, service),
                Err(e) => log::warn!("discovery refresh for '{}' failed: {}", service, e),
            },
        }
        drop(discovery);

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    log::debug!("discovery loop exited");
}
