//! Discoverer: shared liveness timers over a pluggable backend
//!
//! TigerStyle: Every timer is a cancellable task; stop waits for all of them.
//!
//! Backends only decide how "who is online" and "what does node X offer"
//! travel. The discoverer owns the timers every backend needs:
//! - heartbeat emission every `heartbeat_interval_ms` (with jitter)
//! - remote liveness check every `interval * CHECK_REMOTE_NODES_INTERVAL_MULTIPLIER`
//! - offline cleanup every `interval * CHECK_OFFLINE_NODES_INTERVAL_MULTIPLIER`
//! - re-publishing local INFO when local services change

use crate::cpu::{CpuSampler, SysinfoCpuSampler};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::kv::{KvBackend, KvStore};
use crate::local::LocalBackend;
use crate::packet::Serializer;
use crate::transport::Transport;
use async_trait::async_trait;
use meshwork_core::config::{BackendConfig, DiscovererConfig, Etcd3Options, MeshConfig, RedisOptions};
use meshwork_core::constants::{
    CHECK_OFFLINE_NODES_INTERVAL_MULTIPLIER, CHECK_REMOTE_NODES_INTERVAL_MULTIPLIER,
    HEARTBEAT_JITTER_MS_MAX,
};
use meshwork_core::io::RngProvider;
use meshwork_core::metrics;
use meshwork_registry::{
    HeartbeatPayload, HeartbeatStatus, NodeId, NodeInfo, Pinger, Registry, RegistryEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Backend contract
// =============================================================================

/// How nodes find each other
///
/// Implementations report failures as errors; the discoverer logs them and
/// retries on the next cycle.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Connect to the transport or store
    async fn start(&self) -> DiscoveryResult<()>;

    /// Announce departure and release everything held in the store
    async fn stop(&self) -> DiscoveryResult<()>;

    async fn send_heartbeat(&self) -> DiscoveryResult<()>;

    /// Publish local INFO, to one node or to everyone
    async fn send_local_node_info(&self, target: Option<&NodeId>) -> DiscoveryResult<()>;

    /// Fetch one node's full INFO
    async fn discover_node(&self, node_id: &NodeId) -> DiscoveryResult<()>;

    async fn discover_all_nodes(&self) -> DiscoveryResult<()>;

    /// Round-trip timer for latency-based balancing, if the backend has one
    fn as_pinger(&self) -> Option<Arc<dyn Pinger>> {
        None
    }

    /// Refresh liveness from a heartbeat, or pull the full INFO when the
    /// heartbeat cannot be trusted
    async fn heartbeat_received(
        &self,
        registry: &Registry,
        payload: &HeartbeatPayload,
    ) -> DiscoveryResult<()> {
        match registry.heartbeat_received(payload).await {
            HeartbeatStatus::Refreshed => Ok(()),
            HeartbeatStatus::NeedsDiscovery => self.discover_node(&payload.sender).await,
        }
    }
}

/// Apply a remote INFO; rejected payloads are logged and dropped
pub(crate) async fn apply_remote_info(registry: &Registry, info: NodeInfo) {
    let sender = info.sender.clone();
    if let Err(e) = registry.process_node_info(info).await {
        warn!(node_id = %sender, error = %e, "Remote INFO rejected");
    }
}

/// Build the backend named by `config`
///
/// `transport` is required by the local backend; KV backends connect to
/// their store here.
pub async fn create_backend(
    config: &DiscovererConfig,
    namespace: Option<&str>,
    registry: Arc<Registry>,
    transport: Option<Arc<dyn Transport>>,
) -> DiscoveryResult<Arc<dyn DiscoveryBackend>> {
    match config.backend {
        BackendConfig::Local => {
            let transport = transport.ok_or_else(|| DiscoveryError::BackendUnavailable {
                backend: "local (no transport)".into(),
            })?;
            Ok(LocalBackend::new(registry, transport, config.heartbeat_timeout_ms))
        }
        BackendConfig::Etcd3(ref opts) => {
            let store = etcd3_store(opts).await?;
            Ok(kv_backend(config, namespace, registry, store))
        }
        BackendConfig::Redis(ref opts) => {
            let store = redis_store(opts, config.scan_length).await?;
            Ok(kv_backend(config, namespace, registry, store))
        }
    }
}

#[cfg(feature = "etcd3")]
async fn etcd3_store(opts: &Etcd3Options) -> DiscoveryResult<Arc<dyn KvStore>> {
    Ok(Arc::new(crate::etcd3::EtcdStore::connect(opts).await?))
}

#[cfg(not(feature = "etcd3"))]
async fn etcd3_store(_opts: &Etcd3Options) -> DiscoveryResult<Arc<dyn KvStore>> {
    Err(DiscoveryError::BackendUnavailable {
        backend: "etcd3 (feature disabled)".into(),
    })
}

#[cfg(feature = "redis")]
async fn redis_store(opts: &RedisOptions, scan_length: usize) -> DiscoveryResult<Arc<dyn KvStore>> {
    Ok(Arc::new(
        crate::redis_store::RedisStore::connect(opts, scan_length).await?,
    ))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_opts: &RedisOptions, _scan_length: usize) -> DiscoveryResult<Arc<dyn KvStore>> {
    Err(DiscoveryError::BackendUnavailable {
        backend: "redis (feature disabled)".into(),
    })
}

/// KV backend over any store
pub fn kv_backend(
    config: &DiscovererConfig,
    namespace: Option<&str>,
    registry: Arc<Registry>,
    store: Arc<dyn KvStore>,
) -> Arc<dyn DiscoveryBackend> {
    Arc::new(KvBackend::new(
        registry,
        store,
        namespace,
        Serializer::new(config.serializer),
        config,
    ))
}

// =============================================================================
// Discoverer
// =============================================================================

/// Owns the discovery timers for one node
pub struct Discoverer {
    registry: Arc<Registry>,
    backend: Arc<dyn DiscoveryBackend>,
    config: DiscovererConfig,
    cpu: Arc<dyn CpuSampler>,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl Discoverer {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn DiscoveryBackend>,
        config: DiscovererConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            config,
            cpu: Arc::new(SysinfoCpuSampler::new()),
            shutdown: RwLock::new(None),
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// Build the configured backend and wrap it
    pub async fn from_config(
        config: &MeshConfig,
        registry: Arc<Registry>,
        transport: Option<Arc<dyn Transport>>,
    ) -> DiscoveryResult<Self> {
        config.validate()?;
        let backend = create_backend(
            &config.discoverer,
            config.namespace.as_deref(),
            registry.clone(),
            transport,
        )
        .await?;
        Ok(Self::new(registry, backend, config.discoverer.clone()))
    }

    pub fn with_cpu_sampler(mut self, cpu: Arc<dyn CpuSampler>) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn is_running(&self) -> bool {
        self.shutdown.read().await.is_some()
    }

    /// Connect the backend, announce this node, and start the timers
    pub async fn start(&self) -> DiscoveryResult<()> {
        let mut shutdown = self.shutdown.write().await;
        if shutdown.is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }

        info!(
            node_id = %self.registry.local_node_id(),
            backend = self.backend.name(),
            interval_ms = self.config.heartbeat_interval_ms,
            "Starting discoverer"
        );

        self.backend.start().await?;

        if let Err(e) = self.backend.send_local_node_info(None).await {
            error!(error = %e, "Failed to publish local INFO");
        }
        if let Err(e) = self.backend.discover_all_nodes().await {
            error!(error = %e, "Failed to discover nodes");
        }

        let (tx, rx) = watch::channel(false);
        let mut tasks = self.tasks.write().await;
        tasks.push(self.spawn_heartbeat_task(rx.clone()));
        if !self.config.disable_heartbeat_checks {
            tasks.push(self.spawn_remote_check_task(rx.clone()));
        }
        if !self.config.disable_offline_node_removing {
            tasks.push(self.spawn_offline_check_task(rx.clone()));
        }
        tasks.push(self.spawn_services_listener(rx));
        *shutdown = Some(tx);

        if let Some(interval_ms) = self.registry.latency_probe_interval_ms() {
            match self.backend.as_pinger() {
                Some(pinger) => self.registry.start_latency_probing(pinger, interval_ms),
                None => warn!(
                    backend = self.backend.name(),
                    "Latency strategy configured but backend cannot ping"
                ),
            }
        }

        info!(node_id = %self.registry.local_node_id(), "Discoverer started");
        Ok(())
    }

    /// Stop every timer, then let the backend clean up
    pub async fn stop(&self) -> DiscoveryResult<()> {
        let tx = match self.shutdown.write().await.take() {
            Some(tx) => tx,
            None => return Ok(()),
        };

        info!(node_id = %self.registry.local_node_id(), "Stopping discoverer");
        let _ = tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.write().await.drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Discoverer task ended abnormally");
            }
        }

        self.registry.stop_latency_probing().await;
        self.backend.stop().await?;
        info!(node_id = %self.registry.local_node_id(), "Discoverer stopped");
        Ok(())
    }

    /// One heartbeat cycle: sample CPU, then let the backend publish
    pub async fn beat(&self) {
        beat_once(&self.registry, self.backend.as_ref(), self.cpu.as_ref()).await;
    }

    fn spawn_heartbeat_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let backend = self.backend.clone();
        let cpu = self.cpu.clone();
        let interval_ms = self.config.heartbeat_interval_ms;

        tokio::spawn(async move {
            let io = registry.io().clone();
            loop {
                let delay_ms = jittered_interval_ms(interval_ms, io.rng.as_ref());
                tokio::select! {
                    _ = io.sleep_ms(delay_ms) => {
                        beat_once(&registry, backend.as_ref(), cpu.as_ref()).await;
                    }
                    _ = shutdown.changed() => {
                        debug!("heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_remote_check_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let interval_ms = self.config.heartbeat_interval_ms * CHECK_REMOTE_NODES_INTERVAL_MULTIPLIER;
        let timeout_ms = self.config.heartbeat_timeout_ms;

        tokio::spawn(async move {
            let io = registry.io().clone();
            loop {
                tokio::select! {
                    _ = io.sleep_ms(interval_ms) => {
                        let stale = registry.check_remote_nodes(timeout_ms).await;
                        for node_id in stale {
                            warn!(node_id = %node_id, timeout_ms, "Heartbeat timed out");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("remote check task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_offline_check_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let interval_ms =
            self.config.heartbeat_interval_ms * CHECK_OFFLINE_NODES_INTERVAL_MULTIPLIER;
        let timeout_ms = self.config.clean_offline_nodes_timeout_ms;

        tokio::spawn(async move {
            let io = registry.io().clone();
            loop {
                tokio::select! {
                    _ = io.sleep_ms(interval_ms) => {
                        let removed = registry.check_offline_nodes(timeout_ms).await;
                        if !removed.is_empty() {
                            debug!(count = removed.len(), "Offline nodes cleaned up");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("offline check task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_services_listener(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let mut events = self.registry.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(RegistryEvent::ServicesChanged { local: true }) => {
                            republish(backend.as_ref()).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            // A local change may be among the lost events
                            warn!(skipped, "Registry events lagged");
                            republish(backend.as_ref()).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        debug!("services listener shutting down");
                        break;
                    }
                }
            }
        })
    }
}

async fn beat_once(registry: &Registry, backend: &dyn DiscoveryBackend, cpu: &dyn CpuSampler) {
    if let Some(usage) = cpu.sample() {
        registry.update_local_cpu(usage).await;
    }
    match backend.send_heartbeat().await {
        Ok(()) => {
            if registry.metrics_enabled() {
                metrics::record_heartbeat_sent();
            }
        }
        Err(e) => error!(backend = backend.name(), error = %e, "Failed to send heartbeat"),
    }
}

async fn republish(backend: &dyn DiscoveryBackend) {
    if let Err(e) = backend.send_local_node_info(None).await {
        error!(backend = backend.name(), error = %e, "Failed to republish local INFO");
    }
}

/// `interval_ms` shifted by up to a quarter of itself, capped at the jitter max
fn jittered_interval_ms(interval_ms: u64, rng: &dyn RngProvider) -> u64 {
    let jitter_ms = (interval_ms / 4).min(HEARTBEAT_JITTER_MS_MAX);
    if jitter_ms == 0 {
        return interval_ms;
    }
    interval_ms - jitter_ms + rng.gen_range(0, 2 * jitter_ms + 1)
}
