//! Latency strategy and its shared prober
//!
//! One `LatencyProber` per process is injected into every latency strategy
//! instance. Its role is fixed at construction: a `Leader` pings one node per
//! distinct hostname on an interval and keeps a rolling average per host; a
//! `Follower` never pings and only receives averages via `set_average`
//! (for example relayed from a leader elsewhere). Strategies read averages
//! identically in both roles.

use super::{sample_lowest, SelectionContext, Strategy};
use crate::error::RegistryResult;
use crate::node::NodeId;
use async_trait::async_trait;
use meshwork_core::config::LatencyOptions;
use meshwork_core::io::{RngProvider, TimeProvider};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Whether this process measures latency itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProberRole {
    Leader,
    Follower,
}

/// Measures round-trip time to a node
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Round-trip time in milliseconds
    async fn ping(&self, node_id: &NodeId) -> RegistryResult<f64>;
}

/// Source of probe targets: available remote nodes and their hostnames
#[async_trait]
pub trait ProbeTargets: Send + Sync {
    async fn probe_targets(&self) -> Vec<(NodeId, String)>;
}

#[derive(Debug, Default)]
struct HostLatency {
    samples: VecDeque<f64>,
    average: f64,
}

/// Shared per-host latency table
pub struct LatencyProber {
    role: ProberRole,
    collect_count: usize,
    hosts: RwLock<HashMap<String, HostLatency>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LatencyProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyProber")
            .field("role", &self.role)
            .field("collect_count", &self.collect_count)
            .finish()
    }
}

impl LatencyProber {
    pub fn new(role: ProberRole, collect_count: usize) -> Self {
        Self {
            role,
            collect_count: collect_count.max(1),
            hosts: RwLock::new(HashMap::new()),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn role(&self) -> ProberRole {
        self.role
    }

    /// Add one measurement; returns the new rolling average
    pub fn record_sample(&self, hostname: &str, latency_ms: f64) -> f64 {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        let entry = hosts.entry(hostname.to_string()).or_default();
        entry.samples.push_back(latency_ms);
        while entry.samples.len() > self.collect_count {
            entry.samples.pop_front();
        }
        entry.average = entry.samples.iter().sum::<f64>() / entry.samples.len() as f64;
        entry.average
    }

    /// Overwrite a host's average (follower path)
    pub fn set_average(&self, hostname: &str, average_ms: f64) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.entry(hostname.to_string()).or_default().average = average_ms;
    }

    pub fn average(&self, hostname: &str) -> Option<f64> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.get(hostname).map(|h| h.average)
    }

    /// Forget hosts that no longer have live nodes
    pub fn retain_hosts(&self, live: &HashSet<String>) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.retain(|host, _| live.contains(host));
    }

    /// Ping one node per distinct hostname
    pub async fn probe_once(&self, pinger: &dyn Pinger, targets: &dyn ProbeTargets) {
        let mut per_host: HashMap<String, NodeId> = HashMap::new();
        for (node_id, hostname) in targets.probe_targets().await {
            per_host.entry(hostname).or_insert(node_id);
        }

        let live: HashSet<String> = per_host.keys().cloned().collect();
        self.retain_hosts(&live);

        for (hostname, node_id) in per_host {
            match pinger.ping(&node_id).await {
                Ok(latency_ms) => {
                    let avg = self.record_sample(&hostname, latency_ms);
                    debug!(host = %hostname, node_id = %node_id, latency_ms, avg, "Latency sample");
                }
                Err(e) => {
                    warn!(host = %hostname, node_id = %node_id, error = %e, "Latency probe failed");
                }
            }
        }
    }

    /// Start the probe loop; followers never ping
    pub fn start(
        self: &Arc<Self>,
        pinger: Arc<dyn Pinger>,
        targets: Arc<dyn ProbeTargets>,
        time: Arc<dyn TimeProvider>,
        interval_ms: u64,
    ) {
        if self.role != ProberRole::Leader {
            return;
        }

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let prober = Arc::clone(self);
        info!(interval_ms, "Latency prober started");
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = time.sleep_ms(interval_ms) => {
                        prober.probe_once(pinger.as_ref(), targets.as_ref()).await;
                    }
                    _ = rx.changed() => break,
                }
            }
        }));
    }

    /// Stop the probe loop and wait for it to exit
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(true);
        }
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Prefers hosts with low measured latency
#[derive(Debug)]
pub struct LatencyStrategy {
    options: LatencyOptions,
    prober: Arc<LatencyProber>,
    rng: Arc<dyn RngProvider>,
}

impl LatencyStrategy {
    pub fn new(
        options: LatencyOptions,
        prober: Arc<LatencyProber>,
        rng: Arc<dyn RngProvider>,
    ) -> Self {
        Self {
            options,
            prober,
            rng,
        }
    }
}

impl Strategy for LatencyStrategy {
    fn name(&self) -> &str {
        "latency"
    }

    fn select(&self, candidates: &[&NodeId], ctx: &SelectionContext<'_>) -> Option<usize> {
        sample_lowest(
            candidates,
            self.options.sample_count,
            self.options.low_latency_ms,
            self.rng.as_ref(),
            |id| {
                ctx.nodes
                    .get(id)
                    .and_then(|node| node.hostname.as_deref())
                    .and_then(|host| self.prober.average(host))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::error::RegistryError;
    use meshwork_core::io::{ManualClock, StdRngProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedPinger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Pinger for FixedPinger {
        async fn ping(&self, node_id: &NodeId) -> RegistryResult<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match node_id.as_str() {
                "node-0" => Ok(40.0),
                "node-2" => Ok(3.0),
                _ => Err(RegistryError::node_not_found(node_id.as_str())),
            }
        }
    }

    struct StaticTargets(Vec<(NodeId, String)>);

    #[async_trait]
    impl ProbeTargets for StaticTargets {
        async fn probe_targets(&self) -> Vec<(NodeId, String)> {
            self.0.clone()
        }
    }

    #[test]
    fn test_rolling_average_window() {
        let prober = LatencyProber::new(ProberRole::Leader, 3);
        prober.record_sample("host-a", 10.0);
        prober.record_sample("host-a", 20.0);
        prober.record_sample("host-a", 30.0);
        assert_eq!(prober.average("host-a"), Some(20.0));

        // Oldest sample falls out
        prober.record_sample("host-a", 60.0);
        assert_eq!(prober.average("host-a"), Some(110.0 / 3.0));
        assert_eq!(prober.average("host-b"), None);
    }

    #[tokio::test]
    async fn test_pings_one_node_per_host() {
        let prober = LatencyProber::new(ProberRole::Leader, 5);
        prober.set_average("gone-host", 1.0);

        let ids = ids(3);
        let targets = StaticTargets(vec![
            (ids[0].clone(), "host-a".into()),
            (ids[1].clone(), "host-a".into()),
            (ids[2].clone(), "host-b".into()),
        ]);
        let pinger = FixedPinger {
            calls: AtomicUsize::new(0),
        };

        prober.probe_once(&pinger, &targets).await;

        assert_eq!(pinger.calls.load(Ordering::SeqCst), 2);
        assert_eq!(prober.average("host-a"), Some(40.0));
        assert_eq!(prober.average("host-b"), Some(3.0));
        assert_eq!(prober.average("gone-host"), None);
    }

    #[tokio::test]
    async fn test_ping_loop_fills_averages_until_stopped() {
        let clock = Arc::new(ManualClock::new(0));
        let prober = Arc::new(LatencyProber::new(ProberRole::Leader, 5));
        let pinger = Arc::new(FixedPinger {
            calls: AtomicUsize::new(0),
        });
        let ids = ids(3);
        let targets = Arc::new(StaticTargets(vec![
            (ids[0].clone(), "host-a".into()),
            (ids[2].clone(), "host-b".into()),
        ]));

        prober.start(pinger.clone(), targets, clock.clone(), 1_000);
        for _ in 0..100 {
            if prober.average("host-b").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(prober.average("host-a"), Some(40.0));
        assert_eq!(prober.average("host-b"), Some(3.0));
        assert!(clock.now_ms() >= 1_000);

        prober.stop().await;
        let calls = pinger.calls.load(Ordering::SeqCst);
        clock.advance_ms(10_000);
        tokio::task::yield_now().await;
        assert_eq!(pinger.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_follower_never_pings() {
        let clock = Arc::new(ManualClock::new(0));
        let prober = Arc::new(LatencyProber::new(ProberRole::Follower, 5));
        let pinger = Arc::new(FixedPinger {
            calls: AtomicUsize::new(0),
        });
        let targets = Arc::new(StaticTargets(vec![(ids(1)[0].clone(), "host-a".into())]));

        prober.start(pinger.clone(), targets, clock, 1_000);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        prober.stop().await;
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_strategy_prefers_low_latency_host() {
        let ids = ids(2);
        let mut catalog = catalog_with(&ids);
        catalog.get_mut(&ids[0]).unwrap().hostname = Some("far".into());
        catalog.get_mut(&ids[1]).unwrap().hostname = Some("near".into());

        let prober = Arc::new(LatencyProber::new(ProberRole::Follower, 5));
        prober.set_average("far", 120.0);
        prober.set_average("near", 2.0);

        let strategy = LatencyStrategy::new(
            LatencyOptions::default(),
            prober,
            Arc::new(StdRngProvider::with_seed(5)),
        );
        let refs: Vec<&NodeId> = ids.iter().collect();
        let ctx = SelectionContext {
            call: None,
            nodes: &catalog,
        };
        for _ in 0..10 {
            assert_eq!(strategy.select(&refs, &ctx), Some(1));
        }
    }
}
