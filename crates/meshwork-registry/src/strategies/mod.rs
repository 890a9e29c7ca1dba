//! Endpoint balancing strategies
//!
//! TigerStyle: Closed set of built-in strategies behind one trait, plus a
//! factory seam for caller-supplied implementations.
//!
//! A strategy only picks; it never sees endpoint availability. The endpoint
//! list retries around disabled picks.

mod cpu_usage;
mod latency;
mod random;
mod round_robin;
mod shard;

pub use cpu_usage::CpuUsageStrategy;
pub use latency::{LatencyProber, LatencyStrategy, Pinger, ProbeTargets, ProberRole};
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use shard::{ShardFactory, ShardKeyFn, ShardStrategy};

use crate::context::Context;
use crate::node::NodeId;
use crate::node_catalog::NodeCatalog;
use meshwork_core::config::StrategyConfig;
use meshwork_core::io::RngProvider;
use std::fmt;
use std::sync::Arc;

/// Inputs available to a strategy when picking
pub struct SelectionContext<'a> {
    /// The call being routed, if any
    pub call: Option<&'a Context>,
    pub nodes: &'a NodeCatalog,
}

/// Picks one candidate out of a list
pub trait Strategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Index into `candidates`, or `None` when nothing can be picked
    fn select(&self, candidates: &[&NodeId], ctx: &SelectionContext<'_>) -> Option<usize>;
}

/// Shared collaborators handed to every strategy at construction
#[derive(Clone)]
pub struct StrategyDeps {
    pub rng: Arc<dyn RngProvider>,
    pub latency: Arc<LatencyProber>,
}

/// Builds strategy instances for new endpoint lists
pub trait StrategyFactory: Send + Sync + fmt::Debug {
    fn create(&self, deps: &StrategyDeps) -> Arc<dyn Strategy>;
}

/// A strategy by configuration or by caller-supplied factory
#[derive(Clone, Debug)]
pub enum StrategySpec {
    Builtin(StrategyConfig),
    Custom(Arc<dyn StrategyFactory>),
}

impl StrategySpec {
    /// Configuration for built-in strategies; custom ones do not cross the wire
    pub fn builtin_config(&self) -> Option<StrategyConfig> {
        match self {
            Self::Builtin(config) => Some(config.clone()),
            Self::Custom(_) => None,
        }
    }
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self::Builtin(StrategyConfig::default())
    }
}

impl From<StrategyConfig> for StrategySpec {
    fn from(config: StrategyConfig) -> Self {
        Self::Builtin(config)
    }
}

/// Instantiate a strategy for one endpoint list
pub fn create_strategy(spec: &StrategySpec, deps: &StrategyDeps) -> Arc<dyn Strategy> {
    match spec {
        StrategySpec::Builtin(StrategyConfig::RoundRobin) => Arc::new(RoundRobinStrategy::new()),
        StrategySpec::Builtin(StrategyConfig::Random) => {
            Arc::new(RandomStrategy::new(deps.rng.clone()))
        }
        StrategySpec::Builtin(StrategyConfig::CpuUsage(opts)) => {
            Arc::new(CpuUsageStrategy::new(opts.clone(), deps.rng.clone()))
        }
        StrategySpec::Builtin(StrategyConfig::Latency(opts)) => Arc::new(LatencyStrategy::new(
            opts.clone(),
            deps.latency.clone(),
            deps.rng.clone(),
        )),
        StrategySpec::Builtin(StrategyConfig::Shard(opts)) => {
            Arc::new(ShardStrategy::new(opts.clone(), deps.rng.clone()))
        }
        StrategySpec::Custom(factory) => factory.create(deps),
    }
}

/// Shared sampling used by CPU and latency strategies
///
/// Samples up to `sample_count` candidates (all of them when there are no
/// more than that). Returns the first sample whose metric is below `low`,
/// else the sampled minimum, else a random candidate when no metric exists.
pub(crate) fn sample_lowest(
    candidates: &[&NodeId],
    sample_count: usize,
    low: f64,
    rng: &dyn RngProvider,
    metric: impl Fn(&NodeId) -> Option<f64>,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let len = candidates.len();
    let count = if sample_count == 0 || sample_count > len {
        len
    } else {
        sample_count
    };

    let mut best: Option<(usize, f64)> = None;
    for i in 0..count {
        let idx = if count == len { i } else { rng.gen_index(len) };
        if let Some(value) = metric(candidates[idx]) {
            if value < low {
                return Some(idx);
            }
            if best.map_or(true, |(_, v)| value < v) {
                best = Some((idx, value));
            }
        }
    }

    match best {
        Some((idx, _)) => Some(idx),
        None => Some(rng.gen_index(len)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::node::Node;
    use meshwork_core::io::StdRngProvider;

    pub fn ids(n: usize) -> Vec<NodeId> {
        (0..n)
            .map(|i| NodeId::new(format!("node-{}", i)).unwrap())
            .collect()
    }

    pub fn catalog_with(ids: &[NodeId]) -> NodeCatalog {
        let mut catalog = NodeCatalog::new(NodeId::new("local").unwrap(), "inst".into(), 0);
        for id in ids {
            catalog.add(Node::new(id.clone(), 0));
        }
        catalog
    }

    pub fn deps(seed: u64) -> StrategyDeps {
        StrategyDeps {
            rng: Arc::new(StdRngProvider::with_seed(seed)),
            latency: Arc::new(LatencyProber::new(ProberRole::Follower, 5)),
        }
    }
}
