//! CPU-usage strategy
//!
//! Uses the CPU figure each node reports in its heartbeats.

use super::{sample_lowest, SelectionContext, Strategy};
use crate::node::NodeId;
use meshwork_core::config::CpuUsageOptions;
use meshwork_core::io::RngProvider;
use std::sync::Arc;

#[derive(Debug)]
pub struct CpuUsageStrategy {
    options: CpuUsageOptions,
    rng: Arc<dyn RngProvider>,
}

impl CpuUsageStrategy {
    pub fn new(options: CpuUsageOptions, rng: Arc<dyn RngProvider>) -> Self {
        Self { options, rng }
    }
}

impl Strategy for CpuUsageStrategy {
    fn name(&self) -> &str {
        "cpu_usage"
    }

    fn select(&self, candidates: &[&NodeId], ctx: &SelectionContext<'_>) -> Option<usize> {
        sample_lowest(
            candidates,
            self.options.sample_count,
            self.options.low_cpu_usage,
            self.rng.as_ref(),
            |id| ctx.nodes.get(id).and_then(|node| node.cpu),
        )
    }
}
