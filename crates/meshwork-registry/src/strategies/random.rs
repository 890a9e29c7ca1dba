//! Uniform random strategy

use super::{SelectionContext, Strategy};
use crate::node::NodeId;
use meshwork_core::io::RngProvider;
use std::sync::Arc;

#[derive(Debug)]
pub struct RandomStrategy {
    rng: Arc<dyn RngProvider>,
}

impl RandomStrategy {
    pub fn new(rng: Arc<dyn RngProvider>) -> Self {
        Self { rng }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &str {
        "random"
    }

    fn select(&self, candidates: &[&NodeId], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.rng.gen_index(candidates.len()))
    }
}
