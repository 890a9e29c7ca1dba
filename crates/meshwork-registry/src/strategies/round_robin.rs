//! Round-robin strategy

use super::{SelectionContext, Strategy};
use crate::node::NodeId;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cycles through candidates in order
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(&self, candidates: &[&NodeId], _ctx: &SelectionContext<'_>) -> Option<usize> {
        let len = candidates.len();
        if len == 0 {
            return None;
        }

        let result = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                // The list may have shrunk since the last pick
                let current = if current >= len { 0 } else { current };
                Some((current + 1) % len)
            });

        let previous = match result {
            Ok(prev) | Err(prev) => prev,
        };
        let index = if previous >= len { 0 } else { previous };

        debug_assert!(index < len);
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_covers_each_endpoint_once_per_cycle() {
        let ids = ids(4);
        let catalog = catalog_with(&ids);
        let refs: Vec<&NodeId> = ids.iter().collect();
        let ctx = SelectionContext {
            call: None,
            nodes: &catalog,
        };
        let strategy = RoundRobinStrategy::new();

        let first: Vec<usize> = (0..4).filter_map(|_| strategy.select(&refs, &ctx)).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);

        let second: Vec<usize> = (0..4).filter_map(|_| strategy.select(&refs, &ctx)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resets_when_list_shrinks() {
        let ids = ids(4);
        let catalog = catalog_with(&ids);
        let refs: Vec<&NodeId> = ids.iter().collect();
        let ctx = SelectionContext {
            call: None,
            nodes: &catalog,
        };
        let strategy = RoundRobinStrategy::new();

        for _ in 0..3 {
            strategy.select(&refs, &ctx);
        }
        assert_eq!(strategy.select(&refs[..2], &ctx), Some(0));
        assert_eq!(strategy.select(&refs[..2], &ctx), Some(1));
        assert_eq!(strategy.select(&[], &ctx), None);
    }
}
