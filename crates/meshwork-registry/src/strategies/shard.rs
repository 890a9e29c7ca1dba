//! Consistent-hashing (shard) strategy
//!
//! Each real node contributes `vnodes` labels (`{nodeID}-0` .. `{nodeID}-{vnodes-1}`)
//! hashed onto a ring of `ring_size` slots. A key maps to the first slot at or
//! after its own hash, wrapping to the first slot. When membership changes
//! only keys owned by the joining or leaving node move.
//!
//! The ring is rebuilt whenever the candidate set differs from the one it was
//! built for; resolved keys are cached in an LRU until the next rebuild.

use super::{SelectionContext, Strategy, StrategyDeps, StrategyFactory};
use crate::context::Context;
use crate::node::NodeId;
use lru::LruCache;
use meshwork_core::config::ShardOptions;
use meshwork_core::io::RngProvider;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Caller-supplied key extraction
pub type ShardKeyFn = Arc<dyn Fn(&Context) -> Option<String> + Send + Sync>;

struct Ring {
    members: Vec<NodeId>,
    slots: Vec<(u64, NodeId)>,
    cache: LruCache<String, NodeId>,
    rebuilds: u64,
}

pub struct ShardStrategy {
    options: ShardOptions,
    key_fn: Option<ShardKeyFn>,
    rng: Arc<dyn RngProvider>,
    ring: Mutex<Ring>,
}

impl std::fmt::Debug for ShardStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStrategy")
            .field("options", &self.options)
            .field("custom_key", &self.key_fn.is_some())
            .finish()
    }
}

impl ShardStrategy {
    pub fn new(options: ShardOptions, rng: Arc<dyn RngProvider>) -> Self {
        debug_assert!(options.vnodes > 0);
        debug_assert!(options.ring_size > 0);
        let capacity = NonZeroUsize::new(options.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            options,
            key_fn: None,
            rng,
            ring: Mutex::new(Ring {
                members: Vec::new(),
                slots: Vec::new(),
                cache: LruCache::new(capacity),
                rebuilds: 0,
            }),
        }
    }

    /// Use a function instead of a param/meta path to derive the key
    pub fn with_key_fn(mut self, key_fn: ShardKeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    /// How many times the ring has been built
    pub fn ring_rebuilds(&self) -> u64 {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).rebuilds
    }

    fn key_of(&self, call: &Context) -> Option<String> {
        if let Some(ref key_fn) = self.key_fn {
            return key_fn(call);
        }
        let path = self.options.key.as_deref()?;
        match call.lookup(path)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn hash(&self, key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        u64::from(value) % self.options.ring_size
    }

    fn rebuild(&self, ring: &mut Ring, members: Vec<NodeId>) {
        let mut slots = Vec::with_capacity(members.len() * self.options.vnodes);
        for node_id in &members {
            for i in 0..self.options.vnodes {
                let label = format!("{}-{}", node_id, i);
                slots.push((self.hash(&label), node_id.clone()));
            }
        }
        // Ties break on node id so every process builds the same ring
        slots.sort();

        ring.members = members;
        ring.slots = slots;
        ring.cache.clear();
        ring.rebuilds += 1;
    }
}

/// Owner of the first slot at or after `hash`, wrapping to the first slot
fn ring_owner(slots: &[(u64, NodeId)], hash: u64) -> Option<&NodeId> {
    if slots.is_empty() {
        return None;
    }
    let idx = slots.partition_point(|(slot, _)| *slot < hash);
    let idx = if idx >= slots.len() { 0 } else { idx };
    Some(&slots[idx].1)
}

impl Strategy for ShardStrategy {
    fn name(&self) -> &str {
        "shard"
    }

    fn select(&self, candidates: &[&NodeId], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let key = match ctx.call.and_then(|call| self.key_of(call)) {
            Some(key) => key,
            None => return Some(self.rng.gen_index(candidates.len())),
        };

        let mut members: Vec<NodeId> = candidates.iter().map(|id| (*id).clone()).collect();
        members.sort();
        members.dedup();

        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.members != members {
            self.rebuild(&mut ring, members);
        }

        let cached = ring.cache.get(&key).cloned();
        let owner = match cached {
            Some(owner) => owner,
            None => {
                let owner = ring_owner(&ring.slots, self.hash(&key))?.clone();
                ring.cache.put(key, owner.clone());
                owner
            }
        };

        candidates.iter().position(|id| **id == owner)
    }
}

/// Factory for shard strategies with a custom key function
pub struct ShardFactory {
    options: ShardOptions,
    key_fn: ShardKeyFn,
}

impl std::fmt::Debug for ShardFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardFactory")
            .field("options", &self.options)
            .finish()
    }
}

impl ShardFactory {
    pub fn new(options: ShardOptions, key_fn: ShardKeyFn) -> Self {
        Self { options, key_fn }
    }
}

impl StrategyFactory for ShardFactory {
    fn create(&self, deps: &StrategyDeps) -> Arc<dyn Strategy> {
        Arc::new(
            ShardStrategy::new(self.options.clone(), deps.rng.clone())
                .with_key_fn(self.key_fn.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use meshwork_core::constants::STRATEGY_SHARD_VNODES_COUNT_DEFAULT;
    use meshwork_core::io::StdRngProvider;
    use serde_json::json;
    use std::collections::HashMap;

    fn strategy(key: &str) -> ShardStrategy {
        ShardStrategy::new(
            ShardOptions {
                key: Some(key.to_string()),
                ..Default::default()
            },
            Arc::new(StdRngProvider::with_seed(11)),
        )
    }

    fn resolve_all(
        strategy: &ShardStrategy,
        candidates: &[NodeId],
        catalog: &crate::node_catalog::NodeCatalog,
        keys: usize,
    ) -> HashMap<usize, NodeId> {
        let refs: Vec<&NodeId> = candidates.iter().collect();
        let mut owners = HashMap::new();
        for k in 0..keys {
            let call = Context::new(json!({ "user": { "id": format!("user-{}", k) } }));
            let ctx = SelectionContext {
                call: Some(&call),
                nodes: catalog,
            };
            let idx = strategy.select(&refs, &ctx).unwrap();
            owners.insert(k, candidates[idx].clone());
        }
        owners
    }

    #[test]
    fn test_same_key_same_node() {
        let ids = ids(5);
        let catalog = catalog_with(&ids);
        let strategy = strategy("user.id");
        let first = resolve_all(&strategy, &ids, &catalog, 200);
        let second = resolve_all(&strategy, &ids, &catalog, 200);
        assert_eq!(first, second);
    }

    #[test]
    fn test_removing_node_remaps_bounded_fraction() {
        let ids = ids(10);
        let catalog = catalog_with(&ids);
        let strategy = strategy("user.id");
        let keys = 10_000;

        let before = resolve_all(&strategy, &ids, &catalog, keys);

        let removed = ids[3].clone();
        let remaining: Vec<NodeId> = ids.iter().filter(|id| **id != removed).cloned().collect();
        let after = resolve_all(&strategy, &remaining, &catalog, keys);

        let mut changed = 0;
        for k in 0..keys {
            if before[&k] != after[&k] {
                changed += 1;
                assert_eq!(before[&k], removed, "only keys of the removed node may move");
            }
        }

        let fraction = changed as f64 / keys as f64;
        assert!(changed > 0);
        assert!(fraction < 0.3, "remapped fraction {} too large", fraction);
    }

    #[test]
    fn test_meta_key_is_stable() {
        let ids = ids(3);
        let catalog = catalog_with(&ids);
        let strategy = strategy("#tenant");
        let refs: Vec<&NodeId> = ids.iter().collect();

        let call = Context::new(Value::Null).with_meta(json!({ "tenant": "acme" }));
        let ctx = SelectionContext {
            call: Some(&call),
            nodes: &catalog,
        };
        let first = strategy.select(&refs, &ctx).unwrap();
        for _ in 0..5 {
            assert_eq!(strategy.select(&refs, &ctx), Some(first));
        }

        let ring = strategy.ring.lock().unwrap();
        assert_eq!(ring.slots.len(), 3 * STRATEGY_SHARD_VNODES_COUNT_DEFAULT);
        assert_eq!(ring.cache.len(), 1);
    }

    #[test]
    fn test_ring_owner_wraps() {
        let a = NodeId::new("a").unwrap();
        let b = NodeId::new("b").unwrap();
        let slots = vec![(10, a.clone()), (20, b.clone())];

        assert_eq!(ring_owner(&slots, 0), Some(&a));
        assert_eq!(ring_owner(&slots, 10), Some(&a));
        assert_eq!(ring_owner(&slots, 11), Some(&b));
        assert_eq!(ring_owner(&slots, 21), Some(&a));
        assert_eq!(ring_owner(&[], 5), None);
    }

    #[test]
    fn test_custom_key_fn() {
        let ids = ids(4);
        let catalog = catalog_with(&ids);
        let key_fn: ShardKeyFn = Arc::new(|_ctx: &Context| Some("fixed".to_string()));
        let factory = ShardFactory::new(ShardOptions::default(), key_fn);
        let strategy = factory.create(&deps(2));

        let refs: Vec<&NodeId> = ids.iter().collect();
        let call = Context::default();
        let ctx = SelectionContext {
            call: Some(&call),
            nodes: &catalog,
        };
        let first = strategy.select(&refs, &ctx);
        assert!(first.is_some());
        assert_eq!(strategy.select(&refs, &ctx), first);
    }

    #[test]
    fn test_missing_key_falls_back_to_random() {
        let ids = ids(3);
        let catalog = catalog_with(&ids);
        let strategy = strategy("user.id");
        let refs: Vec<&NodeId> = ids.iter().collect();
        let ctx = SelectionContext {
            call: None,
            nodes: &catalog,
        };
        assert!(strategy.select(&refs, &ctx).unwrap() < 3);
    }
}
