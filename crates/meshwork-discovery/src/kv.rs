//! Key-value store discovery
//!
//! TigerStyle: Short-TTL heartbeat keys, long-TTL INFO keys, explicit key layout.
//!
//! Key layout under `meshwork[-{namespace}]/discovery`:
//! - `beats/{nodeID}/{instanceHash}/{seq}`: heartbeat, TTL `interval * 3`
//! - `info/{nodeID}`: full INFO, TTL one hour, rewritten at half its TTL
//!
//! Most collection cycles only list heartbeat keys and read instance and
//! `seq` from the key name. Every `full_check`-th cycle fetches the values
//! too, which also refreshes remote CPU figures. A node that was online and
//! has no heartbeat key left is disconnected at once.

use crate::discoverer::{apply_remote_info, DiscoveryBackend};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::packet::Serializer;
use async_trait::async_trait;
use bytes::Bytes;
use meshwork_core::config::DiscovererConfig;
use meshwork_core::constants::{KV_INFO_TTL_SECS_DEFAULT, KV_INSTANCE_HASH_LENGTH_BYTES};
use meshwork_core::io::TimeProvider;
use meshwork_registry::{HeartbeatPayload, NodeId, NodeInfo, Registry};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Store contract
// =============================================================================

/// Minimal key-value surface the KV backend needs
#[async_trait]
pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    /// Write `value`, expiring after `ttl_secs`
    async fn put(&self, key: &str, value: Bytes, ttl_secs: u64) -> DiscoveryResult<()>;

    async fn get(&self, key: &str) -> DiscoveryResult<Option<Bytes>>;

    /// Every live key starting with `prefix`
    async fn keys(&self, prefix: &str) -> DiscoveryResult<Vec<String>>;

    /// Every live key and value starting with `prefix`
    async fn entries(&self, prefix: &str) -> DiscoveryResult<Vec<(String, Bytes)>>;

    async fn delete(&self, keys: &[String]) -> DiscoveryResult<()>;

    /// Release the connection and anything still attached to it
    async fn close(&self) -> DiscoveryResult<()>;
}

// =============================================================================
// Key layout
// =============================================================================

/// Builds and parses discovery keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvKeys {
    prefix: String,
}

impl KvKeys {
    pub fn new(namespace: Option<&str>) -> Self {
        let prefix = match namespace {
            Some(ns) if !ns.is_empty() => format!("meshwork-{}/discovery", ns),
            _ => "meshwork/discovery".to_string(),
        };
        Self { prefix }
    }

    pub fn beats_prefix(&self) -> String {
        format!("{}/beats/", self.prefix)
    }

    pub fn info_prefix(&self) -> String {
        format!("{}/info/", self.prefix)
    }

    pub fn beat_key(&self, node_id: &NodeId, instance_hash: &str, seq: u64) -> String {
        format!("{}{}/{}/{}", self.beats_prefix(), node_id, instance_hash, seq)
    }

    pub fn info_key(&self, node_id: &NodeId) -> String {
        format!("{}{}", self.info_prefix(), node_id)
    }

    /// `(node, instance hash, seq)` encoded in a heartbeat key
    pub fn parse_beat_key(&self, key: &str) -> Option<(NodeId, String, u64)> {
        let rest = key.strip_prefix(self.beats_prefix().as_str())?;
        let mut parts = rest.split('/');
        let node_id = NodeId::new(parts.next()?).ok()?;
        let instance_hash = parts.next()?.to_string();
        let seq = parts.next()?.parse().ok()?;
        if parts.next().is_some() || instance_hash.is_empty() {
            return None;
        }
        Some((node_id, instance_hash, seq))
    }
}

/// Leading part of an instance id as embedded in heartbeat keys
pub fn instance_hash(instance_id: &str) -> String {
    instance_id
        .chars()
        .filter(|c| *c != '/')
        .take(KV_INSTANCE_HASH_LENGTH_BYTES)
        .collect()
}

// =============================================================================
// Memory store
// =============================================================================

/// In-process store with TTLs on a [`TimeProvider`]'s monotonic clock
///
/// Several backends can share one instance to simulate a cluster.
pub struct MemoryKvStore {
    time: Arc<dyn TimeProvider>,
    entries: RwLock<BTreeMap<String, (Bytes, u64)>>,
    available: AtomicBool,
}

impl MemoryKvStore {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            time,
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails until re-enabled
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now_ms = self.time.monotonic_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|(_, exp)| *exp > now_ms).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, operation: &str) -> DiscoveryResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DiscoveryError::store(operation, "store unavailable"))
        }
    }

    fn live_with_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let now_ms = self.time.monotonic_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, (_, exp))| *exp > now_ms)
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, value: Bytes, ttl_secs: u64) -> DiscoveryResult<()> {
        self.check("put")?;
        let now_ms = self.time.monotonic_ms();
        let expires_ms = now_ms + ttl_secs * 1000;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, exp)| *exp > now_ms);
        entries.insert(key.to_string(), (value, expires_ms));
        Ok(())
    }

    async fn get(&self, key: &str) -> DiscoveryResult<Option<Bytes>> {
        self.check("get")?;
        let now_ms = self.time.monotonic_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|(_, exp)| *exp > now_ms)
            .map(|(value, _)| value.clone()))
    }

    async fn keys(&self, prefix: &str) -> DiscoveryResult<Vec<String>> {
        self.check("keys")?;
        Ok(self
            .live_with_prefix(prefix)
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn entries(&self, prefix: &str) -> DiscoveryResult<Vec<(String, Bytes)>> {
        self.check("entries")?;
        Ok(self.live_with_prefix(prefix))
    }

    async fn delete(&self, keys: &[String]) -> DiscoveryResult<()> {
        self.check("delete")?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn close(&self) -> DiscoveryResult<()> {
        Ok(())
    }
}

// =============================================================================
// KV backend
// =============================================================================

#[derive(Debug, Default)]
struct KvState {
    /// `seq` of the INFO last written; 0 forces a rewrite
    last_info_seq: u64,
    last_info_put_ms: u64,
    /// `seq` of the heartbeat key last written; 0 forces a rewrite
    last_beat_seq: u64,
    beat_key: Option<String>,
    cycle: u64,
}

/// Discovery over a [`KvStore`] (etcd, redis, memory)
pub struct KvBackend {
    registry: Arc<Registry>,
    store: Arc<dyn KvStore>,
    keys: KvKeys,
    serializer: Serializer,
    beat_ttl_secs: u64,
    info_ttl_secs: u64,
    full_check: u64,
    state: Mutex<KvState>,
}

impl KvBackend {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn KvStore>,
        namespace: Option<&str>,
        serializer: Serializer,
        config: &DiscovererConfig,
    ) -> Self {
        debug_assert!(config.full_check > 0);
        Self {
            registry,
            store,
            keys: KvKeys::new(namespace),
            serializer,
            beat_ttl_secs: config.beat_ttl_secs(),
            info_ttl_secs: KV_INFO_TTL_SECS_DEFAULT,
            full_check: config.full_check.max(1),
            state: Mutex::new(KvState::default()),
        }
    }

    pub fn keys(&self) -> &KvKeys {
        &self.keys
    }

    fn state(&self) -> std::sync::MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget what was written so the next cycle re-announces everything
    fn reset_sequences(&self) {
        let mut state = self.state();
        state.last_info_seq = 0;
        state.last_beat_seq = 0;
        state.last_info_put_ms = 0;
    }

    fn info_refresh_due(&self, seq: u64, now_ms: u64) -> bool {
        let state = self.state();
        let half_ttl_ms = self.info_ttl_secs * 1000 / 2;
        state.last_info_seq != seq || now_ms.saturating_sub(state.last_info_put_ms) >= half_ttl_ms
    }

    async fn write_heartbeat(&self) -> DiscoveryResult<()> {
        let beat = self.registry.local_heartbeat().await;
        let key = self.keys.beat_key(
            &beat.sender,
            &instance_hash(&beat.instance_id),
            beat.seq,
        );

        let previous = {
            let state = self.state();
            state.beat_key.clone().filter(|old| *old != key)
        };
        if let Some(old) = previous {
            if let Err(e) = self.store.delete(&[old]).await {
                debug!(error = %e, "Failed to delete previous heartbeat key");
            }
        }

        let raw = self.serializer.encode(&beat)?;
        self.store.put(&key, raw, self.beat_ttl_secs).await?;

        let mut state = self.state();
        state.beat_key = Some(key);
        state.last_beat_seq = beat.seq;
        Ok(())
    }

    /// Read every heartbeat, refresh the ones we know, drop the vanished
    #[instrument(skip(self), level = "debug")]
    pub async fn collect_online_nodes(&self) -> DiscoveryResult<()> {
        let full = {
            let mut state = self.state();
            let full = state.cycle % self.full_check == 0;
            state.cycle = state.cycle.wrapping_add(1);
            full
        };

        let beats = if full {
            self.read_full_beats().await?
        } else {
            self.read_beat_keys().await?
        };

        let local_id = self.registry.local_node_id();
        let mut latest: HashMap<NodeId, HeartbeatPayload> = HashMap::new();
        for beat in beats {
            if beat.sender == *local_id {
                continue;
            }
            let newer = latest
                .get(&beat.sender)
                .map_or(true, |known| beat.seq > known.seq);
            if newer {
                latest.insert(beat.sender.clone(), beat);
            }
        }

        let online: HashSet<NodeId> = latest.keys().cloned().collect();
        for beat in latest.values() {
            if let Err(e) = self.heartbeat_received(&self.registry, beat).await {
                warn!(node_id = %beat.sender, error = %e, "Failed to refresh node");
            }
        }

        for node_id in self.registry.available_remote_nodes().await {
            if !online.contains(&node_id) {
                info!(node_id = %node_id, "Heartbeat key vanished");
                self.registry.node_disconnected(&node_id, true).await;
            }
        }
        Ok(())
    }

    async fn read_full_beats(&self) -> DiscoveryResult<Vec<HeartbeatPayload>> {
        let entries = self.store.entries(&self.keys.beats_prefix()).await?;
        let mut beats = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match self.serializer.decode::<HeartbeatPayload>(&raw) {
                Ok(beat) => beats.push(beat),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable heartbeat"),
            }
        }
        Ok(beats)
    }

    async fn read_beat_keys(&self) -> DiscoveryResult<Vec<HeartbeatPayload>> {
        let keys = self.store.keys(&self.keys.beats_prefix()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.parse_beat_key(key))
            .map(|(sender, instance_id, seq)| HeartbeatPayload {
                sender,
                cpu: None,
                seq,
                instance_id,
            })
            .collect())
    }
}

#[async_trait]
impl DiscoveryBackend for KvBackend {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn start(&self) -> DiscoveryResult<()> {
        *self.state() = KvState::default();
        info!(
            node_id = %self.registry.local_node_id(),
            store = self.store.name(),
            beat_ttl_secs = self.beat_ttl_secs,
            "KV discovery started"
        );
        Ok(())
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        let mut doomed = vec![self.keys.info_key(self.registry.local_node_id())];
        let beat_key = self.state().beat_key.take();
        doomed.extend(beat_key);

        if let Err(e) = self.store.delete(&doomed).await {
            error!(error = %e, "Failed to remove own keys");
        }
        self.store.close().await
    }

    async fn send_heartbeat(&self) -> DiscoveryResult<()> {
        let now_ms = self.registry.io().monotonic_ms();
        let info_seq = self.registry.get_local_node_info().await.seq;
        if self.info_refresh_due(info_seq, now_ms) {
            self.send_local_node_info(None).await?;
        }

        if let Err(e) = self.write_heartbeat().await {
            self.reset_sequences();
            return Err(e);
        }

        self.collect_online_nodes().await
    }

    /// KV INFO is visible to everyone; `target` is ignored
    async fn send_local_node_info(&self, _target: Option<&NodeId>) -> DiscoveryResult<()> {
        let info = self.registry.get_local_node_info().await;
        let key = self.keys.info_key(&info.sender);
        let raw = self.serializer.encode(&info)?;

        if let Err(e) = self.store.put(&key, raw, self.info_ttl_secs).await {
            self.reset_sequences();
            return Err(e);
        }

        let mut state = self.state();
        state.last_info_seq = info.seq;
        state.last_info_put_ms = self.registry.io().monotonic_ms();
        Ok(())
    }

    async fn discover_node(&self, node_id: &NodeId) -> DiscoveryResult<()> {
        let raw = match self.store.get(&self.keys.info_key(node_id)).await? {
            Some(raw) => raw,
            None => {
                debug!(node_id = %node_id, "No INFO stored for node");
                return Ok(());
            }
        };
        let info: NodeInfo = self.serializer.decode(&raw)?;
        apply_remote_info(&self.registry, info).await;
        Ok(())
    }

    /// Fetch INFO for every node that still has a heartbeat key
    ///
    /// INFO keys outlive crashed nodes by up to their TTL, so they are never
    /// enumerated directly.
    async fn discover_all_nodes(&self) -> DiscoveryResult<()> {
        let local_id = self.registry.local_node_id();
        let live: HashSet<NodeId> = self
            .store
            .keys(&self.keys.beats_prefix())
            .await?
            .iter()
            .filter_map(|key| self.keys.parse_beat_key(key))
            .map(|(node_id, _, _)| node_id)
            .filter(|node_id| node_id != local_id)
            .collect();

        debug!(count = live.len(), "Discovering nodes with live heartbeats");
        for node_id in &live {
            if let Err(e) = self.discover_node(node_id).await {
                warn!(node_id = %node_id, error = %e, "Failed to fetch node INFO");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_core::config::SerializerKind;
    use meshwork_core::io::{IoContext, ManualClock};
    use meshwork_registry::ServiceDefinition;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    struct Cluster {
        clock: Arc<ManualClock>,
        store: Arc<MemoryKvStore>,
        config: DiscovererConfig,
    }

    impl Cluster {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(1_000));
            Self {
                store: Arc::new(MemoryKvStore::new(clock.clone())),
                clock,
                config: DiscovererConfig {
                    full_check: 3,
                    ..DiscovererConfig::for_testing()
                },
            }
        }

        fn member(&self, id: &str, seed: u64) -> (Arc<Registry>, KvBackend) {
            let registry = Arc::new(
                Registry::builder()
                    .node_id(node(id))
                    .io(IoContext::for_testing(self.clock.clone(), seed))
                    .build(),
            );
            let backend = KvBackend::new(
                registry.clone(),
                self.store.clone(),
                Some("test"),
                Serializer::new(SerializerKind::Cbor),
                &self.config,
            );
            (registry, backend)
        }

        fn store_keys(&self) -> KvKeys {
            KvKeys::new(Some("test"))
        }
    }

    #[test]
    fn test_key_layout() {
        let keys = KvKeys::new(Some("prod"));
        let key = keys.beat_key(&node("node-1"), "a1b2c3d4", 7);
        assert_eq!(key, "meshwork-prod/discovery/beats/node-1/a1b2c3d4/7");
        assert_eq!(keys.info_key(&node("node-1")), "meshwork-prod/discovery/info/node-1");
        assert_eq!(
            keys.parse_beat_key(&key),
            Some((node("node-1"), "a1b2c3d4".to_string(), 7))
        );

        assert_eq!(KvKeys::new(None).beats_prefix(), "meshwork/discovery/beats/");
        assert_eq!(keys.parse_beat_key("meshwork-prod/discovery/beats/node-1/x"), None);
        assert_eq!(keys.parse_beat_key("meshwork-prod/discovery/beats/node-1/x/nan"), None);
        assert_eq!(instance_hash("0123456789abcdef"), "01234567");
    }

    #[tokio::test]
    async fn test_memory_store_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryKvStore::new(clock.clone());
        store.put("a/1", Bytes::from_static(b"x"), 2).await.unwrap();
        store.put("a/2", Bytes::from_static(b"y"), 10).await.unwrap();
        store.put("b/1", Bytes::from_static(b"z"), 10).await.unwrap();

        assert_eq!(store.keys("a/").await.unwrap(), vec!["a/1", "a/2"]);
        clock.advance_ms(2_000);
        assert_eq!(store.keys("a/").await.unwrap(), vec!["a/2"]);
        assert_eq!(store.get("a/1").await.unwrap(), None);

        store.set_available(false);
        assert!(store.get("a/2").await.is_err());
    }

    #[tokio::test]
    async fn test_nodes_find_each_other_through_store() {
        let cluster = Cluster::new();
        let (ra, a) = cluster.member("a", 1);
        let (rb, b) = cluster.member("b", 2);
        ra.register_local_service(ServiceDefinition::new("users"))
            .await
            .unwrap();

        a.start().await.unwrap();
        b.start().await.unwrap();
        a.send_heartbeat().await.unwrap();
        b.send_heartbeat().await.unwrap();
        a.send_heartbeat().await.unwrap();

        assert!(ra.is_node_available(&node("b")).await);
        assert!(rb.is_node_available(&node("a")).await);
        let services = rb.get_service_list(Default::default()).await;
        assert!(services.iter().any(|s| s.name == "users" && s.node_id == "a"));
    }

    #[tokio::test]
    async fn test_fast_path_reads_only_keys() {
        let cluster = Cluster::new();
        let (_ra, a) = cluster.member("a", 1);
        let (rb, b) = cluster.member("b", 2);
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.send_heartbeat().await.unwrap();
        // Cycle 0 is a full read
        b.send_heartbeat().await.unwrap();
        assert!(rb.is_node_available(&node("a")).await);

        // Cycles 1 and 2 parse keys; the truncated instance id still matches
        let mut events = rb.subscribe();
        b.send_heartbeat().await.unwrap();
        b.send_heartbeat().await.unwrap();
        assert!(rb.is_node_available(&node("a")).await);
        assert!(events.try_recv().is_err(), "no reconnect from a key-only read");
    }

    #[tokio::test]
    async fn test_vanished_key_disconnects() {
        let cluster = Cluster::new();
        let (_ra, a) = cluster.member("a", 1);
        let (rb, b) = cluster.member("b", 2);
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.send_heartbeat().await.unwrap();
        b.send_heartbeat().await.unwrap();
        assert!(rb.is_node_available(&node("a")).await);

        // a stops beating; its key outlives nothing past the TTL
        cluster.clock.advance_ms(cluster.config.beat_ttl_secs() * 1000 + 1);
        b.send_heartbeat().await.unwrap();
        assert!(!rb.is_node_available(&node("a")).await);
    }

    #[tokio::test]
    async fn test_startup_discovery_skips_crashed_nodes() {
        let cluster = Cluster::new();
        let (_ra, a) = cluster.member("a", 1);
        let (_rc, c) = cluster.member("c", 3);
        a.start().await.unwrap();
        a.send_heartbeat().await.unwrap();

        // a crashes: its INFO key lives on, its heartbeat key expires
        cluster.clock.advance_ms(cluster.config.beat_ttl_secs() * 1000 + 1);
        c.start().await.unwrap();
        c.send_heartbeat().await.unwrap();
        assert!(cluster
            .store
            .get(&cluster.store_keys().info_key(&node("a")))
            .await
            .unwrap()
            .is_some());

        let (rb, b) = cluster.member("b", 2);
        let mut events = rb.subscribe();
        b.start().await.unwrap();
        b.discover_all_nodes().await.unwrap();

        assert!(!rb.has_node(&node("a")).await);
        assert!(rb.is_node_available(&node("c")).await);
        let mut connected = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let meshwork_registry::RegistryEvent::NodeConnected { node_id, .. } = event {
                connected.push(node_id);
            }
        }
        assert_eq!(connected, vec![node("c")]);
    }

    #[tokio::test]
    async fn test_graceful_stop_removes_keys() {
        let cluster = Cluster::new();
        let (_ra, a) = cluster.member("a", 1);
        a.start().await.unwrap();
        a.send_heartbeat().await.unwrap();
        assert_eq!(cluster.store.len(), 2);

        a.stop().await.unwrap();
        assert!(cluster.store.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_forces_full_reannounce() {
        let cluster = Cluster::new();
        let (_ra, a) = cluster.member("a", 1);
        a.start().await.unwrap();
        a.send_heartbeat().await.unwrap();
        assert_eq!(a.state().last_info_seq, 1);

        cluster.store.set_available(false);
        assert!(a.send_heartbeat().await.is_err());
        assert_eq!(a.state().last_info_seq, 0);
        assert_eq!(a.state().last_beat_seq, 0);

        // Store came back empty, as after a restart
        cluster.store.set_available(true);
        cluster.clock.advance_ms(KV_INFO_TTL_SECS_DEFAULT * 1000);
        assert!(cluster.store.is_empty());

        a.send_heartbeat().await.unwrap();
        assert_eq!(cluster.store.len(), 2);
        assert_eq!(a.state().last_info_seq, 1);
    }

    #[tokio::test]
    async fn test_seq_change_replaces_beat_key() {
        let cluster = Cluster::new();
        let (ra, a) = cluster.member("a", 1);
        a.start().await.unwrap();
        a.send_heartbeat().await.unwrap();
        let first = a.state().beat_key.clone().unwrap();

        ra.register_local_service(ServiceDefinition::new("users"))
            .await
            .unwrap();
        a.send_heartbeat().await.unwrap();
        let second = a.state().beat_key.clone().unwrap();

        assert_ne!(first, second);
        let beats = cluster.store.keys(&a.keys().beats_prefix()).await.unwrap();
        assert_eq!(beats, vec![second]);
    }
}
