//! etcd v3 store for KV discovery
//!
//! Every key is attached to its own lease so TTLs are enforced by etcd.
//! Rewriting a key grants a fresh lease and revokes the previous one.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::kv::KvStore;
use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{Client, ConnectOptions, DeleteOptions, GetOptions, PutOptions};
use meshwork_core::config::Etcd3Options;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct EtcdStore {
    client: Client,
    /// Lease currently attached to each key we wrote
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdStore {
    /// Connect to the configured endpoints
    pub async fn connect(opts: &Etcd3Options) -> DiscoveryResult<Self> {
        let mut connect_options = ConnectOptions::new()
            .with_timeout(Duration::from_millis(opts.connect_timeout_ms))
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));
        if let (Some(user), Some(password)) = (&opts.username, &opts.password) {
            connect_options = connect_options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(opts.endpoints.clone(), Some(connect_options))
            .await
            .map_err(|e| DiscoveryError::store("connect", e))?;

        info!(endpoints = ?opts.endpoints, "Connected to etcd");
        Ok(Self {
            client,
            leases: Mutex::new(HashMap::new()),
        })
    }

    fn take_lease(&self, key: &str) -> Option<i64> {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    fn name(&self) -> &str {
        "etcd3"
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn put(&self, key: &str, value: Bytes, ttl_secs: u64) -> DiscoveryResult<()> {
        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(ttl_secs as i64, None)
            .await
            .map_err(|e| DiscoveryError::store("lease_grant", e))?
            .id();

        client
            .put(key, value.to_vec(), Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(|e| DiscoveryError::store("put", e))?;

        let previous = self
            .leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), lease_id);
        if let Some(previous) = previous {
            // The key now hangs off the new lease; the old one holds nothing
            if let Err(e) = client.lease_revoke(previous).await {
                debug!(key, error = %e, "Failed to revoke replaced lease");
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> DiscoveryResult<Option<Bytes>> {
        let mut client = self.client.clone();
        let response = client
            .get(key, None)
            .await
            .map_err(|e| DiscoveryError::store("get", e))?;
        Ok(response
            .kvs()
            .first()
            .map(|kv| Bytes::copy_from_slice(kv.value())))
    }

    async fn keys(&self, prefix: &str) -> DiscoveryResult<Vec<String>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await
            .map_err(|e| DiscoveryError::store("keys", e))?;
        Ok(response
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok().map(str::to_string))
            .collect())
    }

    async fn entries(&self, prefix: &str) -> DiscoveryResult<Vec<(String, Bytes)>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::store("entries", e))?;
        Ok(response
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = kv.key_str().ok()?.to_string();
                Some((key, Bytes::copy_from_slice(kv.value())))
            })
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> DiscoveryResult<()> {
        let mut client = self.client.clone();
        for key in keys {
            client
                .delete(key.as_str(), Some(DeleteOptions::new()))
                .await
                .map_err(|e| DiscoveryError::store("delete", e))?;
            if let Some(lease_id) = self.take_lease(key) {
                if let Err(e) = client.lease_revoke(lease_id).await {
                    debug!(key = %key, error = %e, "Failed to revoke lease");
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> DiscoveryResult<()> {
        let leases: Vec<i64> = self
            .leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, lease_id)| lease_id)
            .collect();

        let mut client = self.client.clone();
        for lease_id in leases {
            client
                .lease_revoke(lease_id)
                .await
                .map_err(|e| DiscoveryError::store("lease_revoke", e))?;
        }
        Ok(())
    }
}
