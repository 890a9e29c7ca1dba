//! Redis store for KV discovery
//!
//! One shared `ConnectionManager` per store; it reconnects on its own, and
//! the KV backend re-announces after any failed write.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::kv::KvStore;
use async_trait::async_trait;
use bytes::Bytes;
use meshwork_core::config::RedisOptions;
use redis::aio::ConnectionManager;
use tracing::info;

pub struct RedisStore {
    connection_manager: ConnectionManager,
    scan_length: usize,
}

impl RedisStore {
    pub async fn connect(opts: &RedisOptions, scan_length: usize) -> DiscoveryResult<Self> {
        let client = redis::Client::open(opts.url.as_str())
            .map_err(|e| DiscoveryError::store("open", e))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| DiscoveryError::store("connect", e))?;

        info!("Connected to redis");
        Ok(Self {
            connection_manager,
            scan_length: scan_length.max(1),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn put(&self, key: &str, value: Bytes, ttl_secs: u64) -> DiscoveryResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| DiscoveryError::store("put", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> DiscoveryResult<Option<Bytes>> {
        let mut conn = self.connection_manager.clone();
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| DiscoveryError::store("get", e))?;
        Ok(raw.map(Bytes::from))
    }

    async fn keys(&self, prefix: &str) -> DiscoveryResult<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_length)
                .query_async(&mut conn)
                .await
                .map_err(|e| DiscoveryError::store("scan", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn entries(&self, prefix: &str) -> DiscoveryResult<Vec<(String, Bytes)>> {
        let keys = self.keys(prefix).await?;
        let mut conn = self.connection_manager.clone();
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.scan_length) {
            let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(|e| DiscoveryError::store("mget", e))?;
            // Keys that expired between SCAN and MGET come back empty
            for (key, value) in chunk.iter().zip(values) {
                if let Some(value) = value {
                    entries.push((key.clone(), Bytes::from(value)));
                }
            }
        }
        Ok(entries)
    }

    async fn delete(&self, keys: &[String]) -> DiscoveryResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| DiscoveryError::store("delete", e))?;
        Ok(())
    }

    async fn close(&self) -> DiscoveryResult<()> {
        Ok(())
    }
}
