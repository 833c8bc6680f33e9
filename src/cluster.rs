//! Redis-backed implementation of the remote client contract.
//!
//! Keys are sharded across the configured nodes by a stable hash, with
//! writes mirrored to `replication_factor` consecutive nodes and reads
//! falling back to replicas on a primary failure. Each node uses a
//! `ConnectionManager`, which reconnects automatically. Every command runs
//! under the configured deadline; a timeout is a transport error like any
//! other.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::traits::RemoteClient;

/// Cluster-aware Redis client implementing [`RemoteClient`].
pub struct RedisClusterClient {
    nodes: Vec<ConnectionManager>,
    replication: usize,
    timeout: Duration,
}

impl RedisClusterClient {
    /// Connect to every configured node and verify each with a PING.
    ///
    /// # Errors
    ///
    /// Returns an error if no nodes are configured or any node is
    /// unreachable at startup.
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            bail!("no redis nodes configured");
        }

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for url in &config.nodes {
            let client = Client::open(url.as_str())
                .with_context(|| format!("failed to create redis client for {url}"))?;
            let manager = ConnectionManager::new(client)
                .await
                .with_context(|| format!("failed to connect to redis node {url}"))?;

            let mut conn = manager.clone();
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .with_context(|| format!("redis PING failed for {url}"))?;

            debug!(node = %url, "redis node connected");
            nodes.push(manager);
        }

        let replication = (config.replication_factor.max(1) as usize).min(nodes.len());
        info!(
            nodes = nodes.len(),
            replication, "redis cluster client ready"
        );

        Ok(Self {
            nodes,
            replication,
            timeout: config.timeout,
        })
    }

    /// Connect to a single node with the default replication of one.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unreachable.
    pub async fn connect_single(url: &str, timeout: Duration) -> Result<Self> {
        let config = ClusterConfig {
            enabled: true,
            nodes: vec![url.to_string()],
            replication_factor: 1,
            timeout,
            ..ClusterConfig::default()
        };
        Self::connect(&config).await
    }

    fn shard_index(&self, key: &str) -> usize {
        shard_for(key, self.nodes.len())
    }

    /// Primary node plus its replicas, in preference order.
    fn replica_set(&self, key: &str) -> Vec<ConnectionManager> {
        let primary = self.shard_index(key);
        (0..self.replication)
            .map(|i| self.nodes[(primary + i) % self.nodes.len()].clone())
            .collect()
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.context("redis command failed"),
            Err(_) => bail!("redis command timed out after {:?}", self.timeout),
        }
    }

    async fn scan_node(&self, mut conn: ConnectionManager, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, mut batch): (u64, Vec<String>) = self
                .deadline(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;
            keys.append(&mut batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl RemoteClient for RedisClusterClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut last_err = None;
        for mut conn in self.replica_set(key) {
            match self.deadline(conn.get::<_, Option<Vec<u8>>>(key)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(key = %key, error = %e, "redis get failed, trying replica");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no redis nodes available")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut first_err = None;
        let mut stored = 0usize;
        for mut conn in self.replica_set(key) {
            match self
                .deadline(conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()))
                .await
            {
                Ok(()) => stored += 1,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if stored == 0 {
            return Err(first_err.unwrap_or_else(|| anyhow::anyhow!("no redis nodes available")));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut deleted = false;
        let mut first_err = None;
        let mut reached = 0usize;
        for mut conn in self.replica_set(key) {
            match self.deadline(conn.del::<_, usize>(key)).await {
                Ok(count) => {
                    reached += 1;
                    deleted |= count > 0;
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if reached == 0 {
            return Err(first_err.unwrap_or_else(|| anyhow::anyhow!("no redis nodes available")));
        }
        Ok(deleted)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // Group keys per shard, fetch per node, then scatter back in order.
        let mut by_node: HashMap<usize, Vec<(usize, String)>> = HashMap::new();
        for (idx, key) in keys.iter().enumerate() {
            by_node
                .entry(self.shard_index(key))
                .or_default()
                .push((idx, key.clone()));
        }

        let mut results: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        for (node_idx, group) in by_node {
            let mut conn = self.nodes[node_idx].clone();
            let mut cmd = redis::cmd("MGET");
            for (_, key) in &group {
                cmd.arg(key);
            }
            let values: Vec<Option<Vec<u8>>> =
                self.deadline(cmd.query_async(&mut conn)).await?;
            for ((idx, _), value) in group.into_iter().zip(values) {
                results[idx] = value;
            }
        }
        Ok(results)
    }

    async fn mset(&self, items: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut by_node: HashMap<usize, Vec<&(String, Vec<u8>)>> = HashMap::new();
        for item in items {
            for i in 0..self.replication {
                let node = (self.shard_index(&item.0) + i) % self.nodes.len();
                by_node.entry(node).or_default().push(item);
            }
        }

        for (node_idx, group) in by_node {
            let mut conn = self.nodes[node_idx].clone();
            let mut pipe = redis::pipe();
            for (key, value) in group {
                pipe.cmd("SETEX")
                    .arg(key)
                    .arg(ttl.as_secs())
                    .arg(value.as_slice())
                    .ignore();
            }
            let () = self.deadline(pipe.query_async(&mut conn)).await?;
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        // Replicated keys appear on several nodes; dedup across shards.
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for conn in self.nodes.iter().cloned() {
            for key in self.scan_node(conn, pattern).await? {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        debug!(pattern = %pattern, count = keys.len(), "scanned redis cluster");
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        for mut conn in self.nodes.iter().cloned() {
            let _: String = self
                .deadline(redis::cmd("PING").query_async(&mut conn))
                .await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis-cluster"
    }
}

/// Stable key-to-shard mapping. Uses a cryptographic digest so every
/// process in a deployment agrees on placement regardless of hasher seeds.
fn shard_for(key: &str, node_count: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % node_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_mapping_is_stable_and_in_range() {
        for nodes in [1, 2, 3, 5, 16] {
            for i in 0..200 {
                let key = format!("app:prod:user:{i}");
                let shard = shard_for(&key, nodes);
                assert!(shard < nodes);
                assert_eq!(shard, shard_for(&key, nodes));
            }
        }
    }

    #[test]
    fn shards_spread_across_nodes() {
        let nodes = 4;
        let mut counts = vec![0usize; nodes];
        for i in 0..1000 {
            counts[shard_for(&format!("key:{i}"), nodes)] += 1;
        }
        for (shard, count) in counts.iter().enumerate() {
            assert!(*count > 100, "shard {shard} is starved: {count}/1000");
        }
    }
}
