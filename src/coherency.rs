//! Cross-tier coherency.
//!
//! After the orchestrator performs a write or delete, the coherency manager
//! decides how the remaining tiers learn about it, governed by the selected
//! protocol (for writes) and invalidation strategy (for deletes). A periodic
//! check drains lazily queued deletes and reconciles detected divergence,
//! resolving toward the newest version or, absent versioning, toward "not
//! present".
//!
//! Asynchronous fan-out is bounded by a semaphore; propagations that cannot
//! acquire a permit are dropped and counted, never surfaced to callers.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{CoherencyConfig, CoherencyProtocol, InvalidationStrategy};
use crate::keys::KeyCodec;
use crate::l1_cache::L1Cache;
use crate::l2_cache::L2Cache;
use crate::l3_cache::{ContentType, L3Cache};
use crate::stats::Tier;

/// Upper bound on the lazily queued delete backlog.
const LAZY_QUEUE_MAX: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    deleted_at: Instant,
}

/// Propagates writes and deletes across tiers.
pub struct CoherencyManager {
    config: CoherencyConfig,
    keys: KeyCodec,
    l1: Option<Arc<L1Cache>>,
    l2: Option<L2Cache>,
    l3: Option<Arc<L3Cache>>,
    versions: DashMap<String, u64>,
    tombstones: DashMap<String, Tombstone>,
    lazy_deletes: Mutex<VecDeque<String>>,
    fanout: Arc<Semaphore>,
    ops: AtomicU64,
    dropped: AtomicU64,
}

impl CoherencyManager {
    #[must_use]
    pub fn new(
        config: CoherencyConfig,
        keys: KeyCodec,
        l1: Option<Arc<L1Cache>>,
        l2: Option<L2Cache>,
        l3: Option<Arc<L3Cache>>,
    ) -> Self {
        let fanout = Arc::new(Semaphore::new(config.max_concurrent_fanout.max(1)));
        Self {
            config,
            keys,
            l1,
            l2,
            l3,
            versions: DashMap::new(),
            tombstones: DashMap::new(),
            lazy_deletes: Mutex::new(VecDeque::new()),
            fanout,
            ops: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn enabled_tiers(&self) -> Vec<Tier> {
        let mut tiers = Vec::with_capacity(3);
        if self.l1.is_some() {
            tiers.push(Tier::L1);
        }
        if self.l2.is_some() {
            tiers.push(Tier::L2);
        }
        if self.l3.is_some() {
            tiers.push(Tier::L3);
        }
        tiers
    }

    /// React to a successful write. `written` lists the tiers the
    /// orchestrator already stored the value in.
    pub async fn on_write(
        self: &Arc<Self>,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
        written: &[Tier],
    ) {
        if self.config.versioning_enabled {
            self.bump_version(key);
            self.tombstones.remove(key);
        }

        match self.config.protocol {
            CoherencyProtocol::WriteThrough => {
                for tier in self.enabled_tiers() {
                    if !written.contains(&tier) {
                        self.push_value(tier, key, value, ttl).await;
                        self.ops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            // Tier-local write-behind queues handle eventual propagation.
            CoherencyProtocol::WriteBehind => {}
            CoherencyProtocol::Invalidate => {
                for tier in self.enabled_tiers() {
                    if !written.contains(&tier) {
                        self.remove_value(tier, key).await;
                        self.ops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            CoherencyProtocol::Broadcast => {
                for tier in self.enabled_tiers() {
                    match Arc::clone(&self.fanout).try_acquire_owned() {
                        Ok(permit) => {
                            let mgr = Arc::clone(self);
                            let key = key.to_string();
                            let value = value.clone();
                            tokio::spawn(async move {
                                mgr.push_value(tier, &key, &value, ttl).await;
                                drop(permit);
                            });
                            self.ops.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            CoherencyProtocol::WriteBack => {
                // The value is authoritative in the hottest tier it reached;
                // the rest invalidate and refill on their next read.
                let authoritative = [Tier::L1, Tier::L2, Tier::L3]
                    .into_iter()
                    .find(|t| written.contains(t) && self.enabled_tiers().contains(t));
                for tier in self.enabled_tiers() {
                    if Some(tier) != authoritative {
                        self.remove_value(tier, key).await;
                        self.ops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// React to a delete. `affected` lists tiers the orchestrator already
    /// removed the key from.
    pub async fn on_delete(self: &Arc<Self>, key: &str, affected: &[Tier]) {
        if self.config.versioning_enabled {
            let version = self.bump_version(key);
            self.tombstones.insert(
                key.to_string(),
                Tombstone {
                    version,
                    deleted_at: Instant::now(),
                },
            );
        }

        match self.config.invalidation_strategy {
            InvalidationStrategy::Immediate => {
                for tier in self.enabled_tiers() {
                    if !affected.contains(&tier) {
                        self.remove_value(tier, key).await;
                        self.ops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            InvalidationStrategy::Lazy => {
                let mut queue = self.lazy_deletes.lock();
                if queue.len() < LAZY_QUEUE_MAX {
                    queue.push_back(key.to_string());
                    self.ops.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Tiers converge as their own TTLs expire.
            InvalidationStrategy::TtlBased => {}
            InvalidationStrategy::VersionBased => {
                if !self.config.versioning_enabled {
                    // Still bump so readers observe a change.
                    self.bump_version(key);
                }
                self.ops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// One pass of the periodic coherency check: drain lazily queued
    /// deletes, then reconcile tombstoned keys still visible in L1.
    /// Detection is best-effort and bounded by `check_batch`.
    pub async fn run_check(self: &Arc<Self>) {
        let batch: Vec<String> = {
            let mut queue = self.lazy_deletes.lock();
            let take = queue.len().min(self.config.check_batch.max(1));
            queue.drain(..take).collect()
        };
        for key in &batch {
            for tier in self.enabled_tiers() {
                self.remove_value(tier, key).await;
            }
            self.ops.fetch_add(1, Ordering::Relaxed);
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), "lazy invalidations applied");
        }

        if self.config.versioning_enabled {
            self.reconcile_tombstones().await;
        }
    }

    /// Remove L1 entries that predate a recorded delete.
    async fn reconcile_tombstones(self: &Arc<Self>) {
        let Some(l1) = &self.l1 else {
            self.prune_tombstones();
            return;
        };

        let candidates: Vec<(String, Tombstone)> = self
            .tombstones
            .iter()
            .take(self.config.check_batch.max(1))
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for (key, tombstone) in candidates {
            if let Some(stored_at) = l1.stored_at(&key) {
                if stored_at < tombstone.deleted_at {
                    l1.delete(&key);
                    self.ops.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, version = tombstone.version, "stale L1 entry reconciled");
                }
            }
        }
        self.prune_tombstones();
    }

    fn prune_tombstones(&self) {
        let retention = self.config.check_interval.saturating_mul(4);
        self.tombstones
            .retain(|_, t| t.deleted_at.elapsed() < retention);
    }

    fn bump_version(&self, key: &str) -> u64 {
        let mut version = self.versions.entry(key.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    /// The current version tag for a key, if versioning has seen it.
    #[must_use]
    pub fn version(&self, key: &str) -> Option<u64> {
        self.versions.get(key).map(|v| *v.value())
    }

    /// Total propagations performed.
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Propagations dropped under back-pressure.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending_lazy_deletes(&self) -> usize {
        self.lazy_deletes.lock().len()
    }

    async fn push_value(&self, tier: Tier, key: &str, value: &Value, ttl: Option<Duration>) {
        match tier {
            Tier::L1 => {
                if let Some(l1) = &self.l1 {
                    l1.set(key, value.clone(), ttl);
                }
            }
            Tier::L2 => {
                if let Some(l2) = &self.l2 {
                    if !l2.set(key, value, ttl).await {
                        warn!(key = %key, "coherency push to L2 failed");
                    }
                }
            }
            Tier::L3 => {
                if let Some(l3) = &self.l3 {
                    // Only addressable content reaches the edge.
                    if let Value::String(content) = value {
                        let logical = self.keys.unprefixed(key).to_string();
                        l3.cache_content(
                            &logical,
                            Bytes::from(content.clone().into_bytes()),
                            ContentType::ApiResponse,
                            ttl,
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn remove_value(&self, tier: Tier, key: &str) {
        match tier {
            Tier::L1 => {
                if let Some(l1) = &self.l1 {
                    l1.delete(key);
                }
            }
            Tier::L2 => {
                if let Some(l2) = &self.l2 {
                    l2.delete(key).await;
                }
            }
            Tier::L3 => {
                if let Some(l3) = &self.l3 {
                    let logical = self.keys.unprefixed(key).to_string();
                    l3.invalidate(&[logical]).await;
                }
            }
        }
    }
}
