//! L2 tier: distributed cache over the remote client contract.
//!
//! Values round-trip through the [`ValueCodec`] wire envelope. Writes run in
//! one of two modes: write-through (synchronous, the default) or
//! write-behind, where a set enqueues the item and returns immediately while
//! a background flusher batches items into `mset` calls. Later enqueues for
//! the same key coalesce onto the queued item, so one flush carries the
//! last write only. A full queue degrades that set to write-through.
//!
//! Reads consult the pending write-behind queue before the remote backend so
//! a caller always observes its own queued writes.
//!
//! Every transport failure is absorbed: reads become misses, writes report
//! `false`, and an error counter moves. Nothing here panics the process.

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::ValueCodec;
use crate::config::L2Config;
use crate::keys::KeyPattern;
use crate::l1_cache::L1Cache;
use crate::traits::RemoteClient;

/// A pending write awaiting its flush. At most one exists per key.
#[derive(Debug, Clone)]
struct WriteBehindItem {
    value: Value,
    ttl: Duration,
    #[allow(dead_code)]
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct WriteBehindQueue {
    items: HashMap<String, WriteBehindItem>,
    order: VecDeque<String>,
}

struct L2Inner {
    remote: Arc<dyn RemoteClient>,
    codec: ValueCodec,
    config: L2Config,
    l1: Option<Arc<L1Cache>>,
    queue: Mutex<WriteBehindQueue>,
    queue_notify: Notify,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    healthy: AtomicBool,
    transport_errors: AtomicU64,
    serialization_errors: AtomicU64,
    flushed_writes: AtomicU64,
    dropped_writes: AtomicU64,
    sync_fallbacks: AtomicU64,
}

/// Distributed cache tier. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct L2Cache {
    inner: Arc<L2Inner>,
}

impl L2Cache {
    /// Build the tier over a remote client. When an L1 handle is provided,
    /// remote hits can be promoted into it.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        config: L2Config,
        l1: Option<Arc<L1Cache>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let codec = ValueCodec::new(
            config.compression_enabled,
            config.compression_threshold_bytes,
        );
        debug!(backend = remote.name(), "initializing L2 cache");
        Self {
            inner: Arc::new(L2Inner {
                remote,
                codec,
                config,
                l1,
                queue: Mutex::new(WriteBehindQueue::default()),
                queue_notify: Notify::new(),
                shutdown_tx,
                worker: Mutex::new(None),
                healthy: AtomicBool::new(true),
                transport_errors: AtomicU64::new(0),
                serialization_errors: AtomicU64::new(0),
                flushed_writes: AtomicU64::new(0),
                dropped_writes: AtomicU64::new(0),
                sync_fallbacks: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch a value. Transport and decode failures surface as misses.
    ///
    /// When `promote` is set and an L1 handle is present, the decoded value
    /// is inserted into L1 under its default TTL.
    pub async fn get(&self, key: &str, promote: bool) -> Option<Value> {
        // A caller must observe its own queued write-behind items.
        let queued = { self.inner.queue.lock().items.get(key).map(|i| i.value.clone()) };
        if let Some(value) = queued {
            return Some(value);
        }

        match self.inner.remote.get(key).await {
            Ok(Some(bytes)) => {
                self.inner.healthy.store(true, Ordering::Relaxed);
                match self.inner.codec.decode(&bytes) {
                    Ok(value) => {
                        if promote {
                            if let Some(l1) = &self.inner.l1 {
                                l1.set(key, value.clone(), None);
                            }
                        }
                        Some(value)
                    }
                    Err(e) => {
                        self.inner
                            .serialization_errors
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(key = %key, error = %e, "failed to decode L2 record");
                        None
                    }
                }
            }
            Ok(None) => {
                self.inner.healthy.store(true, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.record_transport_error();
                debug!(key = %key, error = %e, "L2 get failed");
                None
            }
        }
    }

    /// Store a value. Returns whether the write was accepted.
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        self.set_with(key, value, ttl, false).await
    }

    /// Store a value flagged hot at the call site; its TTL is extended by
    /// the configured multiplier (still capped by `max_ttl`).
    pub async fn set_hot(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        self.set_with(key, value, ttl, true).await
    }

    async fn set_with(&self, key: &str, value: &Value, ttl: Option<Duration>, hot: bool) -> bool {
        let ttl = self.effective_ttl(ttl, hot);
        if self.inner.config.write_behind_enabled {
            if self.enqueue(key, value, ttl) {
                return true;
            }
            self.inner.sync_fallbacks.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "write-behind queue full, degrading to write-through");
        }
        self.write_through(key, value, ttl).await
    }

    /// Delete a key from the remote backend and from the pending queue.
    pub async fn delete(&self, key: &str) -> bool {
        let dequeued = {
            let mut q = self.inner.queue.lock();
            q.items.remove(key).is_some()
        };

        match self.inner.remote.delete(key).await {
            Ok(existed) => {
                self.inner.healthy.store(true, Ordering::Relaxed);
                existed || dequeued
            }
            Err(e) => {
                self.record_transport_error();
                debug!(key = %key, error = %e, "L2 delete failed");
                dequeued
            }
        }
    }

    /// Fetch many keys; the result holds found keys only. Requests are
    /// chunked into batches of the configured size.
    pub async fn mget(&self, keys: &[String]) -> HashMap<String, Value> {
        let mut results = HashMap::new();
        let mut remaining = Vec::with_capacity(keys.len());
        {
            let q = self.inner.queue.lock();
            for key in keys {
                if let Some(item) = q.items.get(key) {
                    results.insert(key.clone(), item.value.clone());
                } else {
                    remaining.push(key.clone());
                }
            }
        }

        for chunk in remaining.chunks(self.inner.config.batch_size.max(1)) {
            match self.inner.remote.mget(chunk).await {
                Ok(values) => {
                    self.inner.healthy.store(true, Ordering::Relaxed);
                    for (key, bytes) in chunk.iter().zip(values) {
                        let Some(bytes) = bytes else { continue };
                        match self.inner.codec.decode(&bytes) {
                            Ok(value) => {
                                results.insert(key.clone(), value);
                            }
                            Err(e) => {
                                self.inner
                                    .serialization_errors
                                    .fetch_add(1, Ordering::Relaxed);
                                warn!(key = %key, error = %e, "failed to decode L2 record");
                            }
                        }
                    }
                }
                Err(e) => {
                    self.record_transport_error();
                    debug!(error = %e, chunk = chunk.len(), "L2 mget chunk failed");
                }
            }
        }
        results
    }

    /// Store many values, reporting per-key success. Partial failure of one
    /// chunk does not affect the others.
    pub async fn mset(
        &self,
        items: &HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> HashMap<String, bool> {
        let ttl = self.effective_ttl(ttl, false);
        let mut results = HashMap::with_capacity(items.len());

        if self.inner.config.write_behind_enabled {
            for (key, value) in items {
                let accepted = if self.enqueue(key, value, ttl) {
                    true
                } else {
                    self.inner.sync_fallbacks.fetch_add(1, Ordering::Relaxed);
                    self.write_through(key, value, ttl).await
                };
                results.insert(key.clone(), accepted);
            }
            return results;
        }

        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in items {
            match self.inner.codec.encode(value, ttl) {
                Ok(enc) => encoded.push((key.clone(), enc.bytes)),
                Err(e) => {
                    self.inner
                        .serialization_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "failed to encode value for L2");
                    results.insert(key.clone(), false);
                }
            }
        }

        for chunk in encoded.chunks(self.inner.config.batch_size.max(1)) {
            match self.inner.remote.mset(chunk, ttl).await {
                Ok(()) => {
                    self.inner.healthy.store(true, Ordering::Relaxed);
                    for (key, _) in chunk {
                        results.insert(key.clone(), true);
                    }
                }
                Err(e) => {
                    self.record_transport_error();
                    debug!(error = %e, chunk = chunk.len(), "L2 mset chunk failed");
                    for (key, _) in chunk {
                        results.insert(key.clone(), false);
                    }
                }
            }
        }
        results
    }

    /// Enumerate stored keys matching a glob pattern, including keys still
    /// sitting in the write-behind queue.
    pub async fn scan_keys(&self, pattern: &str) -> Vec<String> {
        let mut keys = match self.inner.remote.scan(pattern).await {
            Ok(keys) => {
                self.inner.healthy.store(true, Ordering::Relaxed);
                keys
            }
            Err(e) => {
                self.record_transport_error();
                debug!(pattern = %pattern, error = %e, "L2 scan failed");
                Vec::new()
            }
        };

        let compiled = KeyPattern::compile(pattern);
        let q = self.inner.queue.lock();
        for key in q.items.keys() {
            if compiled.matches(key) && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Start the background flusher. Idempotent; a no-op unless write-behind
    /// is enabled.
    pub fn start_write_behind(&self) {
        if !self.inner.config.write_behind_enabled {
            return;
        }
        let mut slot = self.inner.worker.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.write_behind_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // swallow the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = inner.queue_notify.notified() => {}
                    _ = shutdown_rx.recv() => break,
                }
                L2Inner::flush_pending(&inner).await;
            }
            debug!("write-behind flusher stopped");
        }));
        debug!("write-behind flusher started");
    }

    /// Stop the flusher and drain the queue within the configured deadline.
    /// Items still queued when the deadline expires are dropped and counted.
    pub async fn stop_write_behind(&self) {
        let _ = self.inner.shutdown_tx.send(());
        let handle = { self.inner.worker.lock().take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = self.inner.config.write_behind_drain_deadline;
        let inner = Arc::clone(&self.inner);
        let drained = tokio::time::timeout(deadline, async move {
            L2Inner::flush_pending(&inner).await;
        })
        .await;

        if drained.is_err() {
            let remaining = {
                let mut q = self.inner.queue.lock();
                let n = q.items.len();
                q.items.clear();
                q.order.clear();
                n
            };
            if remaining > 0 {
                self.inner
                    .dropped_writes
                    .fetch_add(remaining as u64, Ordering::Relaxed);
                error!(
                    dropped = remaining,
                    "write-behind drain deadline expired, dropping queued items"
                );
            }
        }
    }

    /// Connectivity probe against the remote backend.
    pub async fn ping(&self) -> bool {
        match self.inner.remote.ping().await {
            Ok(()) => {
                self.inner.healthy.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.record_transport_error();
                debug!(error = %e, "L2 ping failed");
                false
            }
        }
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn transport_errors(&self) -> u64 {
        self.inner.transport_errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn serialization_errors(&self) -> u64 {
        self.inner.serialization_errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_writes(&self) -> u64 {
        self.inner.dropped_writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn flushed_writes(&self) -> u64 {
        self.inner.flushed_writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sync_fallbacks(&self) -> u64 {
        self.inner.sync_fallbacks.load(Ordering::Relaxed)
    }

    // ===== internals =====

    fn record_transport_error(&self) {
        self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
        self.inner.healthy.store(false, Ordering::Relaxed);
    }

    fn effective_ttl(&self, ttl: Option<Duration>, hot: bool) -> Duration {
        let mut ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        if hot && self.inner.config.hot_ttl_multiplier > 1.0 {
            ttl = ttl.mul_f64(self.inner.config.hot_ttl_multiplier);
        }
        ttl.min(self.inner.config.max_ttl)
    }

    /// Enqueue a write-behind item, coalescing onto any queued write for the
    /// same key. Returns false when the queue is full.
    fn enqueue(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let wake = {
            let mut q = self.inner.queue.lock();
            if q.items.len() >= self.inner.config.write_behind_queue_max
                && !q.items.contains_key(key)
            {
                return false;
            }
            let item = WriteBehindItem {
                value: value.clone(),
                ttl,
                enqueued_at: Instant::now(),
            };
            if q.items.insert(key.to_string(), item).is_none() {
                q.order.push_back(key.to_string());
            }
            q.items.len() >= self.inner.config.batch_size
        };
        if wake {
            self.inner.queue_notify.notify_one();
        }
        true
    }

    async fn write_through(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let encoded = match self.inner.codec.encode(value, ttl) {
            Ok(enc) => enc,
            Err(e) => {
                self.inner
                    .serialization_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "failed to encode value for L2");
                return false;
            }
        };
        match self.inner.remote.set(key, &encoded.bytes, ttl).await {
            Ok(()) => {
                self.inner.healthy.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.record_transport_error();
                debug!(key = %key, error = %e, "L2 set failed");
                false
            }
        }
    }
}

impl L2Inner {
    /// Take up to one batch off the queue, oldest first. Keys whose items
    /// were deleted while queued are skipped.
    fn drain_batch(inner: &L2Inner) -> Vec<(String, WriteBehindItem)> {
        let mut q = inner.queue.lock();
        let mut batch = Vec::new();
        while batch.len() < inner.config.batch_size.max(1) {
            let Some(key) = q.order.pop_front() else { break };
            if let Some(item) = q.items.remove(&key) {
                batch.push((key, item));
            }
        }
        batch
    }

    /// Flush queued items batch by batch until the queue no longer holds a
    /// full batch.
    async fn flush_pending(inner: &Arc<L2Inner>) {
        loop {
            let batch = Self::drain_batch(inner);
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == inner.config.batch_size;
            Self::flush_batch(inner, batch).await;
            if !full {
                break;
            }
        }
    }

    /// Issue one batch as grouped `mset` calls with bounded retries. Items
    /// that exhaust their retry budget are dropped and counted.
    async fn flush_batch(inner: &Arc<L2Inner>, batch: Vec<(String, WriteBehindItem)>) {
        let mut groups: HashMap<u64, Vec<(String, Vec<u8>)>> = HashMap::new();
        for (key, item) in batch {
            match inner.codec.encode(&item.value, item.ttl) {
                Ok(enc) => groups
                    .entry(item.ttl.as_secs())
                    .or_default()
                    .push((key, enc.bytes)),
                Err(e) => {
                    inner.serialization_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "failed to encode write-behind item");
                }
            }
        }

        let batch_id = Uuid::new_v4();
        for (ttl_secs, items) in groups {
            let ttl = Duration::from_secs(ttl_secs);
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match inner.remote.mset(&items, ttl).await {
                    Ok(()) => {
                        inner.healthy.store(true, Ordering::Relaxed);
                        inner
                            .flushed_writes
                            .fetch_add(items.len() as u64, Ordering::Relaxed);
                        debug!(batch = %batch_id, items = items.len(), "write-behind batch flushed");
                        break;
                    }
                    Err(e) => {
                        inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                        inner.healthy.store(false, Ordering::Relaxed);
                        if attempt >= inner.config.write_behind_max_attempts.max(1) {
                            inner
                                .dropped_writes
                                .fetch_add(items.len() as u64, Ordering::Relaxed);
                            error!(
                                batch = %batch_id,
                                dropped = items.len(),
                                error = %e,
                                "write-behind retries exhausted, dropping items"
                            );
                            break;
                        }
                        let delay = backoff_delay(attempt);
                        warn!(
                            batch = %batch_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "write-behind flush failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(100).saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
    base.min(Duration::from_secs(5)) + jitter
}
