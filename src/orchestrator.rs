//! The orchestrator façade.
//!
//! Every public cache operation enters here. `get` probes L1, L2, L3 in
//! order with per-call opt-outs and promotes L2 hits into L1; `set` and
//! `delete` fan out to the enabled tiers and notify the coherency manager;
//! batch operations chunk through the same paths. Keys are prefixed on the
//! way out and stripped on the way back, so callers never see namespaced
//! keys.
//!
//! No public method returns an error: tier failures become misses or
//! `false` results with counters incremented. Callers who need to tell
//! "key absent" from "backend down" consult `get_statistics` or
//! `get_health_status`.
//!
//! Lifecycle runs uninitialized -> initializing -> ready -> shutting_down
//! -> stopped. Only `ready` accepts operations. Background workers (L1
//! maintenance, coherency checks, metrics flush, opportunistic warming) are
//! owned here: started by `initialize`, stopped by `shutdown`, and
//! restarted with backoff if a tick panics.

use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::coherency::CoherencyManager;
use crate::keys::{KeyCodec, KeyPattern};
use crate::l1_cache::{L1Cache, L1Health};
use crate::l2_cache::L2Cache;
use crate::l3_cache::{ContentType, L3Cache};
use crate::stats::{labels, CacheStatistics, ExternalCounters, StatsRecorder, Tier};
use crate::traits::MetricsSink;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_SHUTTING_DOWN: u8 = 3;
const STATE_STOPPED: u8 = 4;

/// Cadence of the opportunistic warming loop.
const WARMING_PERIOD: Duration = Duration::from_secs(300);

/// Cap on buffered per-operation latencies awaiting a metrics flush.
const PENDING_LATENCY_MAX: usize = 4096;

/// Tier opt-outs for `get`/`mget`. All reads use L1 and L2 by default; the
/// edge tier is opt-in.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    pub use_l1: bool,
    pub use_l2: bool,
    pub use_l3: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            use_l1: true,
            use_l2: true,
            use_l3: false,
        }
    }
}

/// Tier opt-ins for `set`/`mset`.
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    pub write_l1: bool,
    pub write_l2: bool,
    pub write_l3: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            write_l1: true,
            write_l2: true,
            write_l3: false,
        }
    }
}

/// Tier opt-ins for `delete`.
#[derive(Debug, Clone, Copy)]
pub struct DeleteOptions {
    pub from_l1: bool,
    pub from_l2: bool,
    pub from_l3: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            from_l1: true,
            from_l2: true,
            from_l3: false,
        }
    }
}

/// Outcome of a public cache operation. Never an error.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub success: bool,
    pub value: Option<Value>,
    pub tier_hit: Option<Tier>,
    pub hit: bool,
    pub elapsed: Duration,
    pub metadata: HashMap<String, Value>,
}

impl OperationResult {
    fn unavailable(default: Option<Value>) -> Self {
        Self {
            success: false,
            value: default,
            tier_hit: None,
            hit: false,
            elapsed: Duration::ZERO,
            metadata: HashMap::new(),
        }
    }
}

/// Aggregate health view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Stopped,
}

/// Per-component availability: enabled and the last operation succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub l1: bool,
    pub l2: bool,
    pub l3: bool,
    pub coherency: bool,
    pub warming: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthState,
    pub initialized: bool,
    pub components: ComponentHealth,
    pub background_tasks: usize,
    pub l1_detail: Option<L1Health>,
}

struct Inner {
    config: CacheConfig,
    keys: KeyCodec,
    l1: Option<Arc<L1Cache>>,
    l2: Option<L2Cache>,
    l3: Option<Arc<L3Cache>>,
    coherency: Option<Arc<CoherencyManager>>,
    stats: Arc<StatsRecorder>,
    metrics: Option<Arc<dyn MetricsSink>>,
    metrics_prev: Mutex<Option<CacheStatistics>>,
    pending_latencies: Mutex<Vec<(labels::LabelSet, Duration)>>,
    state: AtomicU8,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Multi-layer cache orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheOrchestrator {
    inner: Arc<Inner>,
}

impl CacheOrchestrator {
    pub(crate) fn from_parts(
        config: CacheConfig,
        l1: Option<Arc<L1Cache>>,
        l2: Option<L2Cache>,
        l3: Option<Arc<L3Cache>>,
        coherency: Option<Arc<CoherencyManager>>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let keys = KeyCodec::new(config.key_prefix.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                keys,
                l1,
                l2,
                l3,
                coherency,
                stats: Arc::new(StatsRecorder::new()),
                metrics,
                metrics_prev: Mutex::new(None),
                pending_latencies: Mutex::new(Vec::new()),
                state: AtomicU8::new(STATE_UNINITIALIZED),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // ===== lifecycle =====

    /// Bring the orchestrator to `ready`: verify the remote backend, start
    /// the write-behind flusher and the background workers. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error only when called after `shutdown`.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        match self.inner.state.compare_exchange(
            STATE_UNINITIALIZED,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_READY | STATE_INITIALIZING) => return Ok(()),
            Err(_) => anyhow::bail!("orchestrator has been shut down"),
        }

        info!("initializing multi-layer cache orchestrator");

        if let Some(l2) = &self.inner.l2 {
            if !l2.ping().await {
                warn!("remote backend unreachable at startup; L2 degrades to misses until it recovers");
            }
            l2.start_write_behind();
        }

        let mut tasks = Vec::new();

        if self.inner.l1.is_some() {
            tasks.push(spawn_supervised(
                &self.inner,
                "l1-maintenance",
                self.inner.config.l1.cleanup_interval,
                |inner| async move {
                    if let Some(l1) = &inner.l1 {
                        l1.cleanup_expired();
                        l1.demote_idle();
                    }
                    if let Some(l3) = &inner.l3 {
                        l3.cleanup_expired_bindings();
                    }
                },
            ));
        }

        if self.inner.coherency.is_some() {
            tasks.push(spawn_supervised(
                &self.inner,
                "coherency-check",
                self.inner.config.coherency.check_interval,
                |inner| async move {
                    if let Some(coherency) = &inner.coherency {
                        coherency.run_check().await;
                    }
                },
            ));
        }

        if self.inner.config.metrics_enabled && self.inner.metrics.is_some() {
            tasks.push(spawn_supervised(
                &self.inner,
                "metrics-flush",
                self.inner.config.metrics_interval,
                |inner| async move {
                    flush_metrics(&inner);
                },
            ));
        }

        if self.inner.config.warming_enabled
            && self.inner.config.prefetch_popular
            && self.inner.l1.is_some()
            && self.inner.l2.is_some()
        {
            tasks.push(spawn_supervised(
                &self.inner,
                "warming",
                WARMING_PERIOD,
                |inner| async move {
                    warming_tick(&inner).await;
                },
            ));
        }

        let count = tasks.len();
        self.inner.tasks.lock().extend(tasks);
        // A concurrent shutdown wins the transition; do not resurrect.
        let _ = self.inner.state.compare_exchange(
            STATE_INITIALIZING,
            STATE_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(background_tasks = count, "cache orchestrator ready");
        Ok(())
    }

    /// Stop accepting operations, drain the write-behind queue, stop the
    /// background workers. Safe to call multiple times.
    pub async fn shutdown(&self) {
        loop {
            let current = self.inner.state.load(Ordering::Acquire);
            if current == STATE_SHUTTING_DOWN || current == STATE_STOPPED {
                return;
            }
            if self
                .inner
                .state
                .compare_exchange(
                    current,
                    STATE_SHUTTING_DOWN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        info!("shutting down cache orchestrator");
        let _ = self.inner.shutdown_tx.send(());

        if let Some(l2) = &self.inner.l2 {
            l2.stop_write_behind().await;
        }
        if let Some(l3) = &self.inner.l3 {
            l3.close().await;
        }

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("background task did not stop within its deadline");
            }
        }

        self.inner.state.store(STATE_STOPPED, Ordering::Release);
        info!("cache orchestrator stopped");
    }

    fn accepts_operations(&self) -> bool {
        self.inner.config.multi_layer_enabled
            && self.inner.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Whether the orchestrator has reached `ready` and not been shut down.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_READY
    }

    // ===== core operations =====

    /// Fetch a value, first tier to answer wins (L1, then L2, then L3).
    /// A hit from L2 is promoted into L1 when L1 is enabled for this call.
    pub async fn get(&self, key: &str, default: Option<Value>, options: GetOptions) -> OperationResult {
        if !self.accepts_operations() {
            return OperationResult::unavailable(default);
        }

        let start = Instant::now();
        self.inner.stats.record_request();
        let prefixed = self.inner.keys.prefixed(key);
        let mut probed: Vec<Tier> = Vec::with_capacity(3);

        if options.use_l1 {
            if let Some(l1) = &self.inner.l1 {
                if let Some(value) = l1.get(&prefixed) {
                    return self.finish_hit(start, Tier::L1, labels::HIT_L1, value, &probed);
                }
                probed.push(Tier::L1);
            }
        }

        if options.use_l2 {
            if let Some(l2) = &self.inner.l2 {
                let promote = options.use_l1 && self.inner.l1.is_some();
                if let Some(value) = l2.get(&prefixed, promote).await {
                    return self.finish_hit(start, Tier::L2, labels::HIT_L2, value, &probed);
                }
                probed.push(Tier::L2);
            }
        }

        if options.use_l3 {
            if let Some(l3) = &self.inner.l3 {
                let url = l3.get_cached_url(key, ContentType::ApiResponse).await;
                if url != key {
                    return self.finish_hit(
                        start,
                        Tier::L3,
                        labels::HIT_L3,
                        Value::String(url),
                        &probed,
                    );
                }
                probed.push(Tier::L3);
            }
        }

        self.inner.stats.record_miss(&probed);
        self.finish(start, labels::MISS_OVERALL);
        OperationResult {
            success: false,
            value: default,
            tier_hit: None,
            hit: false,
            elapsed: start.elapsed(),
            metadata: HashMap::new(),
        }
    }

    /// Store a value in every enabled tier. Succeeds when at least one tier
    /// accepted the write; metadata records the successful/total fraction.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        options: SetOptions,
    ) -> OperationResult {
        if !self.accepts_operations() {
            return OperationResult::unavailable(None);
        }

        let start = Instant::now();
        let prefixed = self.inner.keys.prefixed(key);
        let mut written: Vec<Tier> = Vec::with_capacity(3);
        let mut attempted = 0u64;

        if options.write_l1 {
            if let Some(l1) = &self.inner.l1 {
                attempted += 1;
                l1.set(&prefixed, value.clone(), ttl);
                written.push(Tier::L1);
            }
        }

        if options.write_l2 {
            if let Some(l2) = &self.inner.l2 {
                attempted += 1;
                if l2.set(&prefixed, &value, ttl).await {
                    written.push(Tier::L2);
                } else {
                    warn!(key = %key, "L2 write failed, continuing with remaining tiers");
                }
            }
        }

        if options.write_l3 {
            if let Some(l3) = &self.inner.l3 {
                attempted += 1;
                if let Value::String(content) = &value {
                    let url = l3
                        .cache_content(
                            key,
                            Bytes::from(content.clone().into_bytes()),
                            ContentType::ApiResponse,
                            ttl,
                        )
                        .await;
                    if url != key {
                        written.push(Tier::L3);
                    }
                } else {
                    debug!(key = %key, "skipping L3 for non-addressable value");
                }
            }
        }

        if !written.is_empty() {
            if let Some(coherency) = &self.inner.coherency {
                coherency.on_write(&prefixed, &value, ttl, &written).await;
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("successful_layers".to_string(), Value::from(written.len()));
        metadata.insert("total_layers".to_string(), Value::from(attempted));

        self.finish(start, labels::SET_OVERALL);
        OperationResult {
            success: !written.is_empty(),
            value: Some(value),
            tier_hit: None,
            hit: false,
            elapsed: start.elapsed(),
            metadata,
        }
    }

    /// Delete a key from every enabled tier. Succeeds when at least one tier
    /// removed it.
    pub async fn delete(&self, key: &str, options: DeleteOptions) -> OperationResult {
        if !self.accepts_operations() {
            return OperationResult::unavailable(None);
        }

        let start = Instant::now();
        let prefixed = self.inner.keys.prefixed(key);
        let mut removed_from: Vec<Tier> = Vec::with_capacity(3);

        if options.from_l1 {
            if let Some(l1) = &self.inner.l1 {
                if l1.delete(&prefixed) {
                    removed_from.push(Tier::L1);
                }
            }
        }
        if options.from_l2 {
            if let Some(l2) = &self.inner.l2 {
                if l2.delete(&prefixed).await {
                    removed_from.push(Tier::L2);
                }
            }
        }
        if options.from_l3 {
            if let Some(l3) = &self.inner.l3 {
                if l3.invalidate(&[key.to_string()]).await {
                    removed_from.push(Tier::L3);
                }
            }
        }

        if !removed_from.is_empty() {
            if let Some(coherency) = &self.inner.coherency {
                coherency.on_delete(&prefixed, &removed_from).await;
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(
            "deleted_from_layers".to_string(),
            Value::from(removed_from.len()),
        );

        self.finish(start, labels::DELETE_OVERALL);
        OperationResult {
            success: !removed_from.is_empty(),
            value: None,
            tier_hit: None,
            hit: false,
            elapsed: start.elapsed(),
            metadata,
        }
    }

    // ===== batch operations =====

    /// Fetch many keys, chunked by the L2 batch size.
    pub async fn mget(
        &self,
        keys: &[String],
        options: GetOptions,
    ) -> HashMap<String, OperationResult> {
        let mut results = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.batch_size()) {
            let lookups = chunk.iter().map(|key| self.get(key, None, options));
            for (key, result) in chunk.iter().zip(join_all(lookups).await) {
                results.insert(key.clone(), result);
            }
        }
        results
    }

    /// Store many values; each key follows `set` semantics.
    pub async fn mset(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
        options: SetOptions,
    ) -> HashMap<String, OperationResult> {
        let entries: Vec<(String, Value)> = items.into_iter().collect();
        let mut results = HashMap::with_capacity(entries.len());
        for chunk in entries.chunks(self.batch_size()) {
            let writes = chunk
                .iter()
                .map(|(key, value)| self.set(key, value.clone(), ttl, options));
            for ((key, _), result) in chunk.iter().zip(join_all(writes).await) {
                results.insert(key.clone(), result);
            }
        }
        results
    }

    // ===== management operations =====

    /// Remove every key matching `pattern` (`*` wildcard) from L1 and from
    /// the remote backend. Returns the number of removals.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        if !self.accepts_operations() {
            return 0;
        }

        let prefixed_pattern = self.inner.keys.prefixed(pattern);
        let mut removed = 0;

        if let Some(l1) = &self.inner.l1 {
            let compiled = KeyPattern::compile(&prefixed_pattern);
            removed += l1.invalidate_pattern(&compiled);
        }

        if let Some(l2) = &self.inner.l2 {
            let matches = l2.scan_keys(&prefixed_pattern).await;
            for key in &matches {
                if l2.delete(key).await {
                    removed += 1;
                }
            }
        }

        debug!(pattern = %pattern, removed, "pattern invalidation complete");
        removed
    }

    /// Push items through the warming path: a batched L2 mset plus L1
    /// inserts. Returns the number of entries warmed.
    pub async fn warm_cache(&self, items: HashMap<String, Value>) -> usize {
        if !self.accepts_operations() || !self.inner.config.warming_enabled {
            return 0;
        }

        let entries: Vec<(String, Value)> = items
            .into_iter()
            .map(|(key, value)| (self.inner.keys.prefixed(&key), value))
            .collect();

        let mut warmed = 0usize;
        for chunk in entries.chunks(self.inner.config.warming_batch_size.max(1)) {
            let batch: HashMap<String, Value> = chunk.iter().cloned().collect();
            let l2_results = match &self.inner.l2 {
                Some(l2) => l2.mset(&batch, None).await,
                None => HashMap::new(),
            };

            for (key, value) in chunk {
                let mut stored = l2_results.get(key).copied().unwrap_or(false);
                if let Some(l1) = &self.inner.l1 {
                    l1.set(key, value.clone(), None);
                    stored = true;
                }
                if stored {
                    warmed += 1;
                }
            }
        }

        self.inner.stats.record_warming(warmed as u64);
        info!(warmed, "cache warmed");
        warmed
    }

    /// Sweep expired entries. L2 expiry is native to the backend and L3
    /// binding cleanup is internal bookkeeping, so both report zero.
    pub async fn cleanup_expired(&self) -> HashMap<Tier, usize> {
        let mut counts = HashMap::new();
        let l1_removed = self
            .inner
            .l1
            .as_ref()
            .map_or(0, |l1| l1.cleanup_expired());
        if let Some(l3) = &self.inner.l3 {
            l3.cleanup_expired_bindings();
        }
        counts.insert(Tier::L1, l1_removed);
        counts.insert(Tier::L2, 0);
        counts.insert(Tier::L3, 0);
        counts
    }

    // ===== observation =====

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn get_statistics(&self) -> CacheStatistics {
        self.inner.stats.snapshot(self.external_counters())
    }

    /// Component-by-component availability.
    #[must_use]
    pub fn get_health_status(&self) -> HealthStatus {
        let state = self.inner.state.load(Ordering::Acquire);
        let l1_detail = self.inner.l1.as_ref().map(|l1| l1.health());
        let components = ComponentHealth {
            l1: l1_detail.as_ref().is_some_and(|h| h.healthy),
            l2: self.inner.l2.as_ref().is_some_and(L2Cache::is_healthy),
            l3: self.inner.l3.as_ref().is_some_and(|l3| l3.is_healthy()),
            coherency: self.inner.coherency.is_some(),
            warming: self.inner.config.warming_enabled,
        };

        let tier_degraded = (self.inner.l1.is_some() && !components.l1)
            || (self.inner.l2.is_some() && !components.l2)
            || (self.inner.l3.is_some() && !components.l3);

        let overall = match state {
            STATE_READY if !tier_degraded => HealthState::Healthy,
            STATE_STOPPED | STATE_SHUTTING_DOWN => HealthState::Stopped,
            _ => HealthState::Degraded,
        };

        HealthStatus {
            overall,
            initialized: state == STATE_READY,
            components,
            background_tasks: self.inner.tasks.lock().len(),
            l1_detail,
        }
    }

    // ===== internals =====

    fn batch_size(&self) -> usize {
        if self.inner.l2.is_some() {
            self.inner.config.l2.batch_size.max(1)
        } else {
            50
        }
    }

    fn external_counters(&self) -> ExternalCounters {
        let l2 = self.inner.l2.as_ref();
        ExternalCounters {
            l1_size_bytes: self
                .inner
                .l1
                .as_ref()
                .map_or(0, |l1| l1.total_size_bytes()),
            coherency_ops: self
                .inner
                .coherency
                .as_ref()
                .map_or(0, |c| c.operations()),
            dropped_writes: l2.map_or(0, L2Cache::dropped_writes)
                + self.inner.coherency.as_ref().map_or(0, |c| c.dropped()),
            transport_errors: l2.map_or(0, L2Cache::transport_errors)
                + self.inner.l3.as_ref().map_or(0, |l3| l3.error_count()),
            serialization_errors: l2.map_or(0, L2Cache::serialization_errors),
        }
    }

    fn finish_hit(
        &self,
        start: Instant,
        tier: Tier,
        label: labels::LabelSet,
        value: Value,
        probed: &[Tier],
    ) -> OperationResult {
        for missed in probed {
            self.inner.stats.record_tier_miss(*missed);
        }
        self.inner.stats.record_hit(tier);
        self.finish(start, label);
        OperationResult {
            success: true,
            value: Some(value),
            tier_hit: Some(tier),
            hit: true,
            elapsed: start.elapsed(),
            metadata: HashMap::new(),
        }
    }

    /// Record latency into the ring and the metrics buffer.
    fn finish(&self, start: Instant, label: labels::LabelSet) {
        let elapsed = start.elapsed();
        self.inner.stats.record_latency(elapsed);
        if self.inner.metrics.is_some() {
            let mut pending = self.inner.pending_latencies.lock();
            if pending.len() < PENDING_LATENCY_MAX {
                pending.push((label, elapsed));
            }
        }
    }
}

impl std::fmt::Debug for CacheOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .field("l1", &self.inner.l1.is_some())
            .field("l2", &self.inner.l2.is_some())
            .field("l3", &self.inner.l3.is_some())
            .finish_non_exhaustive()
    }
}

/// Spawn a periodic background task tied to the shutdown channel. A panic
/// in one tick is caught, logged, and followed by an exponentially backed
/// off restart; the task itself keeps running.
fn spawn_supervised<F, Fut>(
    inner: &Arc<Inner>,
    name: &'static str,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let inner = Arc::clone(inner);
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // swallow the immediate first tick
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let outcome = AssertUnwindSafe(tick(Arc::clone(&inner)))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(()) => backoff = Duration::from_secs(1),
                        Err(_) => {
                            error!(task = name, "background task panicked, restarting");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(Duration::from_secs(60));
                        }
                    }
                }
            }
        }
        debug!(task = name, "background task stopped");
    })
}

/// Refresh remote TTLs for the hottest L1 keys so popular entries survive
/// in L2 past their original expiry.
async fn warming_tick(inner: &Arc<Inner>) {
    let (Some(l1), Some(l2)) = (&inner.l1, &inner.l2) else {
        return;
    };

    let keys = l1.hottest_keys(inner.config.warming_batch_size.max(1));
    let mut refreshed = 0u64;
    for key in keys {
        if let Some(value) = l1.peek(&key) {
            if l2.set_hot(&key, &value, None).await {
                refreshed += 1;
            }
        }
    }
    if refreshed > 0 {
        inner.stats.record_warming(refreshed);
        debug!(refreshed, "hot keys refreshed in L2");
    }
}

/// Push counter deltas since the previous flush and drain buffered
/// per-operation latencies into the sink.
fn flush_metrics(inner: &Arc<Inner>) {
    let Some(sink) = &inner.metrics else { return };

    let l2 = inner.l2.as_ref();
    let snapshot = inner.stats.snapshot(ExternalCounters {
        l1_size_bytes: inner.l1.as_ref().map_or(0, |l1| l1.total_size_bytes()),
        coherency_ops: inner.coherency.as_ref().map_or(0, |c| c.operations()),
        dropped_writes: l2.map_or(0, L2Cache::dropped_writes),
        transport_errors: l2.map_or(0, L2Cache::transport_errors),
        serialization_errors: l2.map_or(0, L2Cache::serialization_errors),
    });

    let mut prev_slot = inner.metrics_prev.lock();
    let prev = prev_slot.take();
    let delta = |current: u64, previous: u64| current.saturating_sub(previous);
    let base = |f: fn(&CacheStatistics) -> u64| prev.as_ref().map_or(0, f);

    let counters: [(labels::LabelSet, u64); 6] = [
        (labels::HIT_L1, delta(snapshot.l1_hits, base(|s| s.l1_hits))),
        (labels::HIT_L2, delta(snapshot.l2_hits, base(|s| s.l2_hits))),
        (labels::HIT_L3, delta(snapshot.l3_hits, base(|s| s.l3_hits))),
        (
            labels::MISS_OVERALL,
            delta(snapshot.total_misses, base(|s| s.total_misses)),
        ),
        (
            labels::GET_OVERALL,
            delta(snapshot.total_requests, base(|s| s.total_requests)),
        ),
        (
            labels::ERROR_OVERALL,
            delta(
                snapshot.transport_errors + snapshot.serialization_errors,
                base(|s| s.transport_errors + s.serialization_errors),
            ),
        ),
    ];
    for (label, value) in counters {
        if value > 0 {
            sink.increment(labels::OPERATIONS_TOTAL, label, value);
        }
    }
    *prev_slot = Some(snapshot);
    drop(prev_slot);

    let pending: Vec<(labels::LabelSet, Duration)> =
        inner.pending_latencies.lock().drain(..).collect();
    for (label, elapsed) in pending {
        sink.observe(
            labels::OPERATION_DURATION_SECONDS,
            label,
            elapsed.as_secs_f64(),
        );
    }
}
