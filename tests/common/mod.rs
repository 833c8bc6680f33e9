//! Shared helpers for integration tests: an in-memory mock of the remote
//! backend with failure injection and operation recording, a mock edge
//! provider, and orchestrator builders tuned for fast tests.

use anyhow::{bail, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_cache::{
    async_trait, CacheConfig, CacheOrchestrator, EdgeProvider, Environment, KeyPattern,
    RemoteClient, ValueCodec,
};

pub const TEST_PREFIX: &str = "app:test:";

/// In-memory stand-in for the distributed backend. TTLs are recorded but not
/// enforced; tests drive expiry explicitly where they need it.
#[derive(Default)]
pub struct MockRemote {
    store: Mutex<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Keys observed by any operation, in arrival order.
    observed_keys: Mutex<Vec<String>>,
    /// Number of stored writes per key (set + mset combined).
    writes_per_key: Mutex<HashMap<String, u64>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Store an encoded value directly, bypassing failure injection.
    pub fn seed_value(&self, key: &str, value: &Value) {
        let codec = ValueCodec::new(true, 1024);
        let encoded = codec
            .encode(value, Duration::from_secs(300))
            .expect("encode seed value");
        self.store.lock().insert(key.to_string(), encoded.bytes);
    }

    /// Decode a stored value, bypassing failure injection.
    pub fn stored_value(&self, key: &str) -> Option<Value> {
        let bytes = self.store.lock().get(key).cloned()?;
        let codec = ValueCodec::new(true, 1024);
        codec.decode(&bytes).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn observed_keys(&self) -> Vec<String> {
        self.observed_keys.lock().clone()
    }

    pub fn write_count(&self, key: &str) -> u64 {
        self.writes_per_key.lock().get(key).copied().unwrap_or(0)
    }

    fn observe(&self, key: &str) {
        self.observed_keys.lock().push(key.to_string());
    }

    fn count_write(&self, key: &str) {
        *self.writes_per_key.lock().entry(key.to_string()).or_insert(0) += 1;
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.observe(key);
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected read failure");
        }
        Ok(self.store.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<()> {
        self.observe(key);
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected write failure");
        }
        self.store.lock().insert(key.to_string(), value.to_vec());
        self.count_write(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.observe(key);
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected write failure");
        }
        Ok(self.store.lock().remove(key).is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        for key in keys {
            self.observe(key);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected read failure");
        }
        let store = self.store.lock();
        Ok(keys.iter().map(|k| store.get(k).cloned()).collect())
    }

    async fn mset(&self, items: &[(String, Vec<u8>)], _ttl: Duration) -> Result<()> {
        for (key, _) in items {
            self.observe(key);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected write failure");
        }
        let mut store = self.store.lock();
        for (key, value) in items {
            store.insert(key.clone(), value.clone());
        }
        drop(store);
        for (key, _) in items {
            self.count_write(key);
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected read failure");
        }
        let compiled = KeyPattern::compile(pattern);
        Ok(self
            .store
            .lock()
            .keys()
            .filter(|k| compiled.matches(k))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected ping failure");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock-remote"
    }
}

/// In-memory edge provider: uploads land in a map, purges are recorded.
#[derive(Default)]
pub struct MockEdge {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    purged: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MockEdge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn purged_paths(&self) -> Vec<String> {
        self.purged.lock().clone()
    }
}

#[async_trait]
impl EdgeProvider for MockEdge {
    async fn put_object(
        &self,
        path: &str,
        body: Bytes,
        _content_type: &str,
        _cache_control: &str,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("injected edge failure");
        }
        self.objects.lock().insert(path.to_string(), body.to_vec());
        Ok(())
    }

    async fn purge(&self, paths: &[String]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("injected edge failure");
        }
        let mut objects = self.objects.lock();
        for path in paths {
            objects.remove(path);
        }
        drop(objects);
        self.purged.lock().extend(paths.iter().cloned());
        Ok(())
    }

    fn object_url(&self, path: &str) -> String {
        format!("https://cdn.test/{path}")
    }

    fn name(&self) -> &'static str {
        "mock-edge"
    }
}

/// Metrics sink that records every emission for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub counters: Mutex<Vec<(String, String, u64)>>,
    pub observations: Mutex<Vec<(String, f64)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter_total(&self, operation: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(_, labels, _)| labels.contains(operation))
            .map(|(_, _, v)| v)
            .sum()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.lock().len()
    }
}

impl strata_cache::MetricsSink for RecordingSink {
    fn increment(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let rendered = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        self.counters
            .lock()
            .push((name.to_string(), rendered, value));
    }

    fn observe(&self, name: &str, _labels: &[(&str, &str)], seconds: f64) {
        self.observations.lock().push((name.to_string(), seconds));
    }
}

/// A configuration tuned for fast tests: small L1, short intervals, the
/// test key prefix, no metrics.
pub fn test_config() -> CacheConfig {
    let mut config = CacheConfig::for_environment(Environment::Testing);
    config.key_prefix = TEST_PREFIX.to_string();
    config.l1.cleanup_interval = Duration::from_millis(100);
    config.l2.write_behind_interval = Duration::from_millis(100);
    config.l2.write_behind_drain_deadline = Duration::from_secs(2);
    config.coherency.check_interval = Duration::from_millis(100);
    config.metrics_enabled = false;
    config
}

/// Build and initialize an orchestrator over the given mock remote.
pub async fn build_cache(config: CacheConfig, remote: Arc<MockRemote>) -> CacheOrchestrator {
    let cache = CacheOrchestrator::builder(config)
        .environment(Environment::Testing)
        .with_remote(remote)
        .build()
        .await
        .expect("build orchestrator");
    cache.initialize().await.expect("initialize orchestrator");
    cache
}

/// Build with both mock remote and mock edge provider.
pub async fn build_cache_with_edge(
    mut config: CacheConfig,
    remote: Arc<MockRemote>,
    edge: Arc<MockEdge>,
) -> CacheOrchestrator {
    config.l3.enabled = true;
    config.l3.domain_name = "cdn.test".to_string();
    config.l3.origin_domain = "origin.test".to_string();
    let cache = CacheOrchestrator::builder(config)
        .environment(Environment::Testing)
        .with_remote(remote)
        .with_edge_provider(edge)
        .build()
        .await
        .expect("build orchestrator");
    cache.initialize().await.expect("initialize orchestrator");
    cache
}

/// Wait until `condition` holds or the timeout elapses; returns the final
/// evaluation.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
