//! L1 tier: bounded in-memory store with temperature bands.
//!
//! The store is split into three bands (hot, warm, cold), each with its own
//! byte capacity and lock. New entries land in warm; repeated hits promote
//! an entry one band hotter, idleness demotes it one band colder. When an
//! insert pushes a band over its capacity, the least-recently-used entries
//! (ties broken by lowest access count) overflow into the next cooler band;
//! entries evicted from cold leave the cache entirely.
//!
//! Reads never block each other: band maps sit behind `RwLock` and access
//! tracking lives in per-entry atomics. Byte accounting is updated only
//! under a band's write lock, so it is exact under concurrent mutation. No
//! operation returns an error.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::L1Config;
use crate::keys::KeyPattern;

/// Temperature band of an L1 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Hot,
    Warm,
    Cold,
}

impl Band {
    pub const ALL: [Self; 3] = [Self::Hot, Self::Warm, Self::Cold];

    #[must_use]
    fn index(self) -> usize {
        match self {
            Self::Hot => 0,
            Self::Warm => 1,
            Self::Cold => 2,
        }
    }

    /// One band toward hot, if any.
    #[must_use]
    pub fn hotter(self) -> Option<Self> {
        match self {
            Self::Hot => None,
            Self::Warm => Some(Self::Hot),
            Self::Cold => Some(Self::Warm),
        }
    }

    /// One band toward cold, if any.
    #[must_use]
    pub fn cooler(self) -> Option<Self> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cold),
            Self::Cold => None,
        }
    }
}

/// A cached entry. Access tracking uses atomics so readers share the entry
/// without taking a write lock.
#[derive(Debug)]
struct Entry {
    value: Value,
    size: usize,
    stored_at: Instant,
    ttl: Option<Duration>,
    access_count: AtomicU64,
    /// Hits since the entry last changed bands; drives promotion.
    band_hits: AtomicU64,
    /// Nanoseconds since the cache epoch; drives LRU order and demotion.
    last_access_ns: AtomicU64,
}

impl Entry {
    fn new(value: Value, size: usize, ttl: Option<Duration>, now_ns: u64) -> Self {
        Self {
            value,
            size,
            stored_at: Instant::now(),
            ttl,
            access_count: AtomicU64::new(0),
            band_hits: AtomicU64::new(0),
            last_access_ns: AtomicU64::new(now_ns),
        }
    }

    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.stored_at.elapsed() >= ttl)
    }

    /// Eviction ordering key: least recent first, ties to the least accessed.
    fn lru_rank(&self) -> (u64, u64) {
        (
            self.last_access_ns.load(Ordering::Relaxed),
            self.access_count.load(Ordering::Relaxed),
        )
    }
}

/// One capacity-capped band.
#[derive(Debug)]
struct BandStore {
    cap: usize,
    used: AtomicUsize,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

impl BandStore {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            used: AtomicUsize::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

/// Health view of the L1 tier.
#[derive(Debug, Clone, Serialize)]
pub struct L1Health {
    pub healthy: bool,
    pub entries: usize,
    pub size_bytes: usize,
    pub hot_bytes: usize,
    pub warm_bytes: usize,
    pub cold_bytes: usize,
    pub evictions: u64,
}

/// Approximate in-memory footprint of an entry.
///
/// Deliberately cheap: the goal is stable byte accounting for capacity
/// decisions, not allocator-exact sizes.
#[must_use]
pub fn approximate_entry_size(key: &str, value: &Value) -> usize {
    key.len() + approximate_value_size(value)
}

fn approximate_value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(approximate_value_size).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 2 + approximate_value_size(v))
                .sum::<usize>()
        }
    }
}

/// Bounded, tiered in-memory cache.
pub struct L1Cache {
    bands: [BandStore; 3],
    /// Sharded key -> band placement map.
    placement: DashMap<String, Band>,
    total_cap: usize,
    default_ttl: Duration,
    promotion_threshold: u64,
    demotion_window: Duration,
    epoch: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    oversize_rejects: AtomicU64,
}

impl L1Cache {
    #[must_use]
    pub fn new(config: &L1Config) -> Self {
        debug!(
            total_bytes = config.total_bytes,
            hot = config.hot_bytes,
            warm = config.warm_bytes,
            cold = config.cold_bytes,
            "initializing L1 tiered memory cache"
        );
        Self {
            bands: [
                BandStore::new(config.hot_bytes),
                BandStore::new(config.warm_bytes),
                BandStore::new(config.cold_bytes),
            ],
            placement: DashMap::new(),
            total_cap: config.total_bytes,
            default_ttl: config.default_ttl,
            promotion_threshold: config.promotion_threshold.max(1),
            demotion_window: config.demotion_window,
            epoch: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            oversize_rejects: AtomicU64::new(0),
        }
    }

    fn band(&self, band: Band) -> &BandStore {
        &self.bands[band.index()]
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Find an entry wherever it lives. Falls back to scanning every band if
    /// the placement map is momentarily out of step with a migration.
    fn locate(&self, key: &str) -> Option<(Band, Arc<Entry>)> {
        if let Some(band) = self.placement.get(key).map(|r| *r.value()) {
            if let Some(entry) = self.band(band).entries.read().get(key).cloned() {
                return Some((band, entry));
            }
        }
        for band in Band::ALL {
            if let Some(entry) = self.band(band).entries.read().get(key).cloned() {
                self.placement.insert(key.to_string(), band);
                return Some((band, entry));
            }
        }
        None
    }

    /// Get a value, updating access tracking and possibly promoting the
    /// entry one band hotter.
    pub fn get(&self, key: &str) -> Option<Value> {
        let Some((band, entry)) = self.locate(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired() {
            self.remove_key(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.last_access_ns.store(self.now_ns(), Ordering::Relaxed);
        entry.access_count.fetch_add(1, Ordering::Relaxed);
        let in_band = entry.band_hits.fetch_add(1, Ordering::Relaxed) + 1;
        self.hits.fetch_add(1, Ordering::Relaxed);

        if in_band >= self.promotion_threshold {
            if let Some(hotter) = band.hotter() {
                entry.band_hits.store(0, Ordering::Relaxed);
                if self.move_entry(key, band, hotter) {
                    self.promotions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Some(entry.value.clone())
    }

    /// Store a value. `None` TTL uses the configured default.
    ///
    /// An entry that cannot fit the total budget even after evicting
    /// everything else is dropped rather than stored; the cache never grows
    /// past its byte budget.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let size = approximate_entry_size(key, &value);
        if size > self.total_cap {
            self.oversize_rejects.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, size, budget = self.total_cap, "value exceeds the L1 byte budget, not cached");
            return;
        }

        // Replace semantics: drop any previous version first so size
        // accounting sees one entry per key.
        self.remove_key(key);

        let ttl = ttl.or(Some(self.default_ttl));
        let entry = Arc::new(Entry::new(value, size, ttl, self.now_ns()));
        let band = self.target_band(size);
        self.place_cascading(band, key.to_string(), entry);
        self.enforce_total_budget(key);
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a value without touching access tracking, statistics, or band
    /// placement. Expired entries still read as absent.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Value> {
        let (_, entry) = self.locate(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove a key from the cache. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.remove_key(key)
    }

    /// Whether a live (non-expired) entry exists for the key.
    pub fn exists(&self, key: &str) -> bool {
        match self.locate(key) {
            Some((_, entry)) => !entry.is_expired(),
            None => false,
        }
    }

    /// Delete every entry matching the compiled pattern; returns the count.
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut removed = 0;
        for band in Band::ALL {
            let store = self.band(band);
            let mut map = store.entries.write();
            let matching: Vec<String> = map
                .keys()
                .filter(|k| pattern.matches(k))
                .cloned()
                .collect();
            for key in matching {
                if let Some(entry) = map.remove(&key) {
                    store.used.fetch_sub(entry.size, Ordering::Relaxed);
                    self.placement.remove(&key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(pattern = %pattern.as_str(), removed, "invalidated L1 entries by pattern");
        }
        removed
    }

    /// Remove every expired entry in one pass; returns the count.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        for band in Band::ALL {
            let store = self.band(band);
            let mut map = store.entries.write();
            let expired: Vec<String> = map
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(entry) = map.remove(&key) {
                    store.used.fetch_sub(entry.size, Ordering::Relaxed);
                    self.placement.remove(&key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "expired L1 entries swept");
        }
        removed
    }

    /// Demote entries idle past the demotion window one band colder.
    /// Returns the number of entries moved.
    pub fn demote_idle(&self) -> usize {
        let window_ns = u64::try_from(self.demotion_window.as_nanos()).unwrap_or(u64::MAX);
        let Some(cutoff) = self.now_ns().checked_sub(window_ns) else {
            return 0;
        };

        let mut moved = 0;
        // Warm first so an entry leaving hot is not demoted twice in one
        // sweep.
        for band in [Band::Warm, Band::Hot] {
            let Some(cooler) = band.cooler() else { continue };
            let idle: Vec<String> = self
                .band(band)
                .entries
                .read()
                .iter()
                .filter(|(_, e)| e.last_access_ns.load(Ordering::Relaxed) <= cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for key in idle {
                if self.move_entry(&key, band, cooler) {
                    self.demotions.fetch_add(1, Ordering::Relaxed);
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Exact total byte size across all bands.
    #[must_use]
    pub fn total_size_bytes(&self) -> usize {
        Band::ALL
            .iter()
            .map(|b| self.band(*b).used.load(Ordering::Relaxed))
            .sum()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        Band::ALL
            .iter()
            .map(|b| self.band(*b).entries.read().len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Which band a key currently sits in.
    #[must_use]
    pub fn band_of(&self, key: &str) -> Option<Band> {
        self.locate(key).map(|(band, _)| band)
    }

    /// When the entry was stored, if present.
    #[must_use]
    pub fn stored_at(&self, key: &str) -> Option<Instant> {
        self.locate(key).map(|(_, e)| e.stored_at)
    }

    /// Up to `limit` keys, sampled across bands in no particular order.
    #[must_use]
    pub fn keys_sample(&self, limit: usize) -> Vec<String> {
        let mut keys = Vec::with_capacity(limit.min(64));
        for band in Band::ALL {
            if keys.len() >= limit {
                break;
            }
            let map = self.band(band).entries.read();
            keys.extend(map.keys().take(limit - keys.len()).cloned());
        }
        keys
    }

    /// The most frequently accessed keys, hottest bands first.
    #[must_use]
    pub fn hottest_keys(&self, limit: usize) -> Vec<String> {
        let mut ranked: Vec<(u64, String)> = Vec::new();
        for band in Band::ALL {
            let map = self.band(band).entries.read();
            ranked.extend(
                map.iter()
                    .map(|(k, e)| (e.access_count.load(Ordering::Relaxed), k.clone())),
            );
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.into_iter().take(limit).map(|(_, k)| k).collect()
    }

    #[must_use]
    pub fn health(&self) -> L1Health {
        let size = self.total_size_bytes();
        L1Health {
            healthy: size <= self.total_cap,
            entries: self.len(),
            size_bytes: size,
            hot_bytes: self.band(Band::Hot).used.load(Ordering::Relaxed),
            warm_bytes: self.band(Band::Warm).used.load(Ordering::Relaxed),
            cold_bytes: self.band(Band::Cold).used.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    // ===== internals =====

    /// The band a fresh insert targets: warm, unless the entry cannot fit
    /// warm's capacity, in which case the roomiest band that can hold it.
    fn target_band(&self, size: usize) -> Band {
        if size <= self.band(Band::Warm).cap {
            return Band::Warm;
        }
        let mut best = Band::Warm;
        let mut best_cap = self.band(Band::Warm).cap;
        for band in [Band::Cold, Band::Hot] {
            let cap = self.band(band).cap;
            if cap > best_cap {
                best = band;
                best_cap = cap;
            }
        }
        best
    }

    /// Insert an entry and cascade any evicted victims toward cold.
    fn place_cascading(&self, band: Band, key: String, entry: Arc<Entry>) {
        let mut work = vec![(band, key, entry)];
        while let Some((b, k, e)) = work.pop() {
            self.placement.insert(k.clone(), b);
            let victims = self.insert_and_evict(b, &k, e);
            match b.cooler() {
                Some(cooler) => {
                    for (vk, ve) in victims {
                        ve.band_hits.store(0, Ordering::Relaxed);
                        work.push((cooler, vk, ve));
                    }
                }
                None => {
                    for (vk, _) in victims {
                        self.placement.remove(&vk);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Insert under the band's write lock, then evict least-recently-used
    /// entries (never the one just inserted) until the band fits its cap.
    /// The lock is released before victims travel to another band.
    fn insert_and_evict(
        &self,
        band: Band,
        key: &str,
        entry: Arc<Entry>,
    ) -> Vec<(String, Arc<Entry>)> {
        let store = self.band(band);
        let mut victims = Vec::new();
        let mut map = store.entries.write();

        let size = entry.size;
        if let Some(old) = map.insert(key.to_string(), entry) {
            store.used.fetch_sub(old.size, Ordering::Relaxed);
        }
        store.used.fetch_add(size, Ordering::Relaxed);

        while store.used.load(Ordering::Relaxed) > store.cap {
            let victim_key = map
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, e)| e.lru_rank())
                .map(|(k, _)| k.clone());
            let Some(victim_key) = victim_key else {
                // Only the fresh entry remains; an oversized entry may sit
                // over the band cap but never over the total budget.
                break;
            };
            if let Some(victim) = map.remove(&victim_key) {
                store.used.fetch_sub(victim.size, Ordering::Relaxed);
                victims.push((victim_key, victim));
            }
        }
        victims
    }

    /// Keep the whole cache inside the total byte budget by evicting the
    /// globally oldest entries. Only reachable when a single entry overflows
    /// its band cap.
    fn enforce_total_budget(&self, keep: &str) {
        while self.total_size_bytes() > self.total_cap {
            let mut oldest: Option<(Band, String, (u64, u64))> = None;
            for band in Band::ALL {
                let map = self.band(band).entries.read();
                for (k, e) in map.iter().filter(|(k, _)| k.as_str() != keep) {
                    let rank = e.lru_rank();
                    if oldest
                        .as_ref()
                        .is_none_or(|(_, _, best)| rank < *best)
                    {
                        oldest = Some((band, k.clone(), rank));
                    }
                }
            }
            let Some((band, key, _)) = oldest else { break };
            self.remove_from_band(band, &key);
            self.placement.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove_from_band(&self, band: Band, key: &str) -> Option<Arc<Entry>> {
        let store = self.band(band);
        let mut map = store.entries.write();
        let entry = map.remove(key)?;
        store.used.fetch_sub(entry.size, Ordering::Relaxed);
        Some(entry)
    }

    fn remove_key(&self, key: &str) -> bool {
        if let Some(band) = self.placement.remove(key).map(|(_, b)| b) {
            if self.remove_from_band(band, key).is_some() {
                return true;
            }
        }
        for band in Band::ALL {
            if self.remove_from_band(band, key).is_some() {
                self.placement.remove(key);
                return true;
            }
        }
        false
    }

    /// Move an entry between bands. Locks are taken one band at a time.
    fn move_entry(&self, key: &str, from: Band, to: Band) -> bool {
        let Some(entry) = self.remove_from_band(from, key) else {
            return false;
        };
        entry.band_hits.store(0, Ordering::Relaxed);
        self.place_cascading(to, key.to_string(), entry);
        true
    }
}

impl std::fmt::Debug for L1Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L1Cache")
            .field("entries", &self.len())
            .field("size_bytes", &self.total_size_bytes())
            .field("total_cap", &self.total_cap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_config() -> L1Config {
        L1Config {
            enabled: true,
            total_bytes: 100,
            hot_bytes: 20,
            warm_bytes: 40,
            cold_bytes: 40,
            default_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            promotion_threshold: 3,
            demotion_window: Duration::from_millis(40),
        }
    }

    /// key of 2 chars + 6-char string value = 10 bytes.
    fn ten_byte_value() -> Value {
        json!("abcdef")
    }

    #[test]
    fn set_get_round_trip() {
        let cache = L1Cache::new(&L1Config::default());
        cache.set("k", json!({"a": 1}), None);
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
        assert!(cache.exists("k"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn new_entries_enter_warm() {
        let cache = L1Cache::new(&small_config());
        cache.set("k0", ten_byte_value(), None);
        assert_eq!(cache.band_of("k0"), Some(Band::Warm));
    }

    #[test]
    fn repeated_hits_promote_toward_hot() {
        let cache = L1Cache::new(&small_config());
        cache.set("k0", ten_byte_value(), None);
        for _ in 0..3 {
            cache.get("k0");
        }
        assert_eq!(cache.band_of("k0"), Some(Band::Hot));
    }

    #[test]
    fn idle_entries_demote_toward_cold() {
        let cache = L1Cache::new(&small_config());
        cache.set("k0", ten_byte_value(), None);
        std::thread::sleep(Duration::from_millis(60));
        let moved = cache.demote_idle();
        assert_eq!(moved, 1);
        assert_eq!(cache.band_of("k0"), Some(Band::Cold));
    }

    #[test]
    fn eviction_cascades_warm_to_cold_and_out() {
        let cache = L1Cache::new(&small_config());
        // Ten 10-byte entries into warm (cap 40): four stay warm, four land
        // in cold, two leave the cache.
        for i in 0..10 {
            cache.set(&format!("k{i}"), ten_byte_value(), None);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(cache.total_size_bytes() <= 100);
        let health = cache.health();
        assert!(health.warm_bytes <= 40);
        assert!(health.cold_bytes <= 40);

        let before = cache.eviction_count();
        cache.set("ka", ten_byte_value(), None);
        std::thread::sleep(Duration::from_millis(1));
        cache.set("kb", ten_byte_value(), None);
        assert_eq!(cache.eviction_count() - before, 2);
        assert!(cache.total_size_bytes() <= 100);

        // The two most recent inserts are retrievable.
        assert_eq!(cache.get("ka"), Some(ten_byte_value()));
        assert_eq!(cache.get("kb"), Some(ten_byte_value()));
    }

    #[test]
    fn band_caps_hold_after_settling() {
        let cache = L1Cache::new(&small_config());
        for i in 0..30 {
            cache.set(&format!("x{i:02}"), json!("abcde"), None);
        }
        let health = cache.health();
        assert!(health.hot_bytes <= 20);
        assert!(health.warm_bytes <= 40);
        assert!(health.cold_bytes <= 40);
        assert!(health.size_bytes <= 100);
        assert!(health.healthy);
    }

    #[test]
    fn oversized_entry_is_rejected_not_stored() {
        let cache = L1Cache::new(&small_config());
        cache.set("big", json!("z".repeat(200)), None);
        assert!(!cache.exists("big"));
        assert_eq!(cache.total_size_bytes(), 0);
    }

    #[test]
    fn expired_entries_miss_and_are_removed() {
        let cache = L1Cache::new(&small_config());
        cache.set("k0", ten_byte_value(), Some(Duration::from_millis(20)));
        assert!(cache.get("k0").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k0"), None);
        assert!(!cache.exists("k0"));
        assert_eq!(cache.total_size_bytes(), 0);
    }

    #[test]
    fn cleanup_sweeps_all_expired() {
        let cache = L1Cache::new(&small_config());
        cache.set("a0", ten_byte_value(), Some(Duration::from_millis(10)));
        cache.set("b0", ten_byte_value(), Some(Duration::from_millis(10)));
        cache.set("c0", ten_byte_value(), Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("c0"));
    }

    #[test]
    fn pattern_invalidation_removes_only_matches() {
        let cache = L1Cache::new(&L1Config::default());
        cache.set("user:1", json!(1), None);
        cache.set("user:2", json!(2), None);
        cache.set("post:1", json!(3), None);

        let pattern = KeyPattern::compile("user:*");
        assert_eq!(cache.invalidate_pattern(&pattern), 2);
        assert!(!cache.exists("user:1"));
        assert!(!cache.exists("user:2"));
        assert!(cache.exists("post:1"));
    }

    #[test]
    fn overwrite_recomputes_size() {
        let cache = L1Cache::new(&small_config());
        cache.set("k0", ten_byte_value(), None);
        let before = cache.total_size_bytes();
        cache.set("k0", json!("ab"), None);
        assert!(cache.total_size_bytes() < before);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_returns_presence() {
        let cache = L1Cache::new(&L1Config::default());
        cache.set("k", json!(1), None);
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert_eq!(cache.total_size_bytes(), 0);
    }

    #[test]
    fn size_accounting_is_exact_under_concurrency() {
        let cache = Arc::new(L1Cache::new(&L1Config::default()));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("t{t}:k{i}");
                    cache.set(&key, json!("payload"), None);
                    if i % 3 == 0 {
                        cache.delete(&key);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Recompute from the maps and compare with the atomic counters.
        let mut actual = 0;
        for band in Band::ALL {
            let map = cache.band(band).entries.read();
            actual += map.values().map(|e| e.size).sum::<usize>();
        }
        assert_eq!(actual, cache.total_size_bytes());
    }

    #[test]
    fn hottest_keys_rank_by_access_count() {
        let cache = L1Cache::new(&L1Config::default());
        cache.set("cold1", json!(1), None);
        cache.set("hot1", json!(2), None);
        for _ in 0..5 {
            cache.get("hot1");
        }
        let hottest = cache.hottest_keys(1);
        assert_eq!(hottest, vec!["hot1".to_string()]);
    }
}
