//! Trait seams for pluggable backends.
//!
//! - `RemoteClient`: the narrow contract the L2 tier and pattern
//!   invalidation speak to a distributed key/value backend.
//! - `EdgeProvider`: the provider surface the L3 tier uses for content
//!   uploads, URL derivation and purges.
//! - `MetricsSink`: optional observability emission.
//!
//! Implementations must be `Send + Sync`; every I/O operation is fallible
//! with a transport error that upper layers absorb into miss/false results.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Client contract for the distributed key/value backend.
///
/// Keys are UTF-8 strings (callers keep them under 512 bytes), values are
/// opaque byte strings, TTLs are whole seconds. Clustering, pooling, retries
/// and timeouts are properties of the implementation and invisible above
/// this line.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch a single value. `Ok(None)` is an ordinary miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a key, reporting whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Fetch many values; the result aligns index-for-index with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Store many values under one TTL.
    async fn mset(&self, items: &[(String, Vec<u8>)], ttl: Duration) -> Result<()>;

    /// Enumerate keys matching a glob pattern (`*` = any run of characters),
    /// in unspecified order. A sharded backend enumerates all shards.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Provider surface for the edge/CDN tier.
///
/// Requires object PUT with content-type and cache-control headers, a
/// deterministic URL derivation from an object path, and purge-by-path.
#[async_trait]
pub trait EdgeProvider: Send + Sync {
    /// Upload an object to the edge origin.
    async fn put_object(
        &self,
        path: &str,
        body: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<()>;

    /// Purge the given object paths from the edge.
    async fn purge(&self, paths: &[String]) -> Result<()>;

    /// Public URL an uploaded object is served from.
    fn object_url(&self, path: &str) -> String;

    /// Provider name for logging.
    fn name(&self) -> &'static str {
        "edge"
    }
}

/// Optional metrics emission surface.
///
/// Label sets are pre-bound constants (see [`crate::stats::labels`]) so the
/// hot path never allocates for emission.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter.
    fn increment(&self, name: &str, labels: &[(&str, &str)], value: u64);

    /// Observe a duration in seconds on a histogram/summary.
    fn observe(&self, name: &str, labels: &[(&str, &str)], seconds: f64);
}
