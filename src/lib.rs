//! Strata Cache
//!
//! A hierarchical caching subsystem for Rust services:
//! - **L1**: bounded in-memory store with hot/warm/cold temperature bands,
//!   per-key TTL, pattern invalidation, and exact byte accounting
//! - **L2**: distributed tier over a cluster-capable remote store, with
//!   transparent compression, batched I/O, and an optional write-behind queue
//! - **L3**: optional edge/CDN tier for addressable content
//! - **Coherency**: configurable cross-tier propagation protocols
//! - **Observability**: statistics snapshots, health views, metrics emission
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use strata_cache::{CacheConfig, CacheOrchestrator, GetOptions, SetOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheOrchestrator::builder(CacheConfig::default())
//!         .build()
//!         .await?;
//!     cache.initialize().await?;
//!
//!     let value = serde_json::json!({"user": "alice", "score": 100});
//!     cache
//!         .set("user:1", value, None, SetOptions::default())
//!         .await;
//!
//!     let result = cache.get("user:1", None, GetOptions::default()).await;
//!     if result.hit {
//!         println!("found in {:?}: {:?}", result.tier_hit, result.value);
//!     }
//!
//!     let stats = cache.get_statistics();
//!     println!("hit rate: {:.2}%", stats.hit_rate_percent);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request -> L1 (in-memory bands) -> L2 (remote KV) -> L3 (edge/CDN)
//!            | hit                   | hit: promote     | hit: CDN URL
//!            return                  to L1, return      return
//! ```
//!
//! All public operations are infallible: tier failures collapse into
//! miss/false results with counters incremented, so hot paths stay
//! branch-light. Configuration problems are the only fatal errors, and only
//! at boot.

pub mod builder;
#[cfg(feature = "redis")]
pub mod cluster;
pub mod codec;
pub mod coherency;
pub mod config;
pub mod error;
pub mod keys;
pub mod l1_cache;
pub mod l2_cache;
pub mod l3_cache;
pub mod orchestrator;
pub mod stats;
pub mod traits;

pub use builder::OrchestratorBuilder;
#[cfg(feature = "redis")]
pub use cluster::RedisClusterClient;
pub use codec::{Encoded, ValueCodec};
pub use coherency::CoherencyManager;
pub use config::{
    CacheConfig, ClusterConfig, CoherencyConfig, CoherencyProtocol, ConsistencyLevel, Environment,
    InvalidationStrategy, L1Config, L2Config, L3Config,
};
pub use error::ConfigError;
pub use keys::{KeyCodec, KeyPattern};
pub use l1_cache::{Band, L1Cache, L1Health};
pub use l2_cache::L2Cache;
pub use l3_cache::{ContentType, HttpEdgeProvider, L3Cache};
pub use orchestrator::{
    CacheOrchestrator, DeleteOptions, GetOptions, HealthState, HealthStatus, OperationResult,
    SetOptions,
};
pub use stats::{CacheStatistics, Tier, TracingMetricsSink};
pub use traits::{EdgeProvider, MetricsSink, RemoteClient};

// Re-export async_trait so custom backends don't need their own dependency.
pub use async_trait::async_trait;
