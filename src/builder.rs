//! Construction of the cache orchestrator.
//!
//! The builder validates configuration up front (fatal on hard issues,
//! logged warnings otherwise) and wires the enabled tiers together. Custom
//! backends are injected through the trait seams; without injection the
//! default remote client is the redis cluster client and the default edge
//! provider is the generic HTTP origin provider.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coherency::CoherencyManager;
use crate::config::{CacheConfig, Environment};
use crate::keys::KeyCodec;
use crate::l1_cache::L1Cache;
use crate::l2_cache::L2Cache;
use crate::l3_cache::{HttpEdgeProvider, L3Cache};
use crate::orchestrator::CacheOrchestrator;
use crate::traits::{EdgeProvider, MetricsSink, RemoteClient};

/// Builder for [`CacheOrchestrator`].
pub struct OrchestratorBuilder {
    config: CacheConfig,
    environment: Environment,
    remote: Option<Arc<dyn RemoteClient>>,
    edge: Option<Arc<dyn EdgeProvider>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            environment: Environment::Development,
            remote: None,
            edge: None,
            metrics: None,
        }
    }

    /// Set the deployment environment used for validation strictness.
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Inject a custom remote backend client for the L2 tier.
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Inject a custom edge provider for the L3 tier.
    #[must_use]
    pub fn with_edge_provider(mut self, edge: Arc<dyn EdgeProvider>) -> Self {
        self.edge = Some(edge);
        self
    }

    /// Attach a metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate configuration and assemble the orchestrator. The result is
    /// not yet initialized; call [`CacheOrchestrator::initialize`].
    ///
    /// # Errors
    ///
    /// Returns an error on fatal configuration issues, or when the L2 tier
    /// is enabled with no usable remote client.
    pub async fn build(self) -> Result<CacheOrchestrator> {
        let warnings = self.config.validate(self.environment)?;
        for warning in &warnings {
            warn!(warning = %warning, "cache configuration warning");
        }

        let config = self.config;

        let l1 = if config.l1.enabled {
            Some(Arc::new(L1Cache::new(&config.l1)))
        } else {
            None
        };

        let l2 = if config.l2.enabled {
            let remote = match self.remote {
                Some(remote) => remote,
                None => Self::default_remote(&config).await?,
            };
            Some(L2Cache::new(remote, config.l2.clone(), l1.clone()))
        } else {
            None
        };

        let l3 = if config.l3.enabled {
            let provider: Arc<dyn EdgeProvider> = match self.edge {
                Some(provider) => provider,
                None => Arc::new(HttpEdgeProvider::new(&config.l3)?),
            };
            Some(Arc::new(L3Cache::new(provider, config.l3.clone())))
        } else {
            None
        };

        let coherency = if config.multi_layer_enabled && (l1.is_some() || l2.is_some()) {
            Some(Arc::new(CoherencyManager::new(
                config.coherency.clone(),
                KeyCodec::new(config.key_prefix.clone()),
                l1.clone(),
                l2.clone(),
                l3.clone(),
            )))
        } else {
            None
        };

        debug!(
            l1 = l1.is_some(),
            l2 = l2.is_some(),
            l3 = l3.is_some(),
            "cache orchestrator assembled"
        );
        Ok(CacheOrchestrator::from_parts(
            config,
            l1,
            l2,
            l3,
            coherency,
            self.metrics,
        ))
    }

    #[cfg(feature = "redis")]
    async fn default_remote(config: &CacheConfig) -> Result<Arc<dyn RemoteClient>> {
        use crate::cluster::RedisClusterClient;

        let client = if config.cluster.enabled {
            RedisClusterClient::connect(&config.cluster).await?
        } else {
            RedisClusterClient::connect_single("redis://127.0.0.1:6379", config.cluster.timeout)
                .await?
        };
        Ok(Arc::new(client))
    }

    #[cfg(not(feature = "redis"))]
    async fn default_remote(_config: &CacheConfig) -> Result<Arc<dyn RemoteClient>> {
        anyhow::bail!(
            "l2 tier enabled but no remote client provided; inject one with \
             with_remote() or enable the `redis` feature"
        )
    }
}

impl CacheOrchestrator {
    /// Start building an orchestrator from a configuration snapshot.
    #[must_use]
    pub fn builder(config: CacheConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }
}
