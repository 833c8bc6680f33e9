//! L3 tier: edge/CDN content cache.
//!
//! Unlike L1/L2, this tier stores addressable content objects rather than
//! arbitrary values. A logical key maps to an object path derived
//! deterministically from the key, uploaded through an [`EdgeProvider`], and
//! served from a CDN URL. The tier keeps a binding per logical key so it can
//! answer `get_cached_url` locally and knows what to purge.
//!
//! Any provider failure degrades to a miss: the caller gets its logical key
//! back and an error counter moves.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::L3Config;
use crate::traits::EdgeProvider;

/// Kinds of content the edge tier serves, each with its own TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    StaticAsset,
    ApiResponse,
    Document,
}

impl ContentType {
    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::StaticAsset => "application/octet-stream",
            Self::ApiResponse => "application/json",
            Self::Document => "application/pdf",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::StaticAsset => "bin",
            Self::ApiResponse => "json",
            Self::Document => "pdf",
        }
    }

    fn ttl(self, config: &L3Config) -> Duration {
        match self {
            Self::StaticAsset => config.static_ttl,
            Self::ApiResponse => config.api_ttl,
            Self::Document => config.default_ttl,
        }
    }
}

/// Bookkeeping for one cached content object.
#[derive(Debug, Clone)]
pub struct CdnBinding {
    pub logical_key: String,
    pub object_path: String,
    pub content_hash: String,
    pub content_type: &'static str,
    pub url: String,
    pub expires_at: Instant,
}

/// Edge/CDN cache tier.
pub struct L3Cache {
    provider: Arc<dyn EdgeProvider>,
    config: L3Config,
    bindings: DashMap<String, CdnBinding>,
    healthy: AtomicBool,
    errors: AtomicU64,
    uploads: AtomicU64,
    purges: AtomicU64,
}

impl L3Cache {
    #[must_use]
    pub fn new(provider: Arc<dyn EdgeProvider>, config: L3Config) -> Self {
        info!(
            provider = provider.name(),
            configured = %config.provider,
            "initializing L3 edge cache"
        );
        Self {
            provider,
            config,
            bindings: DashMap::new(),
            healthy: AtomicBool::new(true),
            errors: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            purges: AtomicU64::new(0),
        }
    }

    /// Upload content for a logical key and return its CDN URL.
    ///
    /// On any provider failure the logical key is returned unchanged, which
    /// readers treat as a miss.
    pub async fn cache_content(
        &self,
        logical_key: &str,
        body: Bytes,
        content_type: ContentType,
        ttl: Option<Duration>,
    ) -> String {
        let ttl = ttl.unwrap_or_else(|| content_type.ttl(&self.config));
        let path = derive_object_path(logical_key, content_type);
        let cache_control = format!("public, max-age={}", ttl.as_secs());
        let content_hash = hex_digest(&body);

        match self
            .provider
            .put_object(&path, body, content_type.mime(), &cache_control)
            .await
        {
            Ok(()) => {
                self.healthy.store(true, Ordering::Relaxed);
                self.uploads.fetch_add(1, Ordering::Relaxed);
                let url = self.provider.object_url(&path);
                self.bindings.insert(
                    logical_key.to_string(),
                    CdnBinding {
                        logical_key: logical_key.to_string(),
                        object_path: path,
                        content_hash,
                        content_type: content_type.mime(),
                        url: url.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                debug!(key = %logical_key, url = %url, "content cached at edge");
                url
            }
            Err(e) => {
                self.record_error();
                warn!(key = %logical_key, error = %e, "edge upload failed");
                logical_key.to_string()
            }
        }
    }

    /// Resolve the CDN URL for a logical key.
    ///
    /// An unexpired binding yields its URL; anything else (no binding, or a
    /// binding past its expiry) yields the logical key back. The two miss
    /// cases are indistinguishable to callers.
    pub async fn get_cached_url(&self, logical_key: &str, _content_type: ContentType) -> String {
        if let Some(binding) = self.bindings.get(logical_key) {
            if binding.expires_at > Instant::now() {
                return binding.url.clone();
            }
        }
        // Expired bindings are dropped on the read path.
        self.bindings
            .remove_if(logical_key, |_, b| b.expires_at <= Instant::now());
        logical_key.to_string()
    }

    /// Purge the given logical keys from the edge. Returns whether the
    /// provider accepted the purge.
    pub async fn invalidate(&self, logical_keys: &[String]) -> bool {
        if logical_keys.is_empty() {
            return true;
        }

        // Purge derived paths even without a live binding; a previous
        // process may have uploaded the object.
        let paths: Vec<String> = logical_keys
            .iter()
            .map(|key| {
                self.bindings
                    .get(key.as_str())
                    .map_or_else(|| derive_object_path(key, ContentType::ApiResponse), |b| b.object_path.clone())
            })
            .collect();

        match self.provider.purge(&paths).await {
            Ok(()) => {
                self.healthy.store(true, Ordering::Relaxed);
                self.purges.fetch_add(1, Ordering::Relaxed);
                for key in logical_keys {
                    self.bindings.remove(key.as_str());
                }
                debug!(count = logical_keys.len(), "edge keys purged");
                true
            }
            Err(e) => {
                self.record_error();
                warn!(error = %e, "edge purge failed");
                false
            }
        }
    }

    /// Drop expired bindings from bookkeeping. Returns how many were removed.
    pub fn cleanup_expired_bindings(&self) -> usize {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.expires_at > now);
        let removed = before.saturating_sub(self.bindings.len());
        if removed > 0 {
            debug!(removed, "expired edge bindings dropped");
        }
        removed
    }

    /// Release resources. Bindings are forgotten; uploaded objects expire on
    /// their own cache-control lifetimes.
    pub async fn close(&self) {
        self.bindings.clear();
        debug!("L3 edge cache closed");
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Relaxed);
    }
}

/// Deterministic object path for a logical key.
fn derive_object_path(logical_key: &str, content_type: ContentType) -> String {
    let digest = hex_digest(logical_key.as_bytes());
    format!("cache/{}.{}", &digest[..32], content_type.extension())
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generic HTTP edge provider: objects are PUT to the origin, purges POST a
/// path list to the origin's purge endpoint, and public URLs come from the
/// configured CDN domain.
pub struct HttpEdgeProvider {
    client: reqwest::Client,
    origin_base: String,
    public_base: String,
}

impl HttpEdgeProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &L3Config) -> Result<Self> {
        let scheme = if config.ssl_required { "https" } else { "http" };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build edge HTTP client")?;
        Ok(Self {
            client,
            origin_base: format!("{scheme}://{}", config.origin_domain),
            public_base: format!("{scheme}://{}", config.domain_name),
        })
    }
}

#[async_trait]
impl EdgeProvider for HttpEdgeProvider {
    async fn put_object(
        &self,
        path: &str,
        body: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<()> {
        let url = format!("{}/{path}", self.origin_base);
        self.client
            .put(&url)
            .header(CONTENT_TYPE, content_type)
            .header(CACHE_CONTROL, cache_control)
            .body(body)
            .send()
            .await
            .context("edge PUT request failed")?
            .error_for_status()
            .context("edge PUT rejected")?;
        Ok(())
    }

    async fn purge(&self, paths: &[String]) -> Result<()> {
        let url = format!("{}/__purge", self.origin_base);
        self.client
            .post(&url)
            .json(&paths)
            .send()
            .await
            .context("edge purge request failed")?
            .error_for_status()
            .context("edge purge rejected")?;
        Ok(())
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{path}", self.public_base)
    }

    fn name(&self) -> &'static str {
        "http-origin"
    }
}
