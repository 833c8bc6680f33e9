//! Error types for the cache orchestrator.
//!
//! Only configuration problems are allowed to surface to callers, and only at
//! boot. Everything else (transport failures, codec failures, capacity
//! pressure) is absorbed into miss/false results and counted.

use thiserror::Error;

/// Fatal configuration error raised during validation at boot.
///
/// Carries the full list of issues so operators can fix everything in one
/// pass instead of playing whack-a-mole.
#[derive(Debug, Error)]
#[error("configuration validation failed: {}", issues.join("; "))]
pub struct ConfigError {
    /// Human-readable validation failures.
    pub issues: Vec<String>,
}

impl ConfigError {
    #[must_use]
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }
}
