//! Pattern invalidation across the in-memory and remote tiers.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use strata_cache::{GetOptions, RemoteClient, SetOptions};

/// Keys matching the pattern disappear from L1 and the remote backend;
/// everything else is untouched.
#[tokio::test]
async fn pattern_invalidation_spans_tiers() {
    let remote = MockRemote::new();
    let cache = build_cache(test_config(), Arc::clone(&remote)).await;

    cache
        .set("user:1", json!("u1"), None, SetOptions::default())
        .await;
    cache
        .set("user:2", json!("u2"), None, SetOptions::default())
        .await;
    cache
        .set("post:1", json!("p1"), None, SetOptions::default())
        .await;

    let removed = cache.invalidate_pattern("user:*").await;
    assert!(removed >= 2, "expected at least two removals, got {removed}");

    assert!(!cache.get("user:1", None, GetOptions::default()).await.hit);
    assert!(!cache.get("user:2", None, GetOptions::default()).await.hit);
    assert!(cache.get("post:1", None, GetOptions::default()).await.hit);

    assert!(!remote.contains("app:test:user:1"));
    assert!(!remote.contains("app:test:user:2"));
    assert!(remote.contains("app:test:post:1"));

    // A fresh scan of the backend finds nothing under the pattern.
    let leftover = remote.scan("app:test:user:*").await.unwrap();
    assert!(leftover.is_empty(), "leftover keys: {leftover:?}");

    cache.shutdown().await;
}

/// Keys present only in the remote backend are still found by the scan.
#[tokio::test]
async fn invalidation_reaches_remote_only_keys() {
    let remote = MockRemote::new();
    remote.seed_value("app:test:session:9", &json!("stale"));
    remote.seed_value("app:test:session:10", &json!("stale"));
    let cache = build_cache(test_config(), Arc::clone(&remote)).await;

    let removed = cache.invalidate_pattern("session:*").await;
    assert_eq!(removed, 2);
    assert_eq!(remote.len(), 0);

    cache.shutdown().await;
}

/// The pattern is applied with the deployment prefix, so an equal pattern
/// in another namespace would not match.
#[tokio::test]
async fn invalidation_is_namespace_scoped() {
    let remote = MockRemote::new();
    remote.seed_value("other:ns:user:1", &json!("foreign"));
    let cache = build_cache(test_config(), Arc::clone(&remote)).await;

    cache
        .set("user:1", json!("mine"), None, SetOptions::default())
        .await;
    cache.invalidate_pattern("user:*").await;

    assert!(remote.contains("other:ns:user:1"));
    assert!(!remote.contains("app:test:user:1"));

    cache.shutdown().await;
}

/// A literal pattern (no wildcard) removes exactly that key.
#[tokio::test]
async fn literal_pattern_removes_one_key() {
    let remote = MockRemote::new();
    let cache = build_cache(test_config(), Arc::clone(&remote)).await;

    cache
        .set("exact", json!(1), None, SetOptions::default())
        .await;
    cache
        .set("exactly", json!(2), None, SetOptions::default())
        .await;

    let removed = cache.invalidate_pattern("exact").await;
    assert_eq!(removed, 2); // once from L1, once from the remote
    assert!(!cache.get("exact", None, GetOptions::default()).await.hit);
    assert!(cache.get("exactly", None, GetOptions::default()).await.hit);

    cache.shutdown().await;
}
