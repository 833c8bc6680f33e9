//! Write-behind pipeline: coalescing, flushing, retry exhaustion, queue
//! overflow fallback, and shutdown drain.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_cache::{CacheConfig, GetOptions, SetOptions};

fn write_behind_config() -> CacheConfig {
    let mut config = test_config();
    config.l2.write_behind_enabled = true;
    config.l2.write_behind_interval = Duration::from_millis(150);
    config.l2.batch_size = 10;
    config
}

/// Rapid sets on one key coalesce: the backend receives one write carrying
/// the last value.
#[tokio::test]
async fn writes_coalesce_per_key() {
    let remote = MockRemote::new();
    let cache = build_cache(write_behind_config(), Arc::clone(&remote)).await;

    for i in 1..=5 {
        let result = cache
            .set(
                "k",
                json!(i),
                None,
                SetOptions {
                    write_l1: false,
                    write_l2: true,
                    write_l3: false,
                },
            )
            .await;
        assert!(result.success, "enqueue {i} should be accepted");
    }

    // Even before the flush, the write is visible with L1 disabled.
    let early = cache
        .get(
            "k",
            None,
            GetOptions {
                use_l1: false,
                use_l2: true,
                use_l3: false,
            },
        )
        .await;
    assert_eq!(early.value, Some(json!(5)));

    let flushed = wait_for(
        || remote.write_count("app:test:k") >= 1,
        Duration::from_secs(3),
    )
    .await;
    assert!(flushed, "write-behind flush did not happen");
    assert_eq!(remote.write_count("app:test:k"), 1);
    assert_eq!(remote.stored_value("app:test:k"), Some(json!(5)));

    let late = cache
        .get(
            "k",
            None,
            GetOptions {
                use_l1: false,
                use_l2: true,
                use_l3: false,
            },
        )
        .await;
    assert_eq!(late.value, Some(json!(5)));

    cache.shutdown().await;
}

/// Shutdown drains queued items to the backend within the drain deadline.
#[tokio::test]
async fn shutdown_drains_queued_items() {
    let remote = MockRemote::new();
    let mut config = write_behind_config();
    // A long interval keeps the periodic flusher out of the picture.
    config.l2.write_behind_interval = Duration::from_secs(60);
    config.l2.write_behind_drain_deadline = Duration::from_secs(2);
    let cache = build_cache(config, Arc::clone(&remote)).await;

    for key in ["d1", "d2", "d3"] {
        cache
            .set(
                key,
                json!(key),
                None,
                SetOptions {
                    write_l1: false,
                    write_l2: true,
                    write_l3: false,
                },
            )
            .await;
    }
    assert_eq!(remote.len(), 0, "nothing should be flushed yet");

    let start = Instant::now();
    cache.shutdown().await;
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "shutdown exceeded its drain deadline"
    );

    for key in ["d1", "d2", "d3"] {
        assert_eq!(
            remote.stored_value(&format!("app:test:{key}")),
            Some(json!(key)),
            "item {key} was not drained"
        );
    }
}

/// When every flush attempt fails, the items are dropped and counted, not
/// retried forever.
#[tokio::test]
async fn retry_exhaustion_drops_items() {
    let remote = MockRemote::new();
    remote.fail_writes(true);
    let mut config = write_behind_config();
    config.l2.write_behind_max_attempts = 2;
    let cache = build_cache(config, Arc::clone(&remote)).await;

    cache
        .set(
            "doomed",
            json!(1),
            None,
            SetOptions {
                write_l1: false,
                write_l2: true,
                write_l3: false,
            },
        )
        .await;

    let dropped = wait_for(
        || cache.get_statistics().dropped_writes >= 1,
        Duration::from_secs(5),
    )
    .await;
    assert!(dropped, "exhausted items were not counted as dropped");

    // The backend never stored it, and the queue no longer holds it.
    remote.fail_writes(false);
    let read = cache
        .get(
            "doomed",
            None,
            GetOptions {
                use_l1: false,
                use_l2: true,
                use_l3: false,
            },
        )
        .await;
    assert!(!read.hit);

    cache.shutdown().await;
}

/// A full pending queue degrades the set to a synchronous write-through.
#[tokio::test]
async fn full_queue_falls_back_to_write_through() {
    let remote = MockRemote::new();
    let mut config = write_behind_config();
    config.l2.write_behind_interval = Duration::from_secs(60);
    config.l2.write_behind_queue_max = 1;
    let cache = build_cache(config, Arc::clone(&remote)).await;

    let opts = SetOptions {
        write_l1: false,
        write_l2: true,
        write_l3: false,
    };
    cache.set("queued", json!(1), None, opts).await;
    assert_eq!(remote.len(), 0);

    // The queue is full, so this write goes straight through.
    let result = cache.set("direct", json!(2), None, opts).await;
    assert!(result.success);
    assert_eq!(remote.stored_value("app:test:direct"), Some(json!(2)));

    // Coalescing onto the queued key still works with a full queue.
    cache.set("queued", json!(9), None, opts).await;
    cache.shutdown().await;
    assert_eq!(remote.stored_value("app:test:queued"), Some(json!(9)));
}

/// Deleting a key also discards its queued write so the delete cannot be
/// undone by a later flush.
#[tokio::test]
async fn delete_discards_queued_write() {
    let remote = MockRemote::new();
    let mut config = write_behind_config();
    config.l2.write_behind_interval = Duration::from_millis(100);
    let cache = build_cache(config, Arc::clone(&remote)).await;

    let opts = SetOptions {
        write_l1: false,
        write_l2: true,
        write_l3: false,
    };
    cache.set("ghost", json!(1), None, opts).await;
    cache
        .delete("ghost", strata_cache::DeleteOptions::default())
        .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        !remote.contains("app:test:ghost"),
        "queued write resurrected a deleted key"
    );

    cache.shutdown().await;
}
