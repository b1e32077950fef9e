//! Correlation-table properties under concurrency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetd::promise::Promise;

#[tokio::test]
async fn concurrent_loads_have_a_single_winner() {
    let promise = Arc::new(Promise::new(1));
    let id = promise.next_id();
    promise.store(id, "answer");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let promise = promise.clone();
        handles.push(tokio::spawn(async move { promise.load(id) }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "read-and-delete admits exactly one consumer");
}

#[tokio::test]
async fn ids_are_unique_across_tasks() {
    let promise = Arc::new(Promise::new(7));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let promise = promise.clone();
        handles.push(tokio::spawn(async move {
            (0..512).map(|_| promise.next_id()).collect::<Vec<_>>()
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), total, "snowflake ids must never collide");
}

#[tokio::test]
async fn timeout_is_a_lower_bound() {
    let promise = Promise::new(1);
    let limit = Duration::from_millis(80);
    let start = Instant::now();
    assert!(promise.load_with_timeout(99, limit).await.is_none());
    assert!(
        start.elapsed() >= limit,
        "load_with_timeout returned before its deadline"
    );
}

#[tokio::test]
async fn late_answer_is_picked_up_by_poller() {
    let promise = Arc::new(Promise::new(1));
    let id = promise.next_id();

    let writer = promise.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        writer.store(id, "eventually");
    });

    let got = promise.load_with_timeout(id, Duration::from_secs(2)).await;
    assert_eq!(got.as_deref(), Some("eventually"));
    // The entry was consumed by the successful load.
    assert_eq!(promise.load(id), None);
}
