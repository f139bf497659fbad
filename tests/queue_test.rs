//! Integration tests for the lease queue client over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use leaseq::store::{LeaseStore, MemoryStore};
use leaseq::queue::{MAX_LEASE_DURATION, MIN_POLL_INTERVAL};
use leaseq::{Error, LeaseQueue, SessionId};
use serde_json::json;

const LEASE: Duration = Duration::from_secs(10);

fn shared_store() -> Arc<dyn LeaseStore> {
    Arc::new(MemoryStore::new())
}

fn client(store: &Arc<dyn LeaseStore>, session: &str) -> LeaseQueue {
    LeaseQueue::new("job2", Arc::clone(store)).with_session(SessionId::from(session))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[test]
fn each_client_gets_its_own_session() {
    let store = shared_store();
    let a = LeaseQueue::new("job2", Arc::clone(&store));
    let b = LeaseQueue::new("job2", Arc::clone(&store));

    assert_ne!(a.session_id(), b.session_id());
    assert_eq!(a.session_id(), a.clone().session_id());
}

// ---------------------------------------------------------------------------
// Empty
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_tracks_pending_and_leased_items() {
    let store = shared_store();
    let q = client(&store, "w1");

    assert!(q.empty().await.unwrap());

    q.enqueue(json!("a")).await.unwrap();
    assert!(!q.empty().await.unwrap(), "pending item");

    let lease = q.lease(LEASE, false, None).await.unwrap().unwrap();
    let stats = q.stats().await.unwrap();
    assert_eq!((stats.pending, stats.leased), (0, 1));
    assert!(!q.empty().await.unwrap(), "leased item still counts");

    assert!(q.complete(&lease).await.unwrap());
    assert!(q.empty().await.unwrap());
}

#[tokio::test]
async fn queues_are_isolated_by_name() {
    let store = shared_store();
    let jobs = LeaseQueue::new("jobs", Arc::clone(&store));
    let other = LeaseQueue::new("other", Arc::clone(&store));

    jobs.enqueue(json!(1)).await.unwrap();

    assert!(other.empty().await.unwrap());
    assert!(other.lease(LEASE, false, None).await.unwrap().is_none());
    assert!(!jobs.empty().await.unwrap());
}

// ---------------------------------------------------------------------------
// Lease / complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lease_delivers_in_fifo_order() {
    let store = shared_store();
    let q = client(&store, "w1");

    let a = q.enqueue(json!("a")).await.unwrap();
    let b = q.enqueue(json!("b")).await.unwrap();

    let first = q.lease(LEASE, false, None).await.unwrap().unwrap();
    let second = q.lease(LEASE, false, None).await.unwrap().unwrap();

    assert_eq!(first.id(), a);
    assert_eq!(first.item.payload, json!("a"));
    assert_eq!(first.item.deliveries, 1);
    assert_eq!(first.session, SessionId::from("w1"));
    assert_eq!(second.id(), b);
}

#[tokio::test]
async fn non_blocking_lease_on_empty_queue_returns_none() {
    let store = shared_store();
    let q = client(&store, "w1");

    let leased = tokio::time::timeout(Duration::from_secs(1), q.lease(LEASE, false, None))
        .await
        .expect("non-blocking lease should return immediately")
        .unwrap();
    assert!(leased.is_none());
}

#[tokio::test]
async fn zero_lease_duration_is_rejected() {
    let store = shared_store();
    let q = client(&store, "w1");
    q.enqueue(json!("a")).await.unwrap();

    let err = q.lease(Duration::ZERO, false, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(q.stats().await.unwrap().pending, 1, "nothing was leased");
}

#[tokio::test]
async fn oversized_lease_duration_is_rejected_and_item_kept() {
    let store = shared_store();
    let q = client(&store, "w1");
    let id = q.enqueue(json!("a")).await.unwrap();

    for duration in [
        Duration::from_secs(u64::MAX / 2),
        Duration::from_secs(10_000_000_000_000),
        MAX_LEASE_DURATION + Duration::from_secs(1),
    ] {
        let err = q.lease(duration, false, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{duration:?}");
    }

    let stats = q.stats().await.unwrap();
    assert_eq!((stats.pending, stats.leased), (1, 0));

    let lease = q.lease(MAX_LEASE_DURATION, false, None).await.unwrap().unwrap();
    assert_eq!(lease.id(), id);
    assert!(q.complete(&lease).await.unwrap());
}

#[test]
fn zero_poll_interval_is_raised_to_the_minimum() {
    let q = LeaseQueue::new("job2", shared_store()).with_poll_interval(Duration::ZERO);
    assert_eq!(q.poll_interval(), MIN_POLL_INTERVAL);

    let q = q.with_poll_interval(Duration::from_secs(1));
    assert_eq!(q.poll_interval(), Duration::from_secs(1));
}

#[tokio::test]
async fn completed_item_never_reappears() {
    let store = shared_store();
    let q = client(&store, "w1");
    q.enqueue(json!("a")).await.unwrap();

    let lease = q.lease(LEASE, false, None).await.unwrap().unwrap();
    assert!(q.complete(&lease).await.unwrap());

    assert!(q.lease(LEASE, false, None).await.unwrap().is_none());
    assert!(q.empty().await.unwrap());
    assert!(
        !q.complete(&lease).await.unwrap(),
        "second completion is a no-op"
    );
}

#[tokio::test]
async fn another_session_cannot_complete_a_lease() {
    let store = shared_store();
    let owner = client(&store, "owner");
    let intruder = client(&store, "intruder");
    owner.enqueue(json!("a")).await.unwrap();

    let lease = owner.lease(LEASE, false, None).await.unwrap().unwrap();

    assert!(!intruder.complete(&lease).await.unwrap());
    assert_eq!(owner.stats().await.unwrap().leased, 1);
    assert!(owner.complete(&lease).await.unwrap());
}

// ---------------------------------------------------------------------------
// Expiry and re-delivery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn crashed_worker_item_is_redelivered_after_lease_expiry() {
    let store = shared_store();
    let crashed = client(&store, "crashed");
    let survivor = client(&store, "survivor");

    let a = crashed.enqueue(json!("A")).await.unwrap();
    let b = crashed.enqueue(json!("B")).await.unwrap();

    let lease = crashed.lease(LEASE, false, None).await.unwrap().unwrap();
    assert_eq!(lease.id(), a);
    // The worker "crashes": it never completes.

    tokio::time::advance(Duration::from_secs(5)).await;
    let before_expiry = survivor.lease(LEASE, false, None).await.unwrap().unwrap();
    assert_eq!(before_expiry.id(), b, "A is still leased");

    tokio::time::advance(Duration::from_secs(6)).await;
    let redelivered = survivor.lease(LEASE, false, None).await.unwrap().unwrap();
    assert_eq!(redelivered.id(), a);
    assert_eq!(redelivered.item.deliveries, 2);
    assert!(redelivered.item.is_redelivery());
}

#[tokio::test(start_paused = true)]
async fn completion_after_expiry_fails_and_item_stays_deliverable() {
    let store = shared_store();
    let slow = client(&store, "slow");
    let other = client(&store, "other");
    let a = slow.enqueue(json!("A")).await.unwrap();

    let lease = slow.lease(Duration::from_secs(1), false, None).await.unwrap().unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    assert!(!slow.complete(&lease).await.unwrap());
    assert!(!slow.empty().await.unwrap());

    let again = other.lease(LEASE, false, None).await.unwrap().unwrap();
    assert_eq!(again.id(), a);
    assert!(
        !slow.complete(&lease).await.unwrap(),
        "the old lease stays void after re-delivery"
    );
    assert!(other.complete(&again).await.unwrap());
    assert!(other.empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn reclaim_expired_returns_items_to_pending() {
    let store = shared_store();
    let q = client(&store, "w1");
    q.enqueue(json!("a")).await.unwrap();
    q.enqueue(json!("b")).await.unwrap();

    q.lease(Duration::from_secs(1), false, None).await.unwrap().unwrap();
    q.lease(Duration::from_secs(3), false, None).await.unwrap().unwrap();
    assert_eq!(q.reclaim_expired().await.unwrap(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(q.reclaim_expired().await.unwrap(), 1);

    let stats = q.stats().await.unwrap();
    assert_eq!((stats.pending, stats.leased), (1, 1));
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn blocking_lease_on_empty_queue_times_out() {
    let store = shared_store();
    let q = client(&store, "w1");

    let started = tokio::time::Instant::now();
    let leased = q
        .lease(LEASE, true, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let waited = started.elapsed();

    assert!(leased.is_none());
    assert!(waited >= Duration::from_secs(2), "returned early: {waited:?}");
    assert!(waited < Duration::from_secs(3), "overshot: {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn blocking_lease_wakes_when_work_arrives() {
    let store = shared_store();
    let waiter = client(&store, "waiter").with_poll_interval(Duration::from_secs(60));
    let producer = client(&store, "producer");

    let handle = tokio::spawn(async move {
        waiter
            .lease(LEASE, true, Some(Duration::from_secs(30)))
            .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let id = producer.enqueue(json!("late")).await.unwrap();

    let started = tokio::time::Instant::now();
    let leased = handle.await.unwrap().unwrap().expect("waiter should get the item");
    assert_eq!(leased.id(), id);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn blocking_lease_picks_up_expired_lease() {
    let store = shared_store();
    let crashed = client(&store, "crashed");
    let waiter = client(&store, "waiter").with_poll_interval(Duration::from_secs(60));
    let a = crashed.enqueue(json!("A")).await.unwrap();
    crashed.lease(Duration::from_secs(3), false, None).await.unwrap().unwrap();

    let started = tokio::time::Instant::now();
    let leased = waiter
        .lease(LEASE, true, Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .expect("item should come back after expiry");

    assert_eq!(leased.id(), a);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_blocked_lease_cancels_it() {
    let store = shared_store();
    let q = client(&store, "w1");

    let cancelled = tokio::time::timeout(Duration::from_millis(300), q.lease(LEASE, true, None)).await;
    assert!(cancelled.is_err(), "lease without timeout keeps waiting");

    q.enqueue(json!("a")).await.unwrap();
    assert_eq!(q.stats().await.unwrap().pending, 1, "cancelled wait leased nothing");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_workers_race_for_one_item() {
    let store = shared_store();
    let w1 = client(&store, "w1");
    let w2 = client(&store, "w2");
    w1.enqueue(json!("only")).await.unwrap();

    let (r1, r2) = tokio::join!(
        w1.lease(LEASE, false, None),
        w2.lease(LEASE, false, None)
    );
    let winners = [r1.unwrap(), r2.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_share_an_item() {
    const ITEMS: usize = 200;
    const WORKERS: usize = 8;

    let store = shared_store();
    let producer = client(&store, "producer");
    let mut expected = HashSet::new();
    for n in 0..ITEMS {
        expected.insert(producer.enqueue(json!(n)).await.unwrap());
    }

    let mut handles = Vec::new();
    for w in 0..WORKERS {
        let q = client(&store, &format!("worker-{w}"));
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(lease) = q.lease(Duration::from_secs(60), false, None).await.unwrap() {
                assert!(q.complete(&lease).await.unwrap());
                seen.push(lease.id());
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    let mut delivered = Vec::new();
    for handle in handles {
        delivered.extend(handle.await.unwrap());
    }

    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), ITEMS, "every item delivered exactly once");
    assert_eq!(unique, expected);
    assert!(producer.empty().await.unwrap());
}
