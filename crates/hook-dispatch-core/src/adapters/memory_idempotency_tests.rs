use super::*;
use crate::idempotency::{Admission, IdempotencyGuard};
use crate::DeliveryId;
use std::sync::Arc;

fn guard(store: Arc<InMemoryIdempotencyStore>) -> IdempotencyGuard {
    IdempotencyGuard::new(store, Duration::hours(24))
}

#[tokio::test]
async fn test_second_admission_is_duplicate() {
    let guard = guard(Arc::new(InMemoryIdempotencyStore::new()));
    let id = DeliveryId::new("delivery-1").unwrap();

    assert_eq!(guard.try_admit(&id).await.unwrap(), Admission::Admitted);
    assert_eq!(guard.try_admit(&id).await.unwrap(), Admission::Duplicate);
    assert_eq!(guard.try_admit(&id).await.unwrap(), Admission::Duplicate);
}

#[tokio::test]
async fn test_key_is_admitted_again_after_ttl() {
    let guard = guard(Arc::new(InMemoryIdempotencyStore::new()));
    let id = DeliveryId::new("delivery-1").unwrap();
    let now = Utc::now();

    assert_eq!(guard.try_admit_at(&id, now).await.unwrap(), Admission::Admitted);
    assert_eq!(
        guard
            .try_admit_at(&id, now + Duration::hours(23))
            .await
            .unwrap(),
        Admission::Duplicate
    );
    assert_eq!(
        guard
            .try_admit_at(&id, now + Duration::hours(24))
            .await
            .unwrap(),
        Admission::Admitted
    );
}

#[tokio::test]
async fn test_release_allows_readmission() {
    let guard = guard(Arc::new(InMemoryIdempotencyStore::new()));
    let id = DeliveryId::new("delivery-1").unwrap();

    assert_eq!(guard.try_admit(&id).await.unwrap(), Admission::Admitted);
    guard.release(&id).await.unwrap();
    assert_eq!(guard.try_admit(&id).await.unwrap(), Admission::Admitted);
}

#[tokio::test]
async fn test_distinct_keys_are_independent() {
    let guard = guard(Arc::new(InMemoryIdempotencyStore::new()));

    for i in 0..10 {
        let id = DeliveryId::new(format!("delivery-{}", i)).unwrap();
        assert_eq!(guard.try_admit(&id).await.unwrap(), Admission::Admitted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_admissions_admit_exactly_once() {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let guard = guard(store);
    let id = DeliveryId::new("raced-delivery").unwrap();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let guard = guard.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move { guard.try_admit(&id).await }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == Admission::Admitted {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

#[test]
fn test_prune_expired_removes_only_expired_records() {
    let store = InMemoryIdempotencyStore::new();
    let now = Utc::now();

    tokio_test::block_on(async {
        store.try_admit("old", Duration::seconds(10), now).await.unwrap();
        store.try_admit("new", Duration::hours(1), now).await.unwrap();
    });

    assert_eq!(store.prune_expired(now + Duration::seconds(10)).unwrap(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_admission_prunes_expired_records_without_threshold() {
    let store = InMemoryIdempotencyStore::new();
    let now = Utc::now();

    for i in 0..5 {
        store
            .try_admit(&format!("short-{}", i), Duration::seconds(5), now)
            .await
            .unwrap();
    }
    store.try_admit("long", Duration::hours(1), now).await.unwrap();
    assert_eq!(store.len(), 6);

    store
        .try_admit("later", Duration::hours(1), now + Duration::seconds(5))
        .await
        .unwrap();

    assert_eq!(store.len(), 2);
    assert!(!store
        .try_admit("long", Duration::hours(1), now + Duration::seconds(5))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_release_removes_record_from_expiry_index() {
    let store = InMemoryIdempotencyStore::new();
    let now = Utc::now();

    store.try_admit("k", Duration::seconds(5), now).await.unwrap();
    store.release("k").await.unwrap();
    store.try_admit("k", Duration::hours(1), now).await.unwrap();

    // Only the fresh record remains; the released one must not prune it
    assert_eq!(store.prune_expired(now + Duration::seconds(5)).unwrap(), 0);
    assert!(!store
        .try_admit("k", Duration::hours(1), now + Duration::seconds(5))
        .await
        .unwrap());
}
