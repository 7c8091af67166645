use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pantry::lock::new_lock_token;
use pantry::{DistributedLock, MemoryLock};

#[tokio::test]
async fn test_contended_acquire_has_single_winner() {
    let lock = MemoryLock::new();
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let lock = lock.clone();
            let winners = winners.clone();
            tokio::spawn(async move {
                let token = new_lock_token(&format!("worker-{i}"));
                if lock
                    .acquire("job_lock:contended", &token, Duration::from_secs(30))
                    .await
                    .unwrap()
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!(lock.holder("job_lock:contended").is_some());
}

#[tokio::test]
async fn test_release_lets_next_owner_in() {
    let lock = MemoryLock::new();
    let first = new_lock_token("a");
    let second = new_lock_token("b");

    assert!(lock.acquire("k", &first, Duration::from_secs(30)).await.unwrap());
    assert!(!lock.acquire("k", &second, Duration::from_secs(30)).await.unwrap());
    assert!(lock.release("k", &first).await.unwrap());
    assert!(lock.acquire("k", &second, Duration::from_secs(30)).await.unwrap());
}

#[tokio::test]
async fn test_release_of_missing_lock_is_false() {
    let lock = MemoryLock::new();
    assert!(!lock.release("never-taken", "t").await.unwrap());
}

#[tokio::test]
async fn test_huge_ttl_is_accepted() {
    let lock = MemoryLock::new();
    assert!(lock.acquire("k", "t1", Duration::MAX).await.unwrap());
    assert!(!lock.acquire("k", "t2", Duration::from_secs(1)).await.unwrap());
    assert!(lock.release("k", "t1").await.unwrap());
}
