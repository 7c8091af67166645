//! Runs against a live Redis. `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

use std::time::Duration;

use pantry::lock::new_lock_token;
use pantry::{
    DistributedLock, Job, JobStatus, JobType, Payload, Queue, QueueConfig, RedisLock, RedisQueue,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn fresh_queue() -> (RedisQueue, String) {
    let name = format!("pantry:test:{}", nanoid::nanoid!(8));
    let queue = RedisQueue::connect(&QueueConfig::new(redis_url(), name.clone()))
        .await
        .expect("redis should be reachable");
    (queue, name)
}

async fn drop_keys(queue: &RedisQueue, name: &str) {
    let mut conn = queue.connection();
    let keys = [
        name.to_string(),
        format!("{name}:processing"),
        format!("{name}:scheduled"),
        format!("{name}:dead_letter"),
        format!("{name}:records"),
    ];
    let _: () = redis::cmd("DEL")
        .arg(&keys[..])
        .query_async(&mut conn)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_redis_priority_and_round_trip() {
    let (queue, name) = fresh_queue().await;

    let low = queue
        .enqueue(Job::new(JobType::ArchiveData, Payload::new()).with_priority(1))
        .await
        .unwrap();
    let high = queue
        .enqueue(Job::new(JobType::ArchiveData, Payload::new()).with_priority(9))
        .await
        .unwrap();

    let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.id, high.id);
    assert_eq!(second.id, low.id);
    assert_eq!(queue.stats().await.unwrap().processing, 2);

    queue.complete(&first).await.unwrap();
    queue.complete(&second).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().total(), 0);

    drop_keys(&queue, &name).await;
}

#[tokio::test]
#[ignore]
async fn test_redis_retry_then_dead_letter() {
    let (queue, name) = fresh_queue().await;
    let stored = queue
        .enqueue(
            Job::new(JobType::ScrapeFlyer, Payload::new())
                .with_max_attempts(2)
                .with_retry_delay(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let taken = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    let retried = queue.fail(&taken, "timeout").await.unwrap();
    assert_eq!(retried.status, JobStatus::Retrying);
    assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let again = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(again.id, stored.id);
    let dead = queue.fail(&again, "timeout").await.unwrap();
    assert_eq!(dead.status, JobStatus::Failed);

    let letters = queue.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 2);

    let revived = queue.retry_dead_letter(&stored.id).await.unwrap();
    assert_eq!(revived.attempts, 0);
    assert_eq!(queue.stats().await.unwrap().pending, 1);

    drop_keys(&queue, &name).await;
}

#[tokio::test]
#[ignore]
async fn test_redis_lock_compare_and_delete() {
    let (queue, _) = fresh_queue().await;
    let lock = RedisLock::new(queue.connection());
    let key = format!("job_lock:test:{}", nanoid::nanoid!(8));
    let mine = new_lock_token("a");
    let theirs = new_lock_token("b");

    assert!(lock.acquire(&key, &mine, Duration::from_secs(5)).await.unwrap());
    assert!(!lock.acquire(&key, &theirs, Duration::from_secs(5)).await.unwrap());
    assert!(!lock.release(&key, &theirs).await.unwrap());
    assert!(lock.release(&key, &mine).await.unwrap());
    assert!(lock.acquire(&key, &theirs, Duration::from_millis(200)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(lock.acquire(&key, &mine, Duration::from_secs(1)).await.unwrap());
    lock.release(&key, &mine).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_redis_stale_job_is_reclaimed_for_retry() {
    let (queue, name) = fresh_queue().await;
    queue
        .enqueue(Job::new(JobType::ExtractProducts, Payload::new()))
        .await
        .unwrap();
    let taken = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();

    // Backdate the processing entry past the threshold.
    let started = chrono::Utc::now() - chrono::Duration::minutes(31);
    let mut conn = queue.connection();
    let _: () = redis::cmd("ZADD")
        .arg(format!("{name}:processing"))
        .arg(started.timestamp_millis() as f64 / 1000.0)
        .arg(&taken.id)
        .query_async(&mut conn)
        .await
        .unwrap();

    let reclaimed = queue
        .cleanup_stale_jobs(Duration::from_secs(30 * 60))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let stored = queue.get_job(&taken.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Retrying);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error.as_deref(), Some("processing timeout"));
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.scheduled, 1);

    drop_keys(&queue, &name).await;
}

#[tokio::test]
#[ignore]
async fn test_redis_late_complete_after_reclaim() {
    let (queue, name) = fresh_queue().await;
    queue
        .enqueue(Job::new(JobType::ExtractProducts, Payload::new()).with_max_attempts(1))
        .await
        .unwrap();
    let taken = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();

    assert_eq!(queue.cleanup_stale_jobs(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
    queue.complete(&taken).await.unwrap();

    assert_eq!(queue.stats().await.unwrap().total(), 0);
    assert!(queue.dead_letters(10).await.unwrap().is_empty());
    assert!(queue.get_job(&taken.id).await.unwrap().is_none());

    drop_keys(&queue, &name).await;
}

#[tokio::test]
#[ignore]
async fn test_redis_fail_permanently_leaves_only_dead_letter() {
    let (queue, name) = fresh_queue().await;
    let pending = queue
        .enqueue(Job::new(JobType::Custom("resize_images".into()), Payload::new()))
        .await
        .unwrap();

    let dead = queue
        .fail_permanently(&pending, "unknown job type")
        .await
        .unwrap();
    assert_eq!(dead.status, JobStatus::Failed);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.scheduled, 0);
    assert_eq!(stats.dead_letter, 1);
    assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());

    drop_keys(&queue, &name).await;
}

#[tokio::test]
#[ignore]
async fn test_redis_due_job_promoted_once_under_contention() {
    let (queue, name) = fresh_queue().await;
    let other = RedisQueue::connect(&QueueConfig::new(redis_url(), name.clone()))
        .await
        .unwrap();
    queue
        .enqueue(
            Job::new(JobType::UpdatePrices, Payload::new()).scheduled_in(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (a, b) = tokio::join!(
        queue.dequeue(Duration::ZERO),
        other.dequeue(Duration::ZERO)
    );
    let taken: Vec<Job> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
    assert_eq!(taken.len(), 1);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.scheduled, 0);

    drop_keys(&queue, &name).await;
}
