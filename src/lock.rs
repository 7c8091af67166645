// src/lock.rs
//! Advisory, TTL-bounded mutual exclusion on the shared store.
//!
//! A lock is a key holding an owner token. Acquire is one atomic
//! set-if-absent with expiry; release deletes the key only while it still
//! holds the caller's token. There is no fencing: once the TTL lapses another
//! owner may take the key while the first one is still working, so anything
//! guarded by these locks must tolerate running more than once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nanoid::nanoid;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;

use crate::error::{PantryError, Result};
use crate::utils::time::instant_after;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `true` only when this call created the lock.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Returns `true` when the lock was held by `token` and is now gone.
    /// A mismatched token leaves the lock untouched.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Unique owner token, prefixed with something that names the owner in logs.
pub fn new_lock_token(owner: &str) -> String {
    format!("{owner}:{}", nanoid!(12))
}

#[derive(Clone)]
pub struct RedisLock {
    conn: MultiplexedConnection,
}

impl RedisLock {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

/// Redis rejects PX values that overflow its clock, so very long TTLs are capped.
const MAX_PX_MILLIS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

fn px_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_PX_MILLIS)
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = px_millis(ttl);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// In-process lock with the same semantics. Clones share one keyspace, so
/// several pools in a test contend like separate processes.
#[derive(Clone, Default)]
pub struct MemoryLock {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner token, if the lock is held and not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(token, _)| token.clone())
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| PantryError::Internal("memory lock poisoned".into()))
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), (token.to_string(), instant_after(now, ttl)));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((owner, expires_at)) if owner == token && *expires_at > now => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_px_millis_bounds() {
        assert_eq!(px_millis(Duration::ZERO), 1);
        assert_eq!(px_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(px_millis(Duration::MAX), MAX_PX_MILLIS);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let lock = MemoryLock::new();
        assert!(lock.acquire("a", "t1", Duration::from_secs(30)).await.unwrap());
        assert!(!lock.acquire("a", "t2", Duration::from_secs(30)).await.unwrap());
        assert_eq!(lock.holder("a").as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_noop() {
        let lock = MemoryLock::new();
        lock.acquire("a", "t1", Duration::from_secs(30)).await.unwrap();

        assert!(!lock.release("a", "t2").await.unwrap());
        assert_eq!(lock.holder("a").as_deref(), Some("t1"));

        assert!(lock.release("a", "t1").await.unwrap());
        assert!(lock.holder("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_taken_over() {
        let lock = MemoryLock::new();
        lock.acquire("a", "t1", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(lock.acquire("a", "t2", Duration::from_secs(1)).await.unwrap());
        // The original owner must not be able to drop the new owner's lock.
        assert!(!lock.release("a", "t1").await.unwrap());
        assert_eq!(lock.holder("a").as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_clones_share_keyspace() {
        let lock = MemoryLock::new();
        let other_process = lock.clone();

        assert!(lock.acquire("job_lock:x", "t1", Duration::from_secs(30)).await.unwrap());
        assert!(!other_process
            .acquire("job_lock:x", "t2", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(other_process
            .acquire("scheduler_lock:x", "t2", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(new_lock_token("w"), new_lock_token("w"));
        assert!(new_lock_token("worker-1").starts_with("worker-1:"));
    }
}
