//! Redis-backed named lock.
//!
//! Acquire is `SET key token NX PX ttl`, polled until the wait deadline.
//! Release deletes the key only if it still holds our token, so a holder
//! whose lease expired cannot free somebody else's lock. The TTL bounds how
//! long a crashed holder blocks others.

use async_trait::async_trait;
use dealsync_core::lock::{LockLease, SyncLock};
use dealsync_core::{Error, Result};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub const DEFAULT_TTL: Duration = Duration::from_secs(360);
const DEFAULT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct RedisLock {
    manager: ConnectionManager,
    prefix: Option<String>,
    ttl: Duration,
    poll: Duration,
}

impl RedisLock {
    #[tracing::instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, prefix: Option<String>) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::backend("redis client open", e))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::backend("redis connect", e))?;
        Ok(Self {
            manager,
            prefix,
            ttl: DEFAULT_TTL,
            poll: DEFAULT_POLL,
        })
    }

    /// Lease lifetime; should exceed the longest expected cycle.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn key(&self, name: &str) -> Result<String> {
        lock_key(self.prefix.as_deref(), name)
    }
}

fn lock_key(prefix: Option<&str>, name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("lock name is empty".to_string()));
    }
    if name.contains(' ') {
        return Err(Error::InvalidInput(
            "lock name must not contain spaces".to_string(),
        ));
    }
    let mut out = String::new();
    if let Some(p) = prefix.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str(p);
        out.push(':');
    }
    out.push_str("lock:");
    out.push_str(name);
    Ok(out)
}

#[async_trait]
impl SyncLock for RedisLock {
    fn id(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn acquire(&self, name: &str, wait: Duration) -> Result<Option<LockLease>> {
        let key = self.key(name)?;
        let token = Uuid::new_v4().to_string();
        let ttl_ms = self.ttl.as_millis().max(1) as u64;
        let deadline = Instant::now() + wait;
        let mut conn = self.manager.clone();
        loop {
            let set: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::backend("redis set nx", e))?;
            if set.is_some() {
                return Ok(Some(LockLease::remote(name, token)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }
    }

    #[tracing::instrument(level = "debug", skip(self, lease), fields(lock = lease.name()))]
    async fn release(&self, lease: LockLease) -> Result<()> {
        let key = self.key(lease.name())?;
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis release", e))?;
        if deleted == 0 {
            tracing::warn!(lock = lease.name(), "lease had already expired or changed hands");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealsync_core::lock::{with_lock, LockOutcome};

    /// Set `DEALSYNC_TEST_REDIS_URL` (e.g. `redis://127.0.0.1:6379/`) to run.
    fn redis_url() -> Option<String> {
        std::env::var("DEALSYNC_TEST_REDIS_URL").ok()
    }

    #[test]
    fn keys_are_prefixed_and_validated() {
        assert_eq!(lock_key(Some("prod"), "dealsync").unwrap(), "prod:lock:dealsync");
        assert_eq!(lock_key(Some("  "), "dealsync").unwrap(), "lock:dealsync");
        assert_eq!(lock_key(None, "dealsync").unwrap(), "lock:dealsync");
        assert!(lock_key(None, "deal sync").is_err());
        assert!(lock_key(None, "").is_err());
    }

    #[tokio::test]
    async fn contended_acquire_waits_then_gives_up() {
        let Some(url) = redis_url() else {
            eprintln!("skipping: DEALSYNC_TEST_REDIS_URL not set");
            return;
        };
        let prefix = Some(format!("dealsync-test-{}", Uuid::new_v4().simple()));
        let a = RedisLock::connect(&url, prefix.clone()).await.unwrap();
        let b = RedisLock::connect(&url, prefix)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));

        let held = a
            .acquire("cycle", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert!(b
            .acquire("cycle", Duration::from_millis(120))
            .await
            .unwrap()
            .is_none());

        a.release(held).await.unwrap();
        let out = with_lock(&b, "cycle", Duration::from_millis(200), || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(out, LockOutcome::Acquired(1));
    }

    #[tokio::test]
    async fn stale_lease_cannot_release_new_holder() {
        let Some(url) = redis_url() else {
            eprintln!("skipping: DEALSYNC_TEST_REDIS_URL not set");
            return;
        };
        let prefix = Some(format!("dealsync-test-{}", Uuid::new_v4().simple()));
        let lock = RedisLock::connect(&url, prefix)
            .await
            .unwrap()
            .with_ttl(Duration::from_millis(300));

        let stale = lock
            .acquire("cycle", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let fresh = lock
            .acquire("cycle", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        lock.release(stale).await.unwrap();
        assert!(lock
            .acquire("cycle", Duration::from_millis(30))
            .await
            .unwrap()
            .is_none());
        lock.release(fresh).await.unwrap();
    }
}
