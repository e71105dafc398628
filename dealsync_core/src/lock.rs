//! Named mutual-exclusion lock guarding cycles and interactive operations.
//!
//! Contention is an expected outcome, not an error: callers get
//! `LockOutcome::Busy` and decide whether to report or retry later.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{File, TryLockError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Acquired(T),
    Busy { lock: String, waited: Duration },
}

impl<T> LockOutcome<T> {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn acquired(self) -> Option<T> {
        match self {
            Self::Acquired(v) => Some(v),
            Self::Busy { .. } => None,
        }
    }
}

/// Proof of holding a named lock. Dropping a local or file lease releases
/// it; remote leases must go back through `SyncLock::release` (or expire).
#[derive(Debug)]
pub struct LockLease {
    name: String,
    token: String,
    _guard: Option<OwnedMutexGuard<()>>,
    file: Option<File>,
}

impl LockLease {
    pub fn local(name: impl Into<String>, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            _guard: Some(guard),
            file: None,
        }
    }

    pub fn remote(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            _guard: None,
            file: None,
        }
    }

    /// Lease on an OS file lock; the lock lives as long as the handle.
    pub fn file(name: impl Into<String>, file: File) -> Self {
        Self {
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            _guard: None,
            file: Some(file),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
pub trait SyncLock: Send + Sync {
    fn id(&self) -> &'static str;

    /// Wait up to `wait` for the lock. `Ok(None)` means it stayed held.
    async fn acquire(&self, name: &str, wait: Duration) -> Result<Option<LockLease>>;

    async fn release(&self, lease: LockLease) -> Result<()>;
}

/// Process-local lock: one tokio mutex per name.
#[derive(Clone, Default)]
pub struct MemoryLock {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl SyncLock for MemoryLock {
    fn id(&self) -> &'static str {
        "memory"
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn acquire(&self, name: &str, wait: Duration) -> Result<Option<LockLease>> {
        let slot = self.slot(name).await;
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => Ok(Some(LockLease::local(name, guard))),
            Err(_) => Ok(None),
        }
    }

    async fn release(&self, lease: LockLease) -> Result<()> {
        drop(lease);
        Ok(())
    }
}

/// Lock shared by every process on one host: an exclusive OS lock on
/// `{dir}/{name}.lock`. The OS drops it when the holder exits, so a crashed
/// run never blocks the next one.
#[derive(Debug, Clone)]
pub struct FileLock {
    dir: PathBuf,
    poll: Duration,
}

impl FileLock {
    #[tracing::instrument(level = "debug")]
    pub async fn open(dir: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::backend(format!("create {}", dir.display()), e))?;
        Ok(Self {
            dir,
            poll: Duration::from_millis(50),
        })
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "lock name '{name}' must be [A-Za-z0-9_-]+"
            )));
        }
        Ok(self.dir.join(format!("{name}.lock")))
    }
}

#[async_trait]
impl SyncLock for FileLock {
    fn id(&self) -> &'static str {
        "file"
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn acquire(&self, name: &str, wait: Duration) -> Result<Option<LockLease>> {
        let path = self.path_for(name)?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| Error::backend(format!("open {}", path.display()), e))?
            .into_std()
            .await;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Some(LockLease::file(name, file))),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => {
                    return Err(Error::backend(format!("lock {}", path.display()), e));
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }
    }

    async fn release(&self, mut lease: LockLease) -> Result<()> {
        match lease.file.take() {
            Some(file) => file
                .unlock()
                .map_err(|e| Error::backend(format!("unlock {}", lease.name), e)),
            None => Err(Error::InvalidInput(format!(
                "lease on '{}' was not issued by a file lock",
                lease.name
            ))),
        }
    }
}

/// Run `body` while holding `name`. The lease is released after the body
/// finishes, whatever its result. A release failure is logged; the body's
/// result is returned unchanged.
#[tracing::instrument(level = "debug", skip(lock, body), fields(backend = lock.id()))]
pub async fn with_lock<T, F, Fut>(
    lock: &dyn SyncLock,
    name: &str,
    wait: Duration,
    body: F,
) -> Result<LockOutcome<T>>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let started = Instant::now();
    let Some(lease) = lock.acquire(name, wait).await? else {
        let waited = started.elapsed();
        tracing::warn!(lock = name, waited_ms = waited.as_millis() as u64, "lock busy; skipping run");
        return Ok(LockOutcome::Busy {
            lock: name.to_string(),
            waited,
        });
    };

    let result = body().await;
    if let Err(e) = lock.release(lease).await {
        tracing::error!(lock = name, error = %e, "lock release failed; relying on expiry");
    }
    result.map(LockOutcome::Acquired)
}
