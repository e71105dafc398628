//! `SyncLock` backends shared across processes.
//!
//! The in-process `MemoryLock` lives in `dealsync_core::lock`; these
//! backends let several schedulers or CLI invocations contend for the same
//! named lock.

#[cfg(feature = "redis-lock")]
pub mod redis;
