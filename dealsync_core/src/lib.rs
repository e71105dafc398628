//! dealsync core: keeps per-owner and per-group tabular stores in sync with
//! a CRM while preserving the annotations people type into them.

pub mod adapters;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod models;
pub mod preserve;
pub mod propagation;
pub mod records;
pub mod secrets;
pub mod store;

#[cfg(test)]
mod test_support;

pub use adapters::{AggregateStoreAdapter, EntityStoreAdapter, WriteSummary};
pub use config::{RuntimeConfig, SyncConfig};
pub use directory::{DirectoryConfig, DirectoryIndex, GroupView, OwnerEntry};
pub use engine::{CycleReport, CycleStatus, Direction, PropagationReport, SyncEngine};
pub use error::{Error, Result};
pub use layout::{ColumnProjection, Layout};
pub use lock::{with_lock, FileLock, LockLease, LockOutcome, MemoryLock, SyncLock};
pub use models::{Actor, Annotation, Color, Flag, OwnerRef, Record, RecordId, Row};
pub use propagation::{PropagationStats, Propagator};
pub use records::{RecordPage, RecordQuery, RecordSource};
pub use secrets::{EnvSecretStore, MemorySecretStore, SecretStore};
pub use store::{DocumentRef, DocumentStore, Grid, JsonDocumentStore, MemoryDocumentStore};
