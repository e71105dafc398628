//! Backends for dealsync: CRM record sources and cross-process lock stores.
//!
//! Each backend is opt-in behind a cargo feature.

pub mod connectors;
pub mod lock_backends;
