//! Credential lookup for connectors.
//!
//! Secrets are read at call time, never cached in config structs, so a
//! rotated token is picked up by the next request.

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when the secret is not set.
    fn get(&self, name: &str) -> Result<Option<String>>;
}

/// Fetch a secret that must be present and non-empty.
pub fn require(store: &dyn SecretStore, name: &str) -> Result<String> {
    match store.get(name)? {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(Error::Config(format!("secret '{name}' is not set"))),
    }
}

/// Reads secrets from process environment variables of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        match std::env::var(name) {
            Ok(v) => Ok(Some(v)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(Error::Config(format!("secret '{name}': {e}"))),
        }
    }
}

/// In-memory secrets for tests and local wiring.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(name.into(), value.into());
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(name);
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let map = self
            .inner
            .read()
            .map_err(|_| Error::BackendMessage("secret store lock poisoned".to_string()))?;
        Ok(map.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_rejects_missing_and_blank() {
        let store = MemorySecretStore::new().with("TOKEN", "  abc ");
        assert_eq!(require(&store, "TOKEN").unwrap(), "abc");
        assert!(matches!(require(&store, "OTHER"), Err(Error::Config(_))));

        store.set("TOKEN", "   ");
        assert!(matches!(require(&store, "TOKEN"), Err(Error::Config(_))));
        store.remove("TOKEN");
        assert!(store.get("TOKEN").unwrap().is_none());
    }

    #[test]
    fn env_store_reports_unset_as_none() {
        let store = EnvSecretStore;
        assert!(store
            .get("DEALSYNC_SURELY_UNSET_SECRET_9f1c")
            .unwrap()
            .is_none());
    }
}
