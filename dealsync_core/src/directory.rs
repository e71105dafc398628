//! Owner/group directory: who owns which entity store, which group each
//! owner belongs to, and where each group's aggregate store lives.
//!
//! The directory is read-only input. `DirectoryIndex` is built once per
//! cycle so lookups are hash hits rather than list scans.

use crate::models::{Actor, OwnerRef};
use crate::store::DocumentRef;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub crm_owner_id: Option<String>,
    /// Entity store location. Missing means "not provisioned yet".
    #[serde(default)]
    pub store: Option<DocumentRef>,
    #[serde(default)]
    pub group: Option<String>,
}

impl OwnerEntry {
    pub fn owner_ref(&self) -> OwnerRef {
        OwnerRef {
            name: self.name.clone(),
            email: self.email.clone(),
            crm_owner_id: self.crm_owner_id.clone(),
        }
    }

    /// Stable key for logs and reports.
    pub fn key(&self) -> String {
        match &self.email {
            Some(email) if !email.trim().is_empty() => email.trim().to_ascii_lowercase(),
            _ => self.name.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default)]
    pub store: Option<DocumentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub owners: Vec<OwnerEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    /// Emails allowed to run interactive commands. Empty means everyone.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl DirectoryConfig {
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| Error::Config(format!("parse directory: {e}")))
    }
}

/// A group with its resolved members, in directory order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupView {
    pub name: String,
    pub store: Option<DocumentRef>,
    pub members: Vec<OwnerEntry>,
}

/// Hash-indexed view of a `DirectoryConfig`.
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    owners: Vec<OwnerEntry>,
    owner_by_key: HashMap<String, usize>,
    groups: BTreeMap<String, GroupView>,
    allowlist: HashSet<String>,
}

impl DirectoryIndex {
    #[tracing::instrument(level = "debug", skip(directory))]
    pub fn build(directory: &DirectoryConfig) -> Self {
        let mut owners = Vec::with_capacity(directory.owners.len());
        let mut owner_by_key = HashMap::with_capacity(directory.owners.len());
        for owner in &directory.owners {
            let key = owner.key();
            if owner_by_key.contains_key(&key) {
                tracing::warn!(owner = %key, "duplicate owner in directory; keeping first entry");
                continue;
            }
            owner_by_key.insert(key, owners.len());
            owners.push(owner.clone());
        }

        let mut groups: BTreeMap<String, GroupView> = BTreeMap::new();
        for g in &directory.groups {
            groups.entry(g.name.clone()).or_insert_with(|| GroupView {
                name: g.name.clone(),
                store: g.store.clone(),
                members: Vec::new(),
            });
        }
        for owner in &owners {
            let Some(group) = owner.group.as_deref() else {
                continue;
            };
            match groups.get_mut(group) {
                Some(view) => view.members.push(owner.clone()),
                None => {
                    // Membership in an unknown group is surfaced when the group is processed.
                    groups.insert(
                        group.to_string(),
                        GroupView {
                            name: group.to_string(),
                            store: None,
                            members: vec![owner.clone()],
                        },
                    );
                }
            }
        }

        let allowlist = directory
            .allowlist
            .iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        Self {
            owners,
            owner_by_key,
            groups,
            allowlist,
        }
    }

    pub fn owners(&self) -> &[OwnerEntry] {
        &self.owners
    }

    pub fn owner(&self, key: &str) -> Option<&OwnerEntry> {
        self.owner_by_key
            .get(&key.trim().to_ascii_lowercase())
            .or_else(|| self.owner_by_key.get(key.trim()))
            .map(|&i| &self.owners[i])
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupView> {
        self.groups.values()
    }

    pub fn group(&self, name: &str) -> Result<&GroupView> {
        self.groups
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("group '{name}' not in directory")))
    }

    /// Interactive commands are limited to allowlisted users when an allowlist exists.
    pub fn authorize(&self, actor: &Actor) -> Result<()> {
        match actor {
            Actor::System { .. } => Ok(()),
            Actor::User { .. } if self.allowlist.is_empty() => Ok(()),
            Actor::User { email } => {
                if self.allowlist.contains(&email.trim().to_ascii_lowercase()) {
                    Ok(())
                } else {
                    Err(Error::Unauthorized(format!(
                        "{email} is not allowed to run this command"
                    )))
                }
            }
        }
    }
}
