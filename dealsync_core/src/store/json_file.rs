//! DocumentStore backed by one JSON file per document in a local directory.
//!
//! File layout: `{root}/{document}.json` holding `{ "tab name": Grid, ... }`,
//! plus `{root}/.provisioned.json` mapping provision keys to documents.
//! Writes go to a temp file and are renamed into place. Registry updates are
//! serialized within a process; across processes they rely on the caller
//! holding the sync lock.

use crate::store::grid::{CellPatch, Grid};
use crate::store::traits::{DocumentRef, DocumentStore};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

type Tabs = BTreeMap<String, Grid>;
type Registry = BTreeMap<String, DocumentRef>;

const REGISTRY_FILE: &str = ".provisioned.json";

#[derive(Debug, Clone)]
pub struct JsonDocumentStore {
    root: PathBuf,
    registry: Arc<Mutex<()>>,
}

impl JsonDocumentStore {
    #[tracing::instrument(level = "debug")]
    pub async fn open(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::backend(format!("create {}", root.display()), e))?;
        Ok(Self {
            root,
            registry: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, doc: &DocumentRef) -> Result<PathBuf> {
        let id = doc.as_str();
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "document id '{id}' must be [A-Za-z0-9_-]+"
            )));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn load(&self, doc: &DocumentRef) -> Result<Tabs> {
        let path = self.path_for(doc)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("document '{doc}'")));
            }
            Err(e) => return Err(Error::backend(format!("read {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::backend(format!("parse {}", path.display()), e))
    }

    async fn save(&self, doc: &DocumentRef, tabs: &Tabs) -> Result<()> {
        let path = self.path_for(doc)?;
        let bytes = serde_json::to_vec_pretty(tabs)
            .map_err(|e| Error::backend("serialize document", e))?;
        write_atomic(&path, &bytes).await
    }

    async fn exists(&self, doc: &DocumentRef) -> Result<bool> {
        let path = self.path_for(doc)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::backend(format!("stat {}", path.display()), e))
    }

    async fn load_registry(&self) -> Result<Registry> {
        let path = self.root.join(REGISTRY_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::backend(format!("parse {}", path.display()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Registry::new()),
            Err(e) => Err(Error::backend(format!("read {}", path.display()), e)),
        }
    }

    async fn save_registry(&self, registry: &Registry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(registry)
            .map_err(|e| Error::backend("serialize provision registry", e))?;
        write_atomic(&self.root.join(REGISTRY_FILE), &bytes).await
    }

    async fn registered(&self, registry: &Registry, key: &str) -> Result<Option<DocumentRef>> {
        let Some(doc) = registry.get(key) else {
            return Ok(None);
        };
        if self.exists(doc).await? {
            return Ok(Some(doc.clone()));
        }
        tracing::warn!(key, document = %doc, "provisioned document is gone; will provision again");
        Ok(None)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| Error::backend(format!("write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::backend(format!("rename {}", path.display()), e))
}

fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

#[async_trait]
impl DocumentStore for JsonDocumentStore {
    #[tracing::instrument(level = "info", skip(self))]
    async fn provision(&self, key: &str, title: &str) -> Result<DocumentRef> {
        let base = slug(title);
        if base.is_empty() || key.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "cannot provision '{key}' titled '{title}'"
            )));
        }
        let _guard = self.registry.lock().await;
        let mut registry = self.load_registry().await?;
        if let Some(doc) = self.registered(&registry, key).await? {
            return Ok(doc);
        }
        let suffix = Uuid::new_v4().simple().to_string();
        let doc = DocumentRef::new(format!("{base}-{}", &suffix[..8]));
        self.save(&doc, &Tabs::new()).await?;
        registry.insert(key.to_string(), doc.clone());
        self.save_registry(&registry).await?;
        Ok(doc)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn provisioned(&self, key: &str) -> Result<Option<DocumentRef>> {
        let _guard = self.registry.lock().await;
        let registry = self.load_registry().await?;
        self.registered(&registry, key).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn read_tab(&self, doc: &DocumentRef, tab: &str) -> Result<Option<Grid>> {
        let mut tabs = self.load(doc).await?;
        Ok(tabs.remove(tab))
    }

    #[tracing::instrument(level = "debug", skip(self, grid))]
    async fn replace_tab(&self, doc: &DocumentRef, tab: &str, grid: Grid) -> Result<()> {
        let mut tabs = self.load(doc).await?;
        tabs.insert(tab.to_string(), grid);
        self.save(doc, &tabs).await
    }

    #[tracing::instrument(level = "debug", skip(self, patches), fields(patches = patches.len()))]
    async fn patch_cells(&self, doc: &DocumentRef, tab: &str, patches: &[CellPatch]) -> Result<()> {
        let mut tabs = self.load(doc).await?;
        let grid = tabs
            .get_mut(tab)
            .ok_or_else(|| Error::NotFound(format!("tab '{tab}' in document '{doc}'")))?;
        grid.apply(patches)?;
        self.save(doc, &tabs).await
    }
}
