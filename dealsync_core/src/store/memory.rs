use crate::store::grid::{CellPatch, Grid};
use crate::store::traits::{DocumentRef, DocumentStore};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

type Tabs = BTreeMap<String, Grid>;

/// In-memory DocumentStore for local development and tests.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Arc<Mutex<HashMap<DocumentRef, Tabs>>>,
    provisioned: Arc<Mutex<HashMap<String, DocumentRef>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty document under a known location.
    pub async fn insert_document(&self, doc: DocumentRef) {
        self.docs.lock().await.entry(doc).or_default();
    }

    /// Snapshot a tab (primarily for tests).
    pub async fn tab(&self, doc: &DocumentRef, tab: &str) -> Option<Grid> {
        self.docs
            .lock()
            .await
            .get(doc)
            .and_then(|tabs| tabs.get(tab))
            .cloned()
    }

    /// Mutate a tab in place, as a human editing the document would.
    pub async fn edit_tab<F>(&self, doc: &DocumentRef, tab: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Grid),
    {
        let mut docs = self.docs.lock().await;
        let grid = docs
            .get_mut(doc)
            .and_then(|tabs| tabs.get_mut(tab))
            .ok_or_else(|| Error::NotFound(format!("tab '{tab}' in document '{doc}'")))?;
        f(grid);
        Ok(())
    }

    pub async fn document_count(&self) -> usize {
        self.docs.lock().await.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn provision(&self, key: &str, title: &str) -> Result<DocumentRef> {
        if key.trim().is_empty() || title.trim().is_empty() {
            return Err(Error::InvalidInput("provision key and title must be non-empty".to_string()));
        }
        let mut provisioned = self.provisioned.lock().await;
        let mut docs = self.docs.lock().await;
        if let Some(doc) = provisioned.get(key).filter(|d| docs.contains_key(*d)) {
            return Ok(doc.clone());
        }
        let doc = DocumentRef::new(format!("mem-{}", Uuid::new_v4()));
        docs.insert(doc.clone(), Tabs::new());
        provisioned.insert(key.to_string(), doc.clone());
        Ok(doc)
    }

    async fn provisioned(&self, key: &str) -> Result<Option<DocumentRef>> {
        let provisioned = self.provisioned.lock().await;
        let docs = self.docs.lock().await;
        Ok(provisioned.get(key).filter(|d| docs.contains_key(*d)).cloned())
    }

    async fn read_tab(&self, doc: &DocumentRef, tab: &str) -> Result<Option<Grid>> {
        let docs = self.docs.lock().await;
        let tabs = docs
            .get(doc)
            .ok_or_else(|| Error::NotFound(format!("document '{doc}'")))?;
        Ok(tabs.get(tab).cloned())
    }

    async fn replace_tab(&self, doc: &DocumentRef, tab: &str, grid: Grid) -> Result<()> {
        let mut docs = self.docs.lock().await;
        let tabs = docs
            .get_mut(doc)
            .ok_or_else(|| Error::NotFound(format!("document '{doc}'")))?;
        tabs.insert(tab.to_string(), grid);
        Ok(())
    }

    async fn patch_cells(&self, doc: &DocumentRef, tab: &str, patches: &[CellPatch]) -> Result<()> {
        let mut docs = self.docs.lock().await;
        let grid = docs
            .get_mut(doc)
            .ok_or_else(|| Error::NotFound(format!("document '{doc}'")))?
            .get_mut(tab)
            .ok_or_else(|| Error::NotFound(format!("tab '{tab}' in document '{doc}'")))?;
        grid.apply(patches)
    }
}
