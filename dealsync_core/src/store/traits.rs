use crate::store::grid::{CellPatch, Grid};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a tabular document (spreadsheet id, file stem, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(String);

impl DocumentRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tabular document storage for entity and aggregate stores.
///
/// Provisioning, sharing and cosmetic sizing belong to the backend; the
/// engine only reads whole tabs, replaces whole tabs, and patches cells.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an empty document for `key` (`owner:<key>`, `group:<name>`),
    /// or return the one already created for it. The key to location
    /// mapping is durable for as long as the backend's data is.
    async fn provision(&self, key: &str, title: &str) -> Result<DocumentRef>;

    /// Location earlier provisioned for `key`, if it still exists.
    async fn provisioned(&self, key: &str) -> Result<Option<DocumentRef>>;

    /// Read a tab. Unknown document is `Error::NotFound`; unknown tab is `Ok(None)`.
    async fn read_tab(&self, doc: &DocumentRef, tab: &str) -> Result<Option<Grid>>;

    /// Replace a tab's entire content and formatting, creating the tab if needed.
    async fn replace_tab(&self, doc: &DocumentRef, tab: &str, grid: Grid) -> Result<()>;

    /// Apply cell patches to an existing tab.
    async fn patch_cells(&self, doc: &DocumentRef, tab: &str, patches: &[CellPatch]) -> Result<()>;
}
