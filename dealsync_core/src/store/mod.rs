//! Tabular document storage: the grid model, the `DocumentStore` seam, and
//! two bundled backends (in-memory, JSON files on local disk).

pub mod grid;
pub mod json_file;
pub mod memory;
pub mod traits;

pub use grid::{CellPatch, GradientRule, Grid, HeaderStyle, TabFormatting};
pub use json_file::JsonDocumentStore;
pub use memory::MemoryDocumentStore;
pub use traits::{DocumentRef, DocumentStore};
