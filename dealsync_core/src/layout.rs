//! Column layouts for entity and aggregate tabs.
//!
//! Both layouts are derived from the same dataset definition; the aggregate
//! layout additionally carries the owner column. Moving per-cell state
//! (colors) between the two goes through `ColumnProjection`, which matches
//! columns by key, so adding or reordering columns on either side cannot
//! shift colors onto the wrong cells.

use crate::config::{AnnotationSpec, DatasetSpec, PropertyKind, SyncConfig};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    Owner,
    Record,
    Score,
    Annotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    Owner,
    RecordId,
    Property { name: String, kind: PropertyKind },
    Note { slot: String },
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub key: String,
    pub header: String,
    pub family: ColumnFamily,
    pub source: ColumnSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Entity,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    kind: LayoutKind,
    columns: Vec<Column>,
}

impl Layout {
    pub fn entity(cfg: &SyncConfig, dataset: &DatasetSpec) -> Self {
        Self {
            kind: LayoutKind::Entity,
            columns: base_columns(&cfg.id_header, dataset, &cfg.annotations),
        }
    }

    pub fn aggregate(cfg: &SyncConfig, dataset: &DatasetSpec) -> Self {
        let mut columns = Vec::with_capacity(dataset.properties.len() + 4);
        columns.push(Column {
            key: "owner".to_string(),
            header: cfg.owner_header.clone(),
            family: ColumnFamily::Owner,
            source: ColumnSource::Owner,
        });
        columns.extend(base_columns(&cfg.id_header, dataset, &cfg.annotations));
        Self {
            kind: LayoutKind::Aggregate,
            columns,
        }
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.header.clone()).collect()
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.key == key)
    }

    pub fn id_index(&self) -> usize {
        self.columns
            .iter()
            .position(|c| c.source == ColumnSource::RecordId)
            .unwrap_or(0)
    }

    pub fn score_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.family == ColumnFamily::Score)
            .map(|(i, _)| i)
            .collect()
    }

    /// Locate this layout's key columns inside a stored header row.
    ///
    /// Columns are matched by header text so a tab whose columns drifted
    /// since it was written is still read correctly. An empty header (tab
    /// never written) falls back to layout positions. A column missing from
    /// a non-empty header resolves to `None`.
    pub fn resolve(&self, stored_header: &[String], name_property: &str) -> ResolvedColumns {
        let by_header: HashMap<&str, usize> = stored_header
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim(), i))
            .collect();
        let locate = |col_idx: usize| -> Option<usize> {
            if stored_header.is_empty() {
                Some(col_idx)
            } else {
                by_header
                    .get(self.columns[col_idx].header.trim())
                    .copied()
            }
        };

        let mut out = ResolvedColumns::default();
        for (i, col) in self.columns.iter().enumerate() {
            match &col.source {
                ColumnSource::RecordId => out.id = locate(i),
                ColumnSource::Flag => out.flag = locate(i),
                ColumnSource::Note { slot } => {
                    out.notes.insert(slot.clone(), locate(i));
                }
                ColumnSource::Property { name, .. } if name == name_property => {
                    out.name = locate(i)
                }
                _ => {}
            }
        }
        out
    }
}

/// Positions of key columns in a stored grid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub id: Option<usize>,
    pub name: Option<usize>,
    pub flag: Option<usize>,
    pub notes: BTreeMap<String, Option<usize>>,
}

fn base_columns(id_header: &str, dataset: &DatasetSpec, annotations: &AnnotationSpec) -> Vec<Column> {
    let mut columns = Vec::with_capacity(dataset.properties.len() + 3);
    columns.push(Column {
        key: "record_id".to_string(),
        header: id_header.to_string(),
        family: ColumnFamily::Record,
        source: ColumnSource::RecordId,
    });
    // Record fields first, score fields after, so shading lands on one block.
    let (scores, plain): (Vec<_>, Vec<_>) = dataset.properties.iter().partition(|p| p.score);
    for p in plain.into_iter().chain(scores) {
        columns.push(Column {
            key: format!("prop:{}", p.name),
            header: p.header.clone(),
            family: if p.score {
                ColumnFamily::Score
            } else {
                ColumnFamily::Record
            },
            source: ColumnSource::Property {
                name: p.name.clone(),
                kind: p.kind,
            },
        });
    }
    for slot in &annotations.note_slots {
        columns.push(Column {
            key: format!("note:{slot}"),
            header: slot.clone(),
            family: ColumnFamily::Annotation,
            source: ColumnSource::Note { slot: slot.clone() },
        });
    }
    columns.push(Column {
        key: "flag".to_string(),
        header: annotations.flag_header.clone(),
        family: ColumnFamily::Annotation,
        source: ColumnSource::Flag,
    });
    columns
}

/// Index mapping from one layout's columns onto another's, by column key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProjection {
    /// For each target column, the source column it takes its value from.
    sources: Vec<Option<usize>>,
}

impl ColumnProjection {
    pub fn between(from: &Layout, to: &Layout) -> Self {
        let sources = to
            .columns
            .iter()
            .map(|c| from.index_of(&c.key))
            .collect();
        Self { sources }
    }

    /// Map a stored header row onto `layout` by header text. An empty header
    /// maps positionally.
    pub fn from_stored(stored_header: &[String], layout: &Layout) -> Self {
        if stored_header.is_empty() {
            return Self {
                sources: (0..layout.width()).map(Some).collect(),
            };
        }
        let sources = layout
            .columns
            .iter()
            .map(|c| {
                stored_header
                    .iter()
                    .position(|h| h.trim() == c.header.trim())
            })
            .collect();
        Self { sources }
    }

    pub fn target_width(&self) -> usize {
        self.sources.len()
    }

    /// Source index feeding target column `target`, if any.
    pub fn source_of(&self, target: usize) -> Option<usize> {
        self.sources.get(target).copied().flatten()
    }

    /// Project a per-column array. Target columns with no counterpart, or
    /// whose source index is past the end of `values`, get `fill`.
    pub fn apply<T: Clone>(&self, values: &[T], fill: &T) -> Vec<T> {
        self.sources
            .iter()
            .map(|src| match src {
                Some(i) => values.get(*i).cloned().unwrap_or_else(|| fill.clone()),
                None => fill.clone(),
            })
            .collect()
    }
}

/// Pad with `fill` or truncate so the array has exactly `width` entries.
pub fn fit_width<T: Clone>(values: &[T], width: usize, fill: &T) -> Vec<T> {
    let mut out: Vec<T> = values.iter().take(width).cloned().collect();
    out.resize(width, fill.clone());
    out
}
