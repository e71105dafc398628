//! Cross-store propagation between a group's entity stores and its
//! aggregate store.
//!
//! Notes flow entity -> aggregate. Flags and row colors flow
//! aggregate -> entity. Rows are matched by record id; only cells whose
//! value differs are patched, so a second run with no edits writes nothing.

use crate::config::DatasetSpec;
use crate::directory::GroupView;
use crate::layout::{ColumnProjection, Layout};
use crate::models::{Color, RecordId};
use crate::store::{CellPatch, DocumentRef, DocumentStore, Grid};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropagationStats {
    /// Documents that received at least one patch.
    pub stores_touched: usize,
    pub cells_patched: usize,
    pub rows_matched: usize,
    /// Source rows whose record id is absent from the target.
    pub rows_unmatched: usize,
    /// Rows matched through the deprecated display-name fallback.
    pub name_matched: usize,
    /// Tabs that do not exist yet (never refreshed).
    pub missing_tabs: usize,
}

impl AddAssign for PropagationStats {
    fn add_assign(&mut self, rhs: Self) {
        self.stores_touched += rhs.stores_touched;
        self.cells_patched += rhs.cells_patched;
        self.rows_matched += rhs.rows_matched;
        self.rows_unmatched += rhs.rows_unmatched;
        self.name_matched += rhs.name_matched;
        self.missing_tabs += rhs.missing_tabs;
    }
}

/// Flag text plus row colors of one aggregate row, in entity layout order.
struct Highlight {
    flag: String,
    backgrounds: Vec<Color>,
    foregrounds: Vec<Color>,
}

#[derive(Clone)]
pub struct Propagator {
    store: Arc<dyn DocumentStore>,
    legacy_name_matching: bool,
}

impl Propagator {
    pub fn new(store: Arc<dyn DocumentStore>, legacy_name_matching: bool) -> Self {
        Self {
            store,
            legacy_name_matching,
        }
    }

    fn aggregate_doc(group: &GroupView) -> Result<&DocumentRef> {
        group
            .store
            .as_ref()
            .ok_or_else(|| Error::Config(format!("group '{}' has no aggregate store", group.name)))
    }

    /// Copy note slots from every member's entity tab into the group's
    /// aggregate tab.
    #[tracing::instrument(level = "info", skip_all, fields(group = %group.name, tab = %dataset.name))]
    pub async fn notes_up(
        &self,
        group: &GroupView,
        dataset: &DatasetSpec,
        entity: &Layout,
        aggregate: &Layout,
    ) -> Result<PropagationStats> {
        let mut stats = PropagationStats::default();
        let agg_doc = Self::aggregate_doc(group)?;
        let Some(agg_grid) = self.store.read_tab(agg_doc, &dataset.name).await? else {
            stats.missing_tabs += 1;
            return Ok(stats);
        };
        let agg_cols = aggregate.resolve(agg_grid.header(), &dataset.name_property);
        let Some(agg_id) = agg_cols.id else {
            tracing::warn!("aggregate tab has no record id column; notes not propagated");
            return Ok(stats);
        };

        let mut by_id: HashMap<RecordId, usize> = HashMap::new();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (row, _) in agg_grid.data_rows() {
            if let Some(id) = RecordId::parse_cell(agg_grid.cell(row, agg_id)) {
                by_id.entry(id).or_insert(row);
                if let Some(name_col) = agg_cols.name {
                    let name = agg_grid.cell(row, name_col).trim();
                    if !name.is_empty() {
                        by_name.entry(name.to_string()).or_default().push(row);
                    }
                }
            }
        }

        let mut patches: Vec<CellPatch> = Vec::new();
        for member in &group.members {
            let Some(doc) = member.store.as_ref() else {
                tracing::debug!(owner = %member.key(), "member has no entity store; skipped");
                continue;
            };
            let Some(ent_grid) = self.store.read_tab(doc, &dataset.name).await? else {
                stats.missing_tabs += 1;
                continue;
            };
            let ent_cols = entity.resolve(ent_grid.header(), &dataset.name_property);
            let Some(ent_id) = ent_cols.id else {
                tracing::warn!(owner = %member.key(), "entity tab has no record id column; skipped");
                continue;
            };

            for (row, _) in ent_grid.data_rows() {
                let Some(id) = RecordId::parse_cell(ent_grid.cell(row, ent_id)) else {
                    continue;
                };
                let target = match by_id.get(&id) {
                    Some(&r) => r,
                    None => match self.name_fallback(&ent_grid, row, ent_cols.name, &by_name) {
                        Some(r) => {
                            tracing::warn!(
                                record_id = %id,
                                owner = %member.key(),
                                "matched aggregate row by display name; legacy name matching is deprecated"
                            );
                            stats.name_matched += 1;
                            r
                        }
                        None => {
                            stats.rows_unmatched += 1;
                            continue;
                        }
                    },
                };
                stats.rows_matched += 1;

                for (slot, ent_idx) in &ent_cols.notes {
                    let Some(agg_idx) = agg_cols.notes.get(slot).copied().flatten() else {
                        continue;
                    };
                    let value = ent_idx.map(|c| ent_grid.cell(row, c)).unwrap_or("");
                    if agg_grid.cell(target, agg_idx) != value {
                        patches.push(CellPatch::value(target, agg_idx, value));
                    }
                }
            }
        }

        if !patches.is_empty() {
            stats.cells_patched = patches.len();
            stats.stores_touched = 1;
            self.store
                .patch_cells(agg_doc, &dataset.name, &patches)
                .await?;
        }
        tracing::info!(
            cells = stats.cells_patched,
            matched = stats.rows_matched,
            unmatched = stats.rows_unmatched,
            "notes propagated up"
        );
        Ok(stats)
    }

    fn name_fallback(
        &self,
        grid: &Grid,
        row: usize,
        name_col: Option<usize>,
        by_name: &HashMap<String, Vec<usize>>,
    ) -> Option<usize> {
        if !self.legacy_name_matching {
            return None;
        }
        let name = grid.cell(row, name_col?).trim();
        match by_name.get(name).map(Vec::as_slice) {
            Some([only]) => Some(*only),
            _ => None,
        }
    }

    /// Copy flag text and row colors from the aggregate tab into every
    /// member's entity tab.
    #[tracing::instrument(level = "info", skip_all, fields(group = %group.name, tab = %dataset.name))]
    pub async fn flags_down(
        &self,
        group: &GroupView,
        dataset: &DatasetSpec,
        entity: &Layout,
        aggregate: &Layout,
    ) -> Result<PropagationStats> {
        let mut stats = PropagationStats::default();
        let agg_doc = Self::aggregate_doc(group)?;
        let Some(agg_grid) = self.store.read_tab(agg_doc, &dataset.name).await? else {
            stats.missing_tabs += 1;
            return Ok(stats);
        };
        let agg_cols = aggregate.resolve(agg_grid.header(), &dataset.name_property);
        let Some(agg_id) = agg_cols.id else {
            tracing::warn!("aggregate tab has no record id column; flags not propagated");
            return Ok(stats);
        };

        let neutral_bg = Color::neutral_background();
        let neutral_fg = Color::neutral_foreground();
        // stored aggregate -> aggregate layout -> entity layout
        let from_stored = ColumnProjection::from_stored(agg_grid.header(), aggregate);
        let to_entity = ColumnProjection::between(aggregate, entity);

        let mut highlights: HashMap<RecordId, Highlight> = HashMap::new();
        for (row, _) in agg_grid.data_rows() {
            let Some(id) = RecordId::parse_cell(agg_grid.cell(row, agg_id)) else {
                continue;
            };
            if highlights.contains_key(&id) {
                continue;
            }
            let flag = agg_cols
                .flag
                .map(|c| agg_grid.cell(row, c).to_string())
                .unwrap_or_default();
            let bg = from_stored.apply(agg_grid.row_backgrounds(row), &neutral_bg);
            let fg = from_stored.apply(agg_grid.row_foregrounds(row), &neutral_fg);
            highlights.insert(
                id,
                Highlight {
                    flag,
                    backgrounds: to_entity.apply(&bg, &neutral_bg),
                    foregrounds: to_entity.apply(&fg, &neutral_fg),
                },
            );
        }

        for member in &group.members {
            let Some(doc) = member.store.as_ref() else {
                continue;
            };
            let Some(ent_grid) = self.store.read_tab(doc, &dataset.name).await? else {
                stats.missing_tabs += 1;
                continue;
            };
            let ent_cols = entity.resolve(ent_grid.header(), &dataset.name_property);
            let Some(ent_id) = ent_cols.id else {
                tracing::warn!(owner = %member.key(), "entity tab has no record id column; skipped");
                continue;
            };
            let placement = ColumnProjection::from_stored(ent_grid.header(), entity);

            let mut patches: Vec<CellPatch> = Vec::new();
            for (row, _) in ent_grid.data_rows() {
                let Some(id) = RecordId::parse_cell(ent_grid.cell(row, ent_id)) else {
                    continue;
                };
                let Some(hl) = highlights.get(&id) else {
                    stats.rows_unmatched += 1;
                    continue;
                };
                stats.rows_matched += 1;

                if let Some(flag_col) = ent_cols.flag {
                    if ent_grid.cell(row, flag_col) != hl.flag {
                        patches.push(CellPatch::value(row, flag_col, hl.flag.clone()));
                    }
                }

                let cur_bg = ent_grid.row_backgrounds(row);
                let cur_fg = ent_grid.row_foregrounds(row);
                for col in 0..entity.width() {
                    let Some(stored_col) = placement.source_of(col) else {
                        continue;
                    };
                    let want_bg = &hl.backgrounds[col];
                    let want_fg = &hl.foregrounds[col];
                    let bg_diff = cur_bg.get(stored_col).unwrap_or(&neutral_bg) != want_bg;
                    let fg_diff = cur_fg.get(stored_col).unwrap_or(&neutral_fg) != want_fg;
                    if bg_diff || fg_diff {
                        patches.push(CellPatch::colors(
                            row,
                            stored_col,
                            bg_diff.then(|| want_bg.clone()),
                            fg_diff.then(|| want_fg.clone()),
                        ));
                    }
                }
            }

            if !patches.is_empty() {
                stats.cells_patched += patches.len();
                stats.stores_touched += 1;
                self.store.patch_cells(doc, &dataset.name, &patches).await?;
            }
        }
        tracing::info!(
            cells = stats.cells_patched,
            stores = stats.stores_touched,
            matched = stats.rows_matched,
            "flags propagated down"
        );
        Ok(stats)
    }
}
