//! Annotation preservation: capture human-authored cells before a destructive
//! write, then re-attach them to freshly fetched records by record id.

use crate::layout::{fit_width, ColumnProjection, ColumnSource, Layout};
use crate::models::{Annotation, Color, Flag, Record, RecordId, Row};
use crate::store::Grid;
use std::collections::HashMap;

pub type CapturedAnnotations = HashMap<RecordId, Annotation>;

/// Read every annotated row of a stored tab, keyed by record id.
///
/// Rows without a parseable id (section separators, placeholders) are
/// skipped. When the same id appears twice the first row wins. Row colors
/// are returned in layout column order, placed by stored header text.
pub fn capture(grid: &Grid, layout: &Layout, name_property: &str) -> CapturedAnnotations {
    let cols = layout.resolve(grid.header(), name_property);
    let Some(id_col) = cols.id else {
        tracing::warn!("stored tab has no record id column; nothing captured");
        return CapturedAnnotations::new();
    };
    let placement = ColumnProjection::from_stored(grid.header(), layout);
    let neutral_bg = Color::neutral_background();
    let neutral_fg = Color::neutral_foreground();

    let mut out = CapturedAnnotations::with_capacity(grid.data_len());
    for (row, _) in grid.data_rows() {
        let Some(id) = RecordId::parse_cell(grid.cell(row, id_col)) else {
            continue;
        };
        if out.contains_key(&id) {
            tracing::debug!(record_id = %id, row, "duplicate record id in stored tab; keeping first");
            continue;
        }
        let notes = cols
            .notes
            .iter()
            .map(|(slot, idx)| {
                let text = idx.map(|c| grid.cell(row, c).to_string()).unwrap_or_default();
                (slot.clone(), text)
            })
            .collect();
        let flag = cols
            .flag
            .map(|c| Flag::parse_cell(grid.cell(row, c)))
            .unwrap_or_default();
        out.insert(
            id,
            Annotation {
                notes,
                flag,
                backgrounds: placement.apply(grid.row_backgrounds(row), &neutral_bg),
                foregrounds: placement.apply(grid.row_foregrounds(row), &neutral_fg),
            },
        );
    }
    out
}

/// Join fresh records with captured annotations, one row per record, in
/// record order. Records without a capture get default annotation fields.
pub fn merge(
    records: &[Record],
    captured: &CapturedAnnotations,
    layout: &Layout,
    owner_label: Option<&str>,
) -> Vec<Row> {
    let width = layout.width();
    let neutral_bg = Color::neutral_background();
    let neutral_fg = Color::neutral_foreground();
    let empty = Annotation::default();

    records
        .iter()
        .map(|record| {
            let ann = captured.get(&record.id).unwrap_or(&empty);
            let cells = layout
                .columns()
                .iter()
                .map(|col| match &col.source {
                    ColumnSource::Owner => owner_label.unwrap_or_default().to_string(),
                    ColumnSource::RecordId => record.id.to_string(),
                    ColumnSource::Property { name, .. } => record.property(name).to_string(),
                    ColumnSource::Note { slot } => ann.notes.get(slot).cloned().unwrap_or_default(),
                    ColumnSource::Flag => ann.flag.as_cell(),
                })
                .collect();
            Row {
                record: record.clone(),
                cells,
                backgrounds: fit_width(&ann.backgrounds, width, &neutral_bg),
                foregrounds: fit_width(&ann.foregrounds, width, &neutral_fg),
            }
        })
        .collect()
}
