//! Store adapters: materialize merged rows into entity and aggregate tabs.
//!
//! A write always replaces the whole tab: header, body, header style,
//! gradient rules on score columns, and per-cell colors.

use crate::config::{AggregateSpec, DatasetSpec};
use crate::layout::Layout;
use crate::models::{Color, Row};
use crate::preserve::{self, CapturedAnnotations};
use crate::store::{DocumentRef, DocumentStore, GradientRule, Grid, HeaderStyle, TabFormatting};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

pub const EMPTY_PLACEHOLDER: &str = "No matching records";
const SEPARATOR_BACKGROUND: &str = "#d9d9d9";

/// Outcome of one tab write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteSummary {
    pub rows_written: usize,
    /// Rows dropped by the aggregate cap.
    pub rows_truncated: usize,
    pub placeholder: bool,
}

fn base_grid(layout: &Layout) -> Grid {
    let width = layout.width();
    Grid {
        values: vec![layout.headers()],
        backgrounds: vec![vec![HeaderStyle::default().background; width]],
        foregrounds: vec![vec![HeaderStyle::default().foreground; width]],
        formatting: TabFormatting {
            header: Some(HeaderStyle::default()),
            gradients: layout
                .score_indices()
                .into_iter()
                .map(GradientRule::red_yellow_green)
                .collect(),
            frozen_rows: 1,
        },
    }
}

fn push_row(grid: &mut Grid, row: Row) {
    grid.values.push(row.cells);
    grid.backgrounds.push(row.backgrounds);
    grid.foregrounds.push(row.foregrounds);
}

fn push_banner(grid: &mut Grid, width: usize, text: String, background: Color) {
    let mut cells = vec![String::new(); width];
    if let Some(first) = cells.first_mut() {
        *first = text;
    }
    grid.values.push(cells);
    grid.backgrounds.push(vec![background; width]);
    grid.foregrounds.push(vec![Color::neutral_foreground(); width]);
}

fn push_placeholder(grid: &mut Grid, width: usize) {
    push_banner(
        grid,
        width,
        EMPTY_PLACEHOLDER.to_string(),
        Color::neutral_background(),
    );
}

/// Render an entity tab. With `group_by_stage`, rows are ordered by the
/// dataset's stage order (unknown stages last, in first-seen order) and
/// each stage gets a separator row without a record id.
pub fn render_entity(rows: Vec<Row>, layout: &Layout, dataset: &DatasetSpec) -> (Grid, WriteSummary) {
    let width = layout.width();
    let mut grid = base_grid(layout);
    let mut summary = WriteSummary {
        rows_written: rows.len(),
        ..Default::default()
    };

    if rows.is_empty() {
        push_placeholder(&mut grid, width);
        summary.placeholder = true;
        return (grid, summary);
    }

    if !dataset.group_by_stage {
        for row in rows {
            push_row(&mut grid, row);
        }
        return (grid, summary);
    }

    let mut stages: Vec<String> = dataset.stages.clone();
    for row in &rows {
        if !stages.contains(&row.record.stage) {
            stages.push(row.record.stage.clone());
        }
    }
    let mut buckets: Vec<Vec<Row>> = vec![Vec::new(); stages.len()];
    for row in rows {
        if let Some(i) = stages.iter().position(|s| *s == row.record.stage) {
            buckets[i].push(row);
        }
    }
    for (stage, bucket) in stages.iter().zip(buckets) {
        if bucket.is_empty() {
            continue;
        }
        let label = if stage.is_empty() { "(no stage)" } else { stage.as_str() };
        push_banner(
            &mut grid,
            width,
            format!("── {label} ({}) ──", bucket.len()),
            Color::new(SEPARATOR_BACKGROUND),
        );
        for row in bucket {
            push_row(&mut grid, row);
        }
    }
    (grid, summary)
}

/// Order rows for the aggregate cap: pending next action first, then most
/// recent activity, then record id so the order is total.
pub fn priority_order(a: &Row, b: &Row, spec: &AggregateSpec) -> Ordering {
    let pending = |r: &Row| !r.record.property(&spec.next_action_property).is_empty();
    let activity = |r: &Row| r.record.property(&spec.last_activity_property).to_string();
    pending(b)
        .cmp(&pending(a))
        .then_with(|| {
            // Empty dates sort after any real date.
            match (activity(a), activity(b)) {
                (x, y) if x.is_empty() && y.is_empty() => Ordering::Equal,
                (x, _) if x.is_empty() => Ordering::Greater,
                (_, y) if y.is_empty() => Ordering::Less,
                (x, y) => y.cmp(&x),
            }
        })
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Render an aggregate tab, applying the row cap when exceeded.
pub fn render_aggregate(mut rows: Vec<Row>, layout: &Layout, spec: &AggregateSpec) -> (Grid, WriteSummary) {
    let width = layout.width();
    let mut grid = base_grid(layout);
    let mut summary = WriteSummary::default();

    if rows.len() > spec.max_rows {
        rows.sort_by(|a, b| priority_order(a, b, spec));
        summary.rows_truncated = rows.len() - spec.max_rows;
        rows.truncate(spec.max_rows);
        tracing::info!(
            kept = spec.max_rows,
            dropped = summary.rows_truncated,
            "aggregate row cap applied"
        );
    }
    summary.rows_written = rows.len();

    if rows.is_empty() {
        push_placeholder(&mut grid, width);
        summary.placeholder = true;
        return (grid, summary);
    }
    for row in rows {
        push_row(&mut grid, row);
    }
    (grid, summary)
}

/// Reads and writes entity tabs.
#[derive(Clone)]
pub struct EntityStoreAdapter {
    store: Arc<dyn DocumentStore>,
}

impl EntityStoreAdapter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Capture annotations from the current tab; a missing tab captures nothing.
    #[tracing::instrument(level = "debug", skip(self, layout, dataset), fields(tab = %dataset.name))]
    pub async fn capture(
        &self,
        doc: &DocumentRef,
        dataset: &DatasetSpec,
        layout: &Layout,
    ) -> Result<CapturedAnnotations> {
        Ok(match self.store.read_tab(doc, &dataset.name).await? {
            Some(grid) => preserve::capture(&grid, layout, &dataset.name_property),
            None => CapturedAnnotations::new(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, rows, layout, dataset), fields(tab = %dataset.name, rows = rows.len()))]
    pub async fn write(
        &self,
        doc: &DocumentRef,
        dataset: &DatasetSpec,
        layout: &Layout,
        rows: Vec<Row>,
    ) -> Result<WriteSummary> {
        let (grid, summary) = render_entity(rows, layout, dataset);
        self.store.replace_tab(doc, &dataset.name, grid).await?;
        Ok(summary)
    }
}

/// Reads and writes aggregate tabs.
#[derive(Clone)]
pub struct AggregateStoreAdapter {
    store: Arc<dyn DocumentStore>,
    spec: AggregateSpec,
}

impl AggregateStoreAdapter {
    pub fn new(store: Arc<dyn DocumentStore>, spec: AggregateSpec) -> Self {
        Self { store, spec }
    }

    #[tracing::instrument(level = "debug", skip(self, layout, dataset), fields(tab = %dataset.name))]
    pub async fn capture(
        &self,
        doc: &DocumentRef,
        dataset: &DatasetSpec,
        layout: &Layout,
    ) -> Result<CapturedAnnotations> {
        Ok(match self.store.read_tab(doc, &dataset.name).await? {
            Some(grid) => preserve::capture(&grid, layout, &dataset.name_property),
            None => CapturedAnnotations::new(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, rows, layout, dataset), fields(tab = %dataset.name, rows = rows.len()))]
    pub async fn write(
        &self,
        doc: &DocumentRef,
        dataset: &DatasetSpec,
        layout: &Layout,
        rows: Vec<Row>,
    ) -> Result<WriteSummary> {
        let (grid, summary) = render_aggregate(rows, layout, &self.spec);
        self.store.replace_tab(doc, &dataset.name, grid).await?;
        Ok(summary)
    }
}
