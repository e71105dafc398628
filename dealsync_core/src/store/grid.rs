use crate::models::Color;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderStyle {
    pub background: Color,
    pub foreground: Color,
    pub bold: bool,
}

impl Default for HeaderStyle {
    fn default() -> Self {
        Self {
            background: Color::new("#1f3864"),
            foreground: Color::new("#ffffff"),
            bold: true,
        }
    }
}

/// Three-point color scale over one column, evaluated by the viewer.
///
/// The rule is declarative: it names a column, not values, so rewriting it
/// on every refresh is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradientRule {
    pub column: usize,
    pub min_color: Color,
    pub mid_color: Color,
    pub max_color: Color,
}

impl GradientRule {
    pub fn red_yellow_green(column: usize) -> Self {
        Self {
            column,
            min_color: Color::new("#f8696b"),
            mid_color: Color::new("#ffeb84"),
            max_color: Color::new("#63be7b"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabFormatting {
    pub header: Option<HeaderStyle>,
    #[serde(default)]
    pub gradients: Vec<GradientRule>,
    #[serde(default)]
    pub frozen_rows: usize,
}

/// One stored tab: row 0 is the header.
///
/// `backgrounds`/`foregrounds` parallel `values`; rows may be ragged when a
/// human edited the tab, readers must not assume rectangular shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Grid {
    pub values: Vec<Vec<String>>,
    #[serde(default)]
    pub backgrounds: Vec<Vec<Color>>,
    #[serde(default)]
    pub foregrounds: Vec<Vec<Color>>,
    #[serde(default)]
    pub formatting: TabFormatting,
}

impl Grid {
    pub fn header(&self) -> &[String] {
        self.values.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of rows below the header.
    pub fn data_len(&self) -> usize {
        self.values.len().saturating_sub(1)
    }

    /// Data rows with their absolute row index (first data row is 1).
    pub fn data_rows(&self) -> impl Iterator<Item = (usize, &[String])> {
        self.values
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, r)| (i, r.as_slice()))
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.values
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn row_backgrounds(&self, row: usize) -> &[Color] {
        self.backgrounds.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn row_foregrounds(&self, row: usize) -> &[Color] {
        self.foregrounds.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Apply patches in order. Cells past the current row width are created;
    /// rows that do not exist are an error.
    pub fn apply(&mut self, patches: &[CellPatch]) -> Result<()> {
        for p in patches {
            if p.row >= self.values.len() {
                return Err(Error::InvalidInput(format!(
                    "patch row {} out of range ({} rows)",
                    p.row,
                    self.values.len()
                )));
            }
            if let Some(v) = &p.value {
                let row = &mut self.values[p.row];
                if row.len() <= p.column {
                    row.resize(p.column + 1, String::new());
                }
                row[p.column] = v.clone();
            }
            if let Some(bg) = &p.background {
                set_color(&mut self.backgrounds, p.row, p.column, bg, Color::neutral_background);
            }
            if let Some(fg) = &p.foreground {
                set_color(&mut self.foregrounds, p.row, p.column, fg, Color::neutral_foreground);
            }
        }
        Ok(())
    }
}

fn set_color(grid: &mut Vec<Vec<Color>>, row: usize, column: usize, color: &Color, fill: fn() -> Color) {
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let r = &mut grid[row];
    if r.len() <= column {
        r.resize_with(column + 1, fill);
    }
    r[column] = color.clone();
}

/// A targeted update of one cell. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPatch {
    pub row: usize,
    pub column: usize,
    pub value: Option<String>,
    pub background: Option<Color>,
    pub foreground: Option<Color>,
}

impl CellPatch {
    pub fn value(row: usize, column: usize, value: impl Into<String>) -> Self {
        Self {
            row,
            column,
            value: Some(value.into()),
            background: None,
            foreground: None,
        }
    }

    pub fn colors(row: usize, column: usize, background: Option<Color>, foreground: Option<Color>) -> Self {
        Self {
            row,
            column,
            value: None,
            background,
            foreground,
        }
    }
}
