use crate::grid::{Cell, ResultGrid};
use serde::Serialize;

/// Sign highlight of a numeric data cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Highlight {
    Negative,
    NonNegative,
}

impl Highlight {
    /// Highlight for a data cell: only numeric cells are highlighted, zero
    /// counts as non-negative.
    pub fn for_cell(cell: &Cell) -> Option<Highlight> {
        match cell {
            Cell::Number(n) if *n < 0.0 => Some(Highlight::Negative),
            Cell::Number(_) => Some(Highlight::NonNegative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedCell {
    pub text: String,
    pub highlight: Option<Highlight>,
}

/// Table ready for display: header texts plus highlighted data rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableView {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<RenderedCell>>,
}

impl TableView {
    pub fn data_row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Build the table for a result grid
///
/// Row 0 supplies the headers and is never highlighted. Returns `None` for
/// an empty grid, in which case no table is shown and export is disabled.
pub fn present(grid: &ResultGrid) -> Option<TableView> {
    let header = grid.header()?;

    let headers = header.iter().map(Cell::to_string).collect();
    let rows = grid
        .data_rows()
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| RenderedCell {
                    text: cell.to_string(),
                    highlight: Highlight::for_cell(cell),
                })
                .collect()
        })
        .collect();

    Some(TableView { headers, rows })
}
