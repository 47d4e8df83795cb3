use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref AMOUNT_REGEX: Regex =
        Regex::new(r"^(\()?\s*(-)?\s*\$?\s*([0-9][0-9,]*(\.[0-9]*)?|\.[0-9]+)\s*(\))?$").unwrap();
}

/// A single spreadsheet value
///
/// Cells are shared by decoded workbooks and comparison results. The JSON
/// representation is untagged so a grid serializes as plain nested arrays,
/// e.g. `[["A","B"],[1,-2]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value of the cell, also accepting amounts written as text
    /// (`"$1,234.50"`, `"(12.00)"`).
    pub fn to_amount(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => parse_amount(s),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Cell::Number(n) => f.write_str(&format_number(*n)),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

/// Format a number the way spreadsheets display it: integral values have no
/// fractional part.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Parse an amount written as text
///
/// Accepts thousands separators, a leading `$`, a minus sign and accounting
/// style parentheses for negatives. Returns `None` for anything else.
///
/// # Examples
/// ```
/// use grbalance::grid::parse_amount;
///
/// assert_eq!(parse_amount("$1,234.50"), Some(1234.5));
/// assert_eq!(parse_amount("(12.00)"), Some(-12.0));
/// assert_eq!(parse_amount("Visa"), None);
/// ```
pub fn parse_amount(text: &str) -> Option<f64> {
    let caps = AMOUNT_REGEX.captures(text.trim())?;
    let open = caps.get(1).is_some();
    let close = caps.get(5).is_some();
    if open != close {
        return None;
    }

    let digits = caps.get(3)?.as_str().replace(',', "");
    let value: f64 = digits.parse().ok()?;
    let negative = open ^ caps.get(2).is_some();
    Some(if negative { -value } else { value })
}

/// Tabular result of a comparison
///
/// Row 0 is the header; the remaining rows are data. Rows may be ragged,
/// the column count is the length of the longest row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultGrid {
    rows: Vec<Vec<Cell>>,
}

impl ResultGrid {
    pub fn new(rows: Vec<Vec<Cell>>) -> Self {
        ResultGrid { rows }
    }

    pub fn empty() -> Self {
        ResultGrid::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn header(&self) -> Option<&[Cell]> {
        self.rows.first().map(Vec::as_slice)
    }

    pub fn data_rows(&self) -> &[Vec<Cell>] {
        self.rows.get(1..).unwrap_or(&[])
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        self.rows.push(row);
    }
}

impl From<Vec<Vec<Cell>>> for ResultGrid {
    fn from(rows: Vec<Vec<Cell>>) -> Self {
        ResultGrid::new(rows)
    }
}
