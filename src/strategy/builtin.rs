use super::ComparisonStrategy;
use crate::downloader::column_to_letter;
use crate::error::ExecError;
use crate::grid::{Cell, ResultGrid};
use crate::loader::{DecodedWorkbook, Sheet};
use crate::pipeline::CancelToken;
use std::collections::HashMap;

const EPSILON: f64 = 1e-9;

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reconciles the hub payment report against the sales report.
///
/// Each file's first sheet is grouped by a key column (card brand) and an
/// amount column is summed per key. The result lists both totals and the
/// difference `hub - sales` per key, followed by a grand total row.
pub struct HubVsSales {
    key_headers: Vec<String>,
    amount_headers: Vec<String>,
}

impl Default for HubVsSales {
    fn default() -> Self {
        HubVsSales::new(
            &["Card Brand", "Brand", "Payment Method", "Payment Type", "Card Type"],
            &["Total (-) Fee", "Amount", "Total", "Net Amount", "Net", "Sales"],
        )
    }
}

struct Totals {
    label: String,
    hub: f64,
    sales: f64,
}

impl HubVsSales {
    /// Header names are tried in order, case-insensitively.
    pub fn new(key_headers: &[&str], amount_headers: &[&str]) -> Self {
        HubVsSales {
            key_headers: key_headers.iter().map(|s| s.to_string()).collect(),
            amount_headers: amount_headers.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn column_sums(&self, workbook: &DecodedWorkbook) -> Result<Vec<(String, f64)>, ExecError> {
        let missing = |wanted: &[String]| ExecError::MissingColumn {
            file: workbook.file_name.clone(),
            wanted: wanted.join(" / "),
        };

        let sheet = workbook
            .first_sheet()
            .ok_or_else(|| missing(&self.key_headers))?;
        let (header_idx, header) =
            header_row(sheet).ok_or_else(|| missing(&self.key_headers))?;

        let key_col = find_column(header, &self.key_headers).ok_or_else(|| missing(&self.key_headers))?;
        let amount_col =
            find_column(header, &self.amount_headers).ok_or_else(|| missing(&self.amount_headers))?;

        let mut sums = Vec::new();
        for row in &sheet.rows[header_idx + 1..] {
            let key = match row.get(key_col) {
                Some(cell) if !cell.is_empty() => cell.to_string().trim().to_string(),
                _ => continue,
            };
            if key.eq_ignore_ascii_case("total") || key.eq_ignore_ascii_case("grand total") {
                continue;
            }
            let Some(amount) = row.get(amount_col).and_then(Cell::to_amount) else {
                continue;
            };
            sums.push((key, amount));
        }

        Ok(sums)
    }
}

fn header_row(sheet: &Sheet) -> Option<(usize, &[Cell])> {
    sheet
        .rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.iter().any(|c| !c.is_empty()))
        .map(|(i, row)| (i, row.as_slice()))
}

fn find_column(header: &[Cell], wanted: &[String]) -> Option<usize> {
    wanted.iter().find_map(|name| {
        header
            .iter()
            .position(|cell| cell.to_string().trim().eq_ignore_ascii_case(name))
    })
}

impl ComparisonStrategy for HubVsSales {
    fn key(&self) -> &str {
        "run5"
    }

    fn label(&self) -> &str {
        "Main HUB vs Sales"
    }

    fn compare(
        &self,
        first: &DecodedWorkbook,
        second: &DecodedWorkbook,
        cancel: &CancelToken,
    ) -> Result<ResultGrid, ExecError> {
        let hub = self.column_sums(first)?;
        cancel.check()?;
        let sales = self.column_sums(second)?;
        cancel.check()?;

        let mut order: Vec<Totals> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let mut add = |key: String, hub_amount: f64, sales_amount: f64| {
            let slot = *index.entry(key.to_lowercase()).or_insert_with(|| {
                order.push(Totals {
                    label: key,
                    hub: 0.0,
                    sales: 0.0,
                });
                order.len() - 1
            });
            order[slot].hub += hub_amount;
            order[slot].sales += sales_amount;
        };

        for (key, amount) in hub {
            add(key, amount, 0.0);
        }
        for (key, amount) in sales {
            add(key, 0.0, amount);
        }

        let mut grid = ResultGrid::new(vec![vec![
            Cell::text("Card Brand"),
            Cell::text("Hub Report"),
            Cell::text("Sales Report"),
            Cell::text("Difference"),
        ]]);

        let (mut hub_total, mut sales_total) = (0.0, 0.0);
        for totals in order {
            hub_total += totals.hub;
            sales_total += totals.sales;
            grid.push_row(vec![
                Cell::Text(totals.label),
                Cell::Number(round_cents(totals.hub)),
                Cell::Number(round_cents(totals.sales)),
                Cell::Number(round_cents(totals.hub - totals.sales)),
            ]);
        }

        grid.push_row(vec![
            Cell::text("Total"),
            Cell::Number(round_cents(hub_total)),
            Cell::Number(round_cents(sales_total)),
            Cell::Number(round_cents(hub_total - sales_total)),
        ]);

        Ok(grid)
    }
}

/// Positional comparison of the first sheet of both files
///
/// Lists every cell whose value differs, with the numeric delta
/// `second - first` when both sides are numbers.
pub struct CellDiff;

fn same_value(a: &Cell, b: &Cell) -> bool {
    match (a, b) {
        (Cell::Number(x), Cell::Number(y)) => (x - y).abs() < EPSILON,
        _ if a.is_empty() && b.is_empty() => true,
        _ => a == b,
    }
}

impl ComparisonStrategy for CellDiff {
    fn key(&self) -> &str {
        "cell-diff"
    }

    fn label(&self) -> &str {
        "Cell-by-cell difference"
    }

    fn compare(
        &self,
        first: &DecodedWorkbook,
        second: &DecodedWorkbook,
        cancel: &CancelToken,
    ) -> Result<ResultGrid, ExecError> {
        let empty: &[Vec<Cell>] = &[];
        let left = first.first_sheet().map(|s| s.rows.as_slice()).unwrap_or(empty);
        let right = second.first_sheet().map(|s| s.rows.as_slice()).unwrap_or(empty);

        let mut grid = ResultGrid::new(vec![vec![
            Cell::text("Row"),
            Cell::text("Column"),
            Cell::Text(first.file_name.clone()),
            Cell::Text(second.file_name.clone()),
            Cell::text("Delta"),
        ]]);

        let blank = Cell::Empty;
        for r in 0..left.len().max(right.len()) {
            cancel.check()?;

            let a_row = left.get(r).map(Vec::as_slice).unwrap_or(&[]);
            let b_row = right.get(r).map(Vec::as_slice).unwrap_or(&[]);

            for c in 0..a_row.len().max(b_row.len()) {
                let a = a_row.get(c).unwrap_or(&blank);
                let b = b_row.get(c).unwrap_or(&blank);
                if same_value(a, b) {
                    continue;
                }

                let delta = match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => Cell::Number(y - x),
                    _ => Cell::Empty,
                };
                grid.push_row(vec![
                    Cell::Number((r + 1) as f64),
                    Cell::Text(column_to_letter(c + 1)),
                    a.clone(),
                    b.clone(),
                    delta,
                ]);
            }
        }

        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{UploadedFile, decode};

    fn csv(name: &str, text: &str) -> DecodedWorkbook {
        decode(&UploadedFile::new(name, text)).unwrap()
    }

    #[test]
    fn hub_vs_sales_reports_differences_per_brand() {
        let hub = csv(
            "hub.csv",
            "Card Brand,Total (-) Fee\nVisa,100\nMastercard,\"$50.25\"\nvisa,20\nTotal,170.25\n",
        );
        let sales = csv("sales.csv", "Date,Brand,Amount\n1/1,Visa,125\n1/1,Amex,10\n");

        let grid = HubVsSales::default()
            .compare(&hub, &sales, &CancelToken::new())
            .unwrap();
        let rows = grid.rows();

        assert_eq!(rows[0][0], Cell::text("Card Brand"));
        assert_eq!(
            rows[1],
            vec![
                Cell::text("Visa"),
                Cell::Number(120.0),
                Cell::Number(125.0),
                Cell::Number(-5.0)
            ]
        );
        assert_eq!(rows[2][0], Cell::text("Mastercard"));
        assert_eq!(rows[2][3], Cell::Number(50.25));
        assert_eq!(rows[3][0], Cell::text("Amex"));
        assert_eq!(rows[3][3], Cell::Number(-10.0));
        assert_eq!(rows[4][0], Cell::text("Total"));
        assert_eq!(rows[4][3], Cell::Number(35.25));
    }

    #[test]
    fn hub_vs_sales_names_the_missing_column() {
        let hub = csv("hub.csv", "Brand,Qty\nVisa,1\n");
        let sales = csv("sales.csv", "Brand,Amount\nVisa,1\n");
        let err = HubVsSales::default()
            .compare(&hub, &sales, &CancelToken::new())
            .unwrap_err();
        match err {
            ExecError::MissingColumn { file, wanted } => {
                assert_eq!(file, "hub.csv");
                assert!(wanted.contains("Amount"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cell_diff_lists_changed_cells_with_delta() {
        let a = csv("a.csv", "x,1\ny,2\n");
        let b = csv("b.csv", "x,1\ny,5\nz\n");

        let grid = CellDiff.compare(&a, &b, &CancelToken::new()).unwrap();
        assert_eq!(grid.row_count(), 3);
        assert_eq!(
            grid.rows()[1],
            vec![
                Cell::Number(2.0),
                Cell::text("B"),
                Cell::Number(2.0),
                Cell::Number(5.0),
                Cell::Number(3.0)
            ]
        );
        assert_eq!(grid.rows()[2][1], Cell::text("A"));
        assert_eq!(grid.rows()[2][3], Cell::text("z"));
        assert_eq!(grid.rows()[2][4], Cell::Empty);
    }

    #[test]
    fn cell_diff_names_columns_past_u16_range() {
        let wide = |last: &str| format!("{}{}\n", "0,".repeat(65_536), last);
        let a = csv("a.csv", &wide("1"));
        let b = csv("b.csv", &wide("2"));

        let grid = CellDiff.compare(&a, &b, &CancelToken::new()).unwrap();
        assert_eq!(grid.row_count(), 2);
        assert_eq!(grid.rows()[1][1], Cell::text("CRXQ"));
    }

    #[test]
    fn cancelled_comparison_stops() {
        let a = csv("a.csv", "1\n");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            CellDiff.compare(&a, &a, &cancel),
            Err(ExecError::Cancelled)
        ));
    }
}
