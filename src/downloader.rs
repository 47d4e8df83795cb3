use crate::error::ExportError;
use crate::grid::{Cell, ResultGrid};

/// Download name of the spreadsheet export
pub const EXPORT_FILE_NAME: &str = "Comparison_Results.xlsx";

/// Download name of the CSV export
pub const CSV_FILE_NAME: &str = "Comparison_Results.csv";

/// Sheet name used in the spreadsheet export
pub const EXPORT_SHEET_NAME: &str = "Results";

/// Convert a result grid to CSV format
///
/// Every row is written in order, header included. Fields containing commas,
/// quotes, carriage returns or newlines are quoted and inner quotes doubled.
///
/// # Arguments
/// * `grid` - The comparison result to convert
///
/// # Returns
/// * `Result<String, ExportError>` - CSV content, or `EmptyGrid` when there is nothing to export
///
/// # Examples
/// ```
/// use grbalance::grid::{Cell, ResultGrid};
/// use grbalance::downloader::to_csv;
///
/// let grid = ResultGrid::new(vec![
///     vec![Cell::text("Brand"), Cell::text("Difference")],
///     vec![Cell::text("Visa, Debit"), Cell::Number(-2.0)],
/// ]);
/// assert_eq!(to_csv(&grid).unwrap(), "Brand,Difference\n\"Visa, Debit\",-2\n");
/// ```
pub fn to_csv(grid: &ResultGrid) -> Result<String, ExportError> {
    if grid.is_empty() {
        return Err(ExportError::EmptyGrid);
    }

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    for row in grid.rows() {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Csv(e.into_error().into()))?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Convert a result grid to XLSX format
///
/// Writes the whole grid, header included, into a single sheet named
/// `Results` using the rust_xlsxwriter library. Numbers stay numeric so the
/// download can be summed in Excel.
///
/// # Arguments
/// * `grid` - The comparison result to convert
///
/// # Returns
/// * `Result<Vec<u8>, ExportError>` - XLSX file content as bytes or an error
///
/// # Examples
/// ```
/// use grbalance::grid::{Cell, ResultGrid};
/// use grbalance::downloader::to_xlsx;
///
/// let grid = ResultGrid::new(vec![vec![Cell::text("A")], vec![Cell::Number(1.0)]]);
/// match to_xlsx(&grid) {
///     Ok(xlsx_data) => println!("XLSX generated: {} bytes", xlsx_data.len()),
///     Err(e) => eprintln!("Failed to generate XLSX: {}", e),
/// }
/// ```
pub fn to_xlsx(grid: &ResultGrid) -> Result<Vec<u8>, ExportError> {
    use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};

    if grid.is_empty() {
        return Err(ExportError::EmptyGrid);
    }

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name(EXPORT_SHEET_NAME)?;

    for (r, row) in grid.rows().iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            let r = u32::try_from(r).map_err(|_| XlsxError::RowColumnLimitError)?;
            let c = u16::try_from(c).map_err(|_| XlsxError::RowColumnLimitError)?;
            match cell {
                Cell::Empty => {}
                Cell::Bool(b) => {
                    worksheet.write_boolean(r, c, *b)?;
                }
                Cell::Number(n) => {
                    worksheet.write_number(r, c, *n)?;
                }
                Cell::Text(s) => {
                    worksheet.write_string(r, c, s)?;
                }
            }
        }
    }

    workbook.push_worksheet(worksheet);

    let buffer = workbook.save_to_buffer()?;

    Ok(buffer)
}

/// Convert column number to letter (A=1, B=2, etc.)
///
/// # Examples
/// ```
/// use grbalance::downloader::column_to_letter;
///
/// assert_eq!(column_to_letter(1), "A");
/// assert_eq!(column_to_letter(26), "Z");
/// assert_eq!(column_to_letter(27), "AA");
/// assert_eq!(column_to_letter(52), "AZ");
/// ```
pub fn column_to_letter(col: usize) -> String {
    let mut name = String::new();
    let mut n = col;

    while n > 0 {
        n -= 1;
        name.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }

    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{Data, Reader, Xlsx, open_workbook_from_rs};
    use std::io::Cursor;

    fn sample() -> ResultGrid {
        ResultGrid::new(vec![
            vec![Cell::text("Brand"), Cell::text("Hub"), Cell::text("Sales")],
            vec![Cell::text("Visa"), Cell::Number(10.0), Cell::Number(-2.5)],
            vec![Cell::text("Amex"), Cell::Number(0.0), Cell::Bool(true)],
        ])
    }

    #[test]
    fn empty_grid_cannot_be_exported() {
        assert!(matches!(
            to_xlsx(&ResultGrid::empty()),
            Err(ExportError::EmptyGrid)
        ));
        assert!(matches!(
            to_csv(&ResultGrid::empty()),
            Err(ExportError::EmptyGrid)
        ));
    }

    #[test]
    fn xlsx_export_has_one_sheet_with_grid_dimensions() {
        let grid = sample();
        let bytes = to_xlsx(&grid).unwrap();

        let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes)).unwrap();
        assert_eq!(workbook.sheet_names(), vec![EXPORT_SHEET_NAME.to_string()]);

        let range = workbook.worksheet_range(EXPORT_SHEET_NAME).unwrap();
        assert_eq!(range.get_size(), (grid.row_count(), grid.column_count()));
        assert_eq!(range.get((0, 0)), Some(&Data::String("Brand".into())));
        assert_eq!(range.get((1, 2)), Some(&Data::Float(-2.5)));
        assert_eq!(range.get((2, 2)), Some(&Data::Bool(true)));
    }

    #[test]
    fn csv_export_includes_header_and_escapes_quotes() {
        let grid = ResultGrid::new(vec![
            vec![Cell::text("Note")],
            vec![Cell::text("say \"hi\"")],
        ]);
        assert_eq!(to_csv(&grid).unwrap(), "Note\n\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn csv_export_quotes_carriage_returns() {
        let grid = ResultGrid::new(vec![
            vec![Cell::text("Note"), Cell::text("Amount")],
            vec![Cell::text("a\rb"), Cell::Number(1.0)],
            vec![Cell::text("line\r\nbreak")],
        ]);
        let csv = to_csv(&grid).unwrap();
        assert_eq!(csv, "Note,Amount\n\"a\rb\",1\n\"line\r\nbreak\"\n");

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(csv.as_bytes());
        let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(&records[1][0], "a\rb");
        assert_eq!(&records[2][0], "line\r\nbreak");
    }

    #[test]
    fn column_letters_wrap_after_z() {
        assert_eq!(column_to_letter(28), "AB");
        assert_eq!(column_to_letter(702), "ZZ");
        assert_eq!(column_to_letter(703), "AAA");
        assert_eq!(column_to_letter(16_384), "XFD");
        assert_eq!(column_to_letter(65_537), "CRXQ");
    }
}
