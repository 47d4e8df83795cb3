use crate::error::DecodeError;
use crate::grid::Cell;
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use std::io::Cursor;
use std::sync::Arc;

/// Maximum number of cells decoded from one upload
pub const MAX_CELLS: usize = 5_000_000;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// A file handed over by the browser
///
/// The byte buffer is shared so that a comparison job can hold the upload
/// without copying it out of the session.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Arc<[u8]>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        UploadedFile {
            name: name.into(),
            bytes: Arc::from(bytes.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Zip container: xlsx, xlsm, xlsb or ods
    Workbook,
    /// Legacy BIFF workbook inside an OLE container
    Xls,
    Csv,
}

impl SourceFormat {
    /// Detect the format from the content; the file extension is only a hint
    /// used by the browser's picker and is not trusted here.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(ZIP_MAGIC) {
            SourceFormat::Workbook
        } else if bytes.starts_with(OLE_MAGIC) {
            SourceFormat::Xls
        } else {
            SourceFormat::Csv
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

/// In-memory form of an uploaded spreadsheet
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWorkbook {
    pub file_name: String,
    pub sheets: Vec<Sheet>,
}

impl DecodedWorkbook {
    pub fn first_sheet(&self) -> Option<&Sheet> {
        self.sheets.first()
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Decode an uploaded spreadsheet
///
/// Workbooks are read with calamine; anything that is not a zip or OLE
/// container is parsed as CSV into a single sheet named `Sheet1`.
///
/// # Arguments
/// * `file` - The uploaded file
///
/// # Returns
/// * `Result<DecodedWorkbook, DecodeError>` - The decoded sheets or an error
///
/// # Examples
/// ```
/// use grbalance::loader::{UploadedFile, decode};
///
/// let file = UploadedFile::new("sales.csv", "Brand,Amount\nVisa,10\n");
/// let workbook = decode(&file).unwrap();
/// assert_eq!(workbook.sheets[0].rows.len(), 2);
/// ```
pub fn decode(file: &UploadedFile) -> Result<DecodedWorkbook, DecodeError> {
    if file.is_empty() {
        return Err(DecodeError::Empty {
            file: file.name.clone(),
        });
    }

    let sheets = match SourceFormat::sniff(&file.bytes) {
        SourceFormat::Workbook | SourceFormat::Xls => decode_workbook(file)?,
        SourceFormat::Csv => vec![decode_csv(file)?],
    };

    if sheets.is_empty() {
        return Err(DecodeError::NoSheets {
            file: file.name.clone(),
        });
    }

    log::debug!(
        "decoded {} ({} bytes) into {} sheet(s)",
        file.name,
        file.len(),
        sheets.len()
    );

    Ok(DecodedWorkbook {
        file_name: file.name.clone(),
        sheets,
    })
}

fn decode_workbook(file: &UploadedFile) -> Result<Vec<Sheet>, DecodeError> {
    let workbook_error = |source| DecodeError::Workbook {
        file: file.name.clone(),
        source,
    };

    let cursor = Cursor::new(file.bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor).map_err(workbook_error)?;

    let mut sheets = Vec::new();
    let mut total_cells = 0usize;

    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name).map_err(workbook_error)?;
        let (height, width) = range.get_size();

        total_cells += height * width;
        if total_cells > MAX_CELLS {
            return Err(DecodeError::TooLarge {
                file: file.name.clone(),
                limit: MAX_CELLS,
            });
        }

        // calamine ranges start at the first used cell; pad so row and column
        // indices line up with the sheet as the user sees it.
        let (row_offset, col_offset) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));

        let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); row_offset];
        for row in range.rows() {
            let mut cells = vec![Cell::Empty; col_offset];
            cells.extend(row.iter().map(cell_from_data));
            rows.push(cells);
        }

        sheets.push(Sheet { name, rows });
    }

    Ok(sheets)
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(n) => Cell::Number(*n),
        Data::Int(n) => Cell::Number(*n as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(e) => Cell::Text(e.to_string()),
    }
}

fn decode_csv(file: &UploadedFile) -> Result<Sheet, DecodeError> {
    let bytes = file.bytes.strip_prefix(UTF8_BOM).unwrap_or(&file.bytes[..]);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    let mut total_cells = 0usize;

    for record in reader.records() {
        let record = record.map_err(|source| DecodeError::Csv {
            file: file.name.clone(),
            source,
        })?;

        total_cells += record.len();
        if total_cells > MAX_CELLS {
            return Err(DecodeError::TooLarge {
                file: file.name.clone(),
                limit: MAX_CELLS,
            });
        }

        rows.push(record.iter().map(cell_from_csv_field).collect());
    }

    Ok(Sheet {
        name: "Sheet1".to_string(),
        rows,
    })
}

fn cell_from_csv_field(field: &str) -> Cell {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Cell::Empty;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return Cell::Number(n);
        }
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Cell::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Cell::Bool(false);
    }
    Cell::Text(field.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::{Workbook, Worksheet};

    fn xlsx_bytes() -> Vec<u8> {
        let mut workbook = Workbook::new();
        let mut sheet = Worksheet::new();
        sheet.set_name("Hub").unwrap();
        sheet.write_string(1, 1, "Brand").unwrap();
        sheet.write_string(1, 2, "Amount").unwrap();
        sheet.write_string(2, 1, "Visa").unwrap();
        sheet.write_number(2, 2, -12.5).unwrap();
        workbook.push_worksheet(sheet);
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn csv_fields_are_typed() {
        let file = UploadedFile::new("a.csv", "Name,Amount,Flag\nVisa, -2 ,true\n,3.5,\n");
        let workbook = decode(&file).unwrap();
        let rows = &workbook.sheets[0].rows;

        assert_eq!(workbook.sheets[0].name, "Sheet1");
        assert_eq!(rows[0][0], Cell::text("Name"));
        assert_eq!(rows[1][1], Cell::Number(-2.0));
        assert_eq!(rows[1][2], Cell::Bool(true));
        assert_eq!(rows[2][0], Cell::Empty);
        assert_eq!(rows[2][1], Cell::Number(3.5));
    }

    #[test]
    fn csv_byte_order_mark_is_dropped() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"Brand\nVisa\n");
        let workbook = decode(&UploadedFile::new("bom.csv", bytes)).unwrap();
        assert_eq!(workbook.sheets[0].rows[0][0], Cell::text("Brand"));
    }

    #[test]
    fn quoted_csv_fields_keep_separators() {
        let file = UploadedFile::new("q.csv", "\"Smith, J\",\"1,200\"\n");
        let workbook = decode(&file).unwrap();
        let row = &workbook.sheets[0].rows[0];
        assert_eq!(row[0], Cell::text("Smith, J"));
        assert_eq!(row[1], Cell::text("1,200"));
        assert_eq!(row[1].to_amount(), Some(1200.0));
    }

    #[test]
    fn empty_upload_is_rejected() {
        let err = decode(&UploadedFile::new("empty.csv", Vec::new())).unwrap_err();
        assert!(matches!(err, DecodeError::Empty { .. }));
    }

    #[test]
    fn xlsx_is_detected_by_content_and_keeps_offsets() {
        // The extension says CSV; the zip signature wins.
        let file = UploadedFile::new("hub.csv", xlsx_bytes());
        assert_eq!(SourceFormat::sniff(&file.bytes), SourceFormat::Workbook);

        let workbook = decode(&file).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["Hub"]);

        let rows = &workbook.first_sheet().unwrap().rows;
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_empty());
        assert_eq!(rows[1][0], Cell::Empty);
        assert_eq!(rows[1][1], Cell::text("Brand"));
        assert_eq!(rows[2][2], Cell::Number(-12.5));
    }

    #[test]
    fn text_named_xlsx_falls_back_to_csv() {
        let file = UploadedFile::new("report.xlsx", "a,b\n1,2\n");
        assert_eq!(SourceFormat::sniff(&file.bytes), SourceFormat::Csv);
        let workbook = decode(&file).unwrap();
        assert_eq!(workbook.sheets[0].rows[1][1], Cell::Number(2.0));
    }

    #[test]
    fn corrupt_zip_reports_workbook_error() {
        let mut bytes = ZIP_MAGIC.to_vec();
        bytes.extend_from_slice(b"not really a zip");
        let err = decode(&UploadedFile::new("bad.xlsx", bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::Workbook { .. }));
        assert_eq!(err.file(), "bad.xlsx");
    }
}
