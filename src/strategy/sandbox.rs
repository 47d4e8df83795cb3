//! Sandboxed execution of remotely fetched comparison scripts.
//!
//! Scripts are written in rhai and must define
//! `compareAndDisplayData(xlsx, file1, file2)`. The engine has no module
//! resolver, no `eval`, and only the `xlsx` helper functions registered
//! below; every run is bounded by operation, size and wall-clock limits and
//! observes the comparison's cancel token.

use super::ComparisonStrategy;
use crate::error::ExecError;
use crate::grid::{Cell, ResultGrid, parse_amount};
use crate::loader::DecodedWorkbook;
use crate::pipeline::CancelToken;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, INT, ImmutableString, Map, Scope};
use std::time::{Duration, Instant};

/// Function every comparison script must define
pub const ENTRY_POINT: &str = "compareAndDisplayData";

// Checking the clock on every operation is wasteful.
const PROGRESS_CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub max_operations: u64,
    pub max_runtime: Duration,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            max_operations: 50_000_000,
            max_runtime: Duration::from_secs(30),
            max_call_levels: 64,
            max_string_size: 1 << 20,
            max_array_size: crate::loader::MAX_CELLS,
            max_map_size: 100_000,
        }
    }
}

/// Helper object passed to scripts as their first argument
#[derive(Debug, Clone, Copy)]
struct XlsxApi;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

fn sheets_of(workbook: &Map) -> ScriptResult<Array> {
    workbook
        .get("sheets")
        .and_then(|s| s.clone().into_array().ok())
        .ok_or_else(|| "value is not a workbook".into())
}

fn rows_of(sheet: Dynamic) -> ScriptResult<Array> {
    sheet
        .try_cast::<Map>()
        .and_then(|m| m.get("rows").cloned())
        .and_then(|rows| rows.into_array().ok())
        .ok_or_else(|| "value is not a sheet".into())
}

fn sheet_names(_: &mut XlsxApi, workbook: Map) -> ScriptResult<Array> {
    sheets_of(&workbook)?
        .into_iter()
        .map(|sheet| {
            sheet
                .try_cast::<Map>()
                .and_then(|m| m.get("name").cloned())
                .ok_or_else(|| -> Box<EvalAltResult> { "value is not a sheet".into() })
        })
        .collect()
}

fn sheet_rows_by_index(_: &mut XlsxApi, workbook: Map, index: INT) -> ScriptResult<Array> {
    let sheets = sheets_of(&workbook)?;
    let count = sheets.len();
    let sheet = usize::try_from(index)
        .ok()
        .and_then(|i| sheets.into_iter().nth(i))
        .ok_or_else(|| format!("sheet index {} out of range (workbook has {})", index, count))?;
    rows_of(sheet)
}

fn sheet_rows_by_name(_: &mut XlsxApi, workbook: Map, name: ImmutableString) -> ScriptResult<Array> {
    let sheet = sheets_of(&workbook)?
        .into_iter()
        .find(|sheet| {
            sheet
                .clone()
                .try_cast::<Map>()
                .and_then(|m| m.get("name").map(|n| n.to_string() == name.as_str()))
                .unwrap_or(false)
        })
        .ok_or_else(|| format!("no sheet named '{}'", name))?;
    rows_of(sheet)
}

/// Numeric value of a cell, accepting currency text; `()` when not numeric.
fn to_number(_: &mut XlsxApi, value: Dynamic) -> Dynamic {
    if let Ok(n) = value.as_float() {
        return Dynamic::from_float(n);
    }
    if let Ok(n) = value.as_int() {
        return Dynamic::from_float(n as f64);
    }
    if value.is_string() {
        if let Some(n) = parse_amount(&value.to_string()) {
            return Dynamic::from_float(n);
        }
    }
    Dynamic::UNIT
}

fn cell_value(cell: &Cell) -> Dynamic {
    match cell {
        Cell::Empty => Dynamic::UNIT,
        Cell::Bool(b) => Dynamic::from_bool(*b),
        Cell::Number(n) => Dynamic::from_float(*n),
        Cell::Text(s) => s.clone().into(),
    }
}

fn workbook_value(workbook: &DecodedWorkbook) -> Dynamic {
    let sheets: Array = workbook
        .sheets
        .iter()
        .map(|sheet| {
            let rows: Array = sheet
                .rows
                .iter()
                .map(|row| Dynamic::from_array(row.iter().map(cell_value).collect()))
                .collect();

            let mut map = Map::new();
            map.insert("name".into(), sheet.name.clone().into());
            map.insert("rows".into(), Dynamic::from_array(rows));
            Dynamic::from_map(map)
        })
        .collect();

    let mut map = Map::new();
    map.insert("name".into(), workbook.file_name.clone().into());
    map.insert("sheets".into(), Dynamic::from_array(sheets));
    Dynamic::from_map(map)
}

fn cell_from_value(value: Dynamic) -> Result<Cell, &'static str> {
    if value.is_unit() {
        Ok(Cell::Empty)
    } else if value.is_bool() {
        value.as_bool().map(Cell::Bool)
    } else if value.is_int() {
        value.as_int().map(|n| Cell::Number(n as f64))
    } else if value.is_float() {
        value.as_float().map(Cell::Number)
    } else if value.is_string() {
        value.into_string().map(Cell::Text)
    } else if value.is_char() {
        value.as_char().map(|c| Cell::Text(c.to_string()))
    } else {
        Err(value.type_name())
    }
}

/// Validate a script's return value into a result grid
fn grid_from_value(value: Dynamic) -> Result<ResultGrid, ExecError> {
    let rows = value.into_array().map_err(|found| {
        ExecError::InvalidResult(format!("expected an array of rows, got {}", found))
    })?;

    let mut grid = ResultGrid::empty();
    for (r, row) in rows.into_iter().enumerate() {
        let cells = row.into_array().map_err(|found| {
            ExecError::InvalidResult(format!("row {} is a {}, not an array", r, found))
        })?;

        let row = cells
            .into_iter()
            .enumerate()
            .map(|(c, value)| {
                cell_from_value(value).map_err(|found| {
                    ExecError::InvalidResult(format!(
                        "row {}, column {} holds an unsupported {}",
                        r, c, found
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        grid.push_row(row);
    }

    Ok(grid)
}

/// A comparison script fetched from the remote repository
pub struct ScriptedStrategy {
    name: String,
    source: String,
    limits: SandboxLimits,
}

impl ScriptedStrategy {
    pub fn new(name: impl Into<String>, source: impl Into<String>, limits: SandboxLimits) -> Self {
        ScriptedStrategy {
            name: name.into(),
            source: source.into(),
            limits,
        }
    }

    fn engine(&self, cancel: &CancelToken) -> Engine {
        let mut engine = Engine::new();

        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);

        let name = self.name.clone();
        engine.on_print(move |text| log::info!("script {}: {}", name, text));
        let name = self.name.clone();
        engine.on_debug(move |text, _, pos| log::debug!("script {} {}: {}", name, pos, text));

        let cancel = cancel.clone();
        let deadline = Instant::now() + self.limits.max_runtime;
        engine.on_progress(move |ops| {
            if ops % PROGRESS_CHECK_INTERVAL != 0 {
                None
            } else if cancel.is_cancelled() {
                Some("cancelled".into())
            } else if Instant::now() >= deadline {
                Some("deadline".into())
            } else {
                None
            }
        });

        engine
            .register_type_with_name::<XlsxApi>("Xlsx")
            .register_fn("sheet_names", sheet_names)
            .register_fn("sheet_rows", sheet_rows_by_index)
            .register_fn("sheet_rows", sheet_rows_by_name)
            .register_fn("to_number", to_number);

        engine
    }

    fn classify(&self, err: EvalAltResult, cancel: &CancelToken) -> ExecError {
        match err {
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => self.classify(*inner, cancel),
            EvalAltResult::ErrorTerminated(..) if cancel.is_cancelled() => ExecError::Cancelled,
            EvalAltResult::ErrorTerminated(..) => ExecError::LimitExceeded(format!(
                "ran longer than {} seconds",
                self.limits.max_runtime.as_secs()
            )),
            EvalAltResult::ErrorTooManyOperations(_) => {
                ExecError::LimitExceeded("too many operations".to_string())
            }
            EvalAltResult::ErrorStackOverflow(_) => {
                ExecError::LimitExceeded("call stack too deep".to_string())
            }
            EvalAltResult::ErrorDataTooLarge(what, _) => {
                ExecError::LimitExceeded(format!("{} too large", what))
            }
            other => ExecError::Runtime(other.to_string()),
        }
    }
}

impl ComparisonStrategy for ScriptedStrategy {
    fn key(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.name
    }

    fn compare(
        &self,
        first: &DecodedWorkbook,
        second: &DecodedWorkbook,
        cancel: &CancelToken,
    ) -> Result<ResultGrid, ExecError> {
        let engine = self.engine(cancel);

        let ast = engine
            .compile(&self.source)
            .map_err(|e| ExecError::Compile(e.to_string()))?;

        if !ast
            .iter_functions()
            .any(|f| f.name == ENTRY_POINT && f.params.len() == 3)
        {
            return Err(ExecError::MissingEntryPoint);
        }

        let started = Instant::now();
        let mut scope = Scope::new();
        let value = engine
            .call_fn::<Dynamic>(
                &mut scope,
                &ast,
                ENTRY_POINT,
                (XlsxApi, workbook_value(first), workbook_value(second)),
            )
            .map_err(|e| self.classify(*e, cancel))?;

        log::debug!(
            "script {} finished in {:?}",
            self.name,
            started.elapsed()
        );

        grid_from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{UploadedFile, decode};

    fn workbook(name: &str, text: &str) -> DecodedWorkbook {
        decode(&UploadedFile::new(name, text)).unwrap()
    }

    fn run(source: &str, limits: SandboxLimits, cancel: &CancelToken) -> Result<ResultGrid, ExecError> {
        let a = workbook("hub.csv", "Brand,Amount\nVisa,\"$1,200.50\"\nAmex,3\n");
        let b = workbook("sales.csv", "Brand,Amount\nVisa,1000\n");
        ScriptedStrategy::new("test", source, limits).compare(&a, &b, cancel)
    }

    #[test]
    fn script_result_becomes_grid() {
        let source = r#"
            fn compareAndDisplayData(xlsx, file1, file2) {
                let a = xlsx.sheet_rows(file1, 0);
                let b = xlsx.sheet_rows(file2, "Sheet1");
                let hub = xlsx.to_number(a[1][1]);
                let sales = xlsx.to_number(b[1][1]);
                [
                    ["File", "Sheets", "Rows"],
                    [file1.name, xlsx.sheet_names(file1)[0], a.len()],
                    [file2.name, (), b.len()],
                    ["Visa", hub, hub - sales],
                    ["Flag", true, -2],
                ]
            }
        "#;
        let grid = run(source, SandboxLimits::default(), &CancelToken::new()).unwrap();

        assert_eq!(grid.row_count(), 5);
        assert_eq!(grid.rows()[1][0], Cell::text("hub.csv"));
        assert_eq!(grid.rows()[1][1], Cell::text("Sheet1"));
        assert_eq!(grid.rows()[1][2], Cell::Number(3.0));
        assert_eq!(grid.rows()[2][1], Cell::Empty);
        assert_eq!(grid.rows()[3][1], Cell::Number(1200.5));
        assert_eq!(grid.rows()[3][2], Cell::Number(200.5));
        assert_eq!(grid.rows()[4][1], Cell::Bool(true));
        assert_eq!(grid.rows()[4][2], Cell::Number(-2.0));
    }

    #[test]
    fn missing_entry_point_is_reported_before_running() {
        let source = "fn compare(a, b) { [] }";
        let err = run(source, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::MissingEntryPoint));

        let wrong_arity = "fn compareAndDisplayData(a, b) { [] }";
        let err = run(wrong_arity, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::MissingEntryPoint));
    }

    #[test]
    fn syntax_errors_fail_compilation() {
        let source = "fn compareAndDisplayData(x, a, b) { [ }";
        let err = run(source, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::Compile(_)));
    }

    #[test]
    fn thrown_errors_surface_as_runtime_failures() {
        let source = r#"fn compareAndDisplayData(x, a, b) { throw "boom"; }"#;
        let err = run(source, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        match err {
            ExecError::Runtime(message) => assert!(message.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runaway_script_hits_operation_limit() {
        let limits = SandboxLimits {
            max_operations: 10_000,
            ..SandboxLimits::default()
        };
        let source = "fn compareAndDisplayData(x, a, b) { loop { } }";
        let err = run(source, limits, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::LimitExceeded(_)));
    }

    #[test]
    fn cancelled_script_terminates() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let source = "fn compareAndDisplayData(x, a, b) { loop { } }";
        let err = run(source, SandboxLimits::default(), &cancel).unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[test]
    fn modules_cannot_be_imported() {
        let source = r#"
            fn compareAndDisplayData(x, a, b) {
                import "secrets" as s;
                []
            }
        "#;
        let err = run(source, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::Runtime(_) | ExecError::Compile(_)));
    }

    #[test]
    fn non_grid_results_are_rejected() {
        let scalar = "fn compareAndDisplayData(x, a, b) { 42 }";
        let err = run(scalar, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::InvalidResult(_)));

        let nested_map = "fn compareAndDisplayData(x, a, b) { [[\"a\"], [#{ x: 1 }]] }";
        let err = run(nested_map, SandboxLimits::default(), &CancelToken::new()).unwrap_err();
        match err {
            ExecError::InvalidResult(message) => assert!(message.contains("row 1, column 0")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_array_is_an_empty_grid() {
        let source = "fn compareAndDisplayData(x, a, b) { [] }";
        let grid = run(source, SandboxLimits::default(), &CancelToken::new()).unwrap();
        assert!(grid.is_empty());
    }
}
