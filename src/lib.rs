/*!
# grbalance

Payment reconciliation service: two spreadsheets in, one comparison table out.

## Overview

A signed-in user uploads two spreadsheet files (xlsx, xls, ods or CSV), picks a
comparison script and runs it. The result is a table whose first row is the
header; numeric cells are highlighted by sign, and the table can be downloaded
as `Comparison_Results.xlsx` or as CSV.

## Architecture

### Comparison pipeline
- **loader**: Spreadsheet decoder, sniffs the format from the content and
  produces typed cell grids per sheet
- **strategy**: Comparison strategies behind one trait. Built-in strategies
  are compiled in; remote scripts run in a bounded `rhai` sandbox
- **fetcher**: Reads remote script text from a GitHub repository
- **pipeline**: Decode, resolve and execute with cancellation and progress
- **presenter**: Header/data split and sign highlighting
- **downloader**: XLSX and CSV export

### Session layer
- **shell**: Per-session state machine (views, form phases, status line)
  with generation-guarded comparison results
- **login**: Identity provider trait, local user store, session store and
  authentication handlers
- **firebase**: Firebase Authentication REST backend

### Web layer
- **app**: Routing, middleware, page rendering and JSON endpoints
- **config**: Settings from defaults, TOML file and environment
*/

pub mod app;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod firebase;
pub mod grid;
pub mod loader;
pub mod login;
pub mod pipeline;
pub mod presenter;
pub mod shell;
pub mod strategy;
