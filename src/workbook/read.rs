// src/workbook/read.rs

use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use std::path::Path;
use tracing::{debug, instrument};

use super::package::{Package, SheetScan};
use super::types::CellValue;
use crate::error::{FormError, Result};

fn to_cell(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::DateTime(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Error(e.to_string()),
    }
}

/// Cell values of one sheet (formula cells give their cached value).
fn sheet_values(path: &Path, sheet: &str) -> Result<Range<Data>> {
    let mut xlsx: Xlsx<_> = open_workbook(path).map_err(|e| FormError::persistence(path, e))?;
    xlsx.worksheet_range(sheet)
        .map_err(|e| FormError::persistence(path, e))
}

/// Text of the cell at 1-based `row`/`col`; absent cells read as `""`.
fn cell_text(range: &Range<Data>, row: u32, col: u32) -> String {
    range
        .get_value((row - 1, col - 1))
        .map(|d| to_cell(d).as_text())
        .unwrap_or_default()
}

/// Header names of a scanned sheet, empty headings included.
pub fn read_header(path: &Path, sheet: &str, scan: &SheetScan) -> Result<Vec<String>> {
    let Some(row) = scan.header_row else {
        return Ok(Vec::new());
    };
    let range = sheet_values(path, sheet)?;
    Ok((1..=scan.header_width)
        .map(|col| cell_text(&range, row, col))
        .collect())
}

/// Rows of one sheet rendered as text, from row 1 through the last row with
/// a value, for display and inspection.
#[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
pub fn read_sheet<P: AsRef<Path>>(path: P, sheet: &str) -> Result<Vec<Vec<String>>> {
    let path = path.as_ref();
    let mut package = Package::open(path)?;
    let part = package.sheet(sheet)?.ok_or_else(|| {
        FormError::persistence(path, format!("sheet `{}` not found", sheet))
    })?;
    let scan = package.scan(&part.part)?;
    drop(package);

    let range = sheet_values(path, sheet)?;
    let rows: Vec<Vec<String>> = (1..=scan.last_row)
        .map(|row| {
            (1..=scan.width)
                .map(|col| cell_text(&range, row, col))
                .collect()
        })
        .collect();
    debug!(rows = rows.len(), columns = scan.width, "read sheet");
    Ok(rows)
}
