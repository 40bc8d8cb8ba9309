// src/workbook/merge.rs

use std::path::Path;
use tracing::{info, instrument, warn};

use super::{
    lock::MergeLock,
    package::Package,
    read::read_header,
    types::{CellValue, Sheet, Workbook},
    write::write_workbook,
};
use crate::config::HeaderPolicy;
use crate::error::{FormError, Result};
use crate::structure::RowTable;

/// Which state the target was in, and therefore what the merge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// No file existed; a new workbook was created.
    Created,
    /// The sheet existed but was blank; header and rows were written.
    FilledEmptySheet,
    /// Rows were appended below existing content.
    Appended,
    /// The file existed without the sheet; the sheet was added.
    AddedSheet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub action: MergeAction,
    /// 1-based spreadsheet row of the first data row written.
    pub first_row: usize,
    pub rows_written: usize,
}

/// True when `path` carries the `.xlsx` extension (any case).
pub fn has_xlsx_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("xlsx"))
}

fn text_row(cells: &[String]) -> Vec<CellValue> {
    cells.iter().map(|c| CellValue::Text(c.clone())).collect()
}

/// Header row followed by every data row.
fn fresh_rows(table: &RowTable) -> Vec<Vec<CellValue>> {
    std::iter::once(text_row(table.headings()))
        .chain(table.rows().iter().map(|r| text_row(r)))
        .collect()
}

/// Line the table's rows up with an existing header row according to `policy`.
fn align_rows(
    sheet: &str,
    header: &[String],
    table: &RowTable,
    policy: HeaderPolicy,
) -> Result<Vec<Vec<CellValue>>> {
    let mismatch = || FormError::HeaderMismatch {
        sheet: sheet.to_string(),
        header: header.to_vec(),
        headings: table.headings().to_vec(),
    };

    match policy {
        HeaderPolicy::Positional => {
            if header != table.headings() {
                warn!(
                    sheet,
                    ?header,
                    headings = ?table.headings(),
                    "appending rows positionally under a different header"
                );
            }
            Ok(table.rows().iter().map(|r| text_row(r)).collect())
        }
        HeaderPolicy::Strict => {
            if header != table.headings() {
                return Err(mismatch());
            }
            Ok(table.rows().iter().map(|r| text_row(r)).collect())
        }
        HeaderPolicy::ByName => {
            if table
                .headings()
                .iter()
                .any(|h| !header.iter().any(|existing| existing == h))
            {
                return Err(mismatch());
            }
            // position in the table for every header column, if present
            let source: Vec<Option<usize>> = header
                .iter()
                .map(|name| table.headings().iter().position(|h| h == name))
                .collect();
            Ok(table
                .rows()
                .iter()
                .map(|row| {
                    source
                        .iter()
                        .map(|src| {
                            CellValue::Text(src.map(|i| row[i].clone()).unwrap_or_default())
                        })
                        .collect()
                })
                .collect())
        }
    }
}

/// Patch an existing package: only the target worksheet (or, for a new
/// sheet, the sheet list) changes. Every other part is copied as is.
fn merge_existing(
    path: &Path,
    sheet_name: &str,
    table: &RowTable,
    policy: HeaderPolicy,
) -> Result<MergeOutcome> {
    let mut package = Package::open(path)?;

    let outcome = match package.sheet(sheet_name)? {
        None => {
            package.add_sheet(sheet_name, fresh_rows(table))?;
            MergeOutcome {
                action: MergeAction::AddedSheet,
                first_row: 2,
                rows_written: table.len(),
            }
        }
        Some(sheet) => {
            let scan = package.scan(&sheet.part)?;
            if scan.is_blank() {
                package.append_rows(&sheet.part, 1, &fresh_rows(table))?;
                MergeOutcome {
                    action: MergeAction::FilledEmptySheet,
                    first_row: 2,
                    rows_written: table.len(),
                }
            } else {
                let header = read_header(path, sheet_name, &scan)?;
                let rows = align_rows(sheet_name, &header, table, policy)?;
                let at = scan.last_row + 1;
                package.append_rows(&sheet.part, at, &rows)?;
                MergeOutcome {
                    action: MergeAction::Appended,
                    first_row: at as usize,
                    rows_written: table.len(),
                }
            }
        }
    };

    package.save()?;
    Ok(outcome)
}

/// Merge `table` into the spreadsheet at `path`, creating it if absent.
///
/// Existing rows, the existing header row, and every other part of the file
/// (formulas, styles, other sheets) are left as they were. The whole
/// read-modify-write runs under [`MergeLock`] and ends in a single atomic
/// replace of the file, which keeps its permissions.
///
/// The lock lives in a sidecar `<path>.lock` file that is created on first
/// use and stays next to the spreadsheet afterwards.
#[instrument(level = "info", skip(path, table), fields(path = %path.as_ref().display(), rows = table.len()))]
pub fn merge_rows<P: AsRef<Path>>(
    path: P,
    sheet_name: &str,
    table: &RowTable,
    policy: HeaderPolicy,
) -> Result<MergeOutcome> {
    let path = path.as_ref();
    if !has_xlsx_extension(path) {
        return Err(FormError::InvalidOutputFormat {
            path: path.to_path_buf(),
        });
    }

    let _lock = MergeLock::acquire(path).map_err(|e| FormError::persistence(path, e))?;

    let outcome = if path.exists() {
        merge_existing(path, sheet_name, table, policy)?
    } else {
        let mut sheet = Sheet::new(sheet_name);
        sheet.rows = fresh_rows(table);
        write_workbook(
            &Workbook {
                sheets: vec![sheet],
            },
            path,
        )?;
        MergeOutcome {
            action: MergeAction::Created,
            first_row: 2,
            rows_written: table.len(),
        }
    };

    info!(
        action = ?outcome.action,
        first_row = outcome.first_row,
        rows = outcome.rows_written,
        "merged rows"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{parse_lines, reconcile};
    use crate::workbook::read::read_sheet;
    use crate::workbook::write::package_parts;
    use anyhow::Result;
    use std::fs;
    use std::io::{Read, Write};
    use tempfile::tempdir;
    use zip::{write::SimpleFileOptions, ZipArchive, ZipWriter};

    fn table(text: &str) -> RowTable {
        reconcile(&parse_lines(text).unwrap())
    }

    #[test]
    fn extension_check() {
        assert!(has_xlsx_extension(Path::new("out.xlsx")));
        assert!(has_xlsx_extension(Path::new("dir/OUT.XLSX")));
        assert!(!has_xlsx_extension(Path::new("output.csv")));
        assert!(!has_xlsx_extension(Path::new("output")));
        assert!(!has_xlsx_extension(Path::new("output.xls")));
    }

    #[test]
    fn absent_target_is_created() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        let t = table("Name: Alice\nAge: 30\nName: Bob\nAge: 25\n");

        let outcome = merge_rows(&path, "Sheet1", &t, HeaderPolicy::ByName)?;
        assert_eq!(outcome.action, MergeAction::Created);
        assert_eq!(outcome.first_row, 2);
        assert_eq!(outcome.rows_written, 2);

        assert_eq!(
            read_sheet(&path, "Sheet1")?,
            vec![
                vec!["Name", "Age"],
                vec!["Alice", "30"],
                vec!["Bob", "25"],
            ]
        );
        Ok(())
    }

    #[test]
    fn append_keeps_prior_rows() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice\nAge: 30"), HeaderPolicy::ByName)?;
        let before = read_sheet(&path, "Sheet1")?;

        let second = table("Name: Bob\nAge: 25\nName: Carol\nAge: 41");
        let outcome = merge_rows(&path, "Sheet1", &second, HeaderPolicy::ByName)?;
        assert_eq!(outcome.action, MergeAction::Appended);
        assert_eq!(outcome.first_row, 3);

        let after = read_sheet(&path, "Sheet1")?;
        assert_eq!(after.len(), before.len() + second.len());
        assert_eq!(&after[..before.len()], &before[..]);
        assert_eq!(after[3], vec!["Carol", "41"]);
        Ok(())
    }

    #[test]
    fn by_name_reorders_and_pads() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(
            &path,
            "Sheet1",
            &table("Name: Alice\nAge: 30\nCity: Paris"),
            HeaderPolicy::ByName,
        )?;
        merge_rows(&path, "Sheet1", &table("City: Oslo\nName: Bob"), HeaderPolicy::ByName)?;

        let rows = read_sheet(&path, "Sheet1")?;
        assert_eq!(rows[0], vec!["Name", "Age", "City"]);
        assert_eq!(rows[2], vec!["Bob", "", "Oslo"]);
        Ok(())
    }

    #[test]
    fn by_name_rejects_unknown_heading_without_writing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        let bytes = fs::read(&path)?;

        let err = merge_rows(&path, "Sheet1", &table("Name: Bob\nPhone: 555"), HeaderPolicy::ByName)
            .unwrap_err();
        assert!(matches!(err, FormError::HeaderMismatch { .. }));
        assert_eq!(fs::read(&path)?, bytes);
        Ok(())
    }

    #[test]
    fn strict_requires_identical_header() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice\nAge: 30"), HeaderPolicy::Strict)?;

        let reordered = table("Age: 31\nName: Bob");
        assert!(matches!(
            merge_rows(&path, "Sheet1", &reordered, HeaderPolicy::Strict),
            Err(FormError::HeaderMismatch { .. })
        ));
        merge_rows(&path, "Sheet1", &table("Name: Bob\nAge: 31"), HeaderPolicy::Strict)?;
        assert_eq!(read_sheet(&path, "Sheet1")?.len(), 3);
        Ok(())
    }

    #[test]
    fn positional_appends_blindly() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice\nAge: 30"), HeaderPolicy::Positional)?;
        merge_rows(&path, "Sheet1", &table("Phone: 555"), HeaderPolicy::Positional)?;

        let rows = read_sheet(&path, "Sheet1")?;
        assert_eq!(rows[0], vec!["Name", "Age"]);
        assert_eq!(rows[2][0], "555");
        Ok(())
    }

    #[test]
    fn missing_sheet_is_added_and_others_kept() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Archive", &table("Old: 1"), HeaderPolicy::ByName)?;

        let outcome = merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        assert_eq!(outcome.action, MergeAction::AddedSheet);
        assert_eq!(read_sheet(&path, "Archive")?, vec![vec!["Old"], vec!["1"]]);
        assert_eq!(read_sheet(&path, "Sheet1")?, vec![vec!["Name"], vec!["Alice"]]);
        Ok(())
    }

    #[test]
    fn blank_sheet_gets_header() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        write_workbook(
            &Workbook {
                sheets: vec![Sheet::new("Sheet1")],
            },
            &path,
        )?;

        let outcome = merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::Strict)?;
        assert_eq!(outcome.action, MergeAction::FilledEmptySheet);
        assert_eq!(read_sheet(&path, "Sheet1")?, vec![vec!["Name"], vec!["Alice"]]);
        Ok(())
    }

    #[test]
    fn wrong_extension_touches_nothing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.csv");
        let err = merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)
            .unwrap_err();
        assert!(matches!(err, FormError::InvalidOutputFormat { .. }));
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn corrupt_target_is_persistence_error_and_left_alone() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        fs::write(&path, b"not a zip archive")?;

        let err = merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)
            .unwrap_err();
        assert!(matches!(err, FormError::Persistence { .. }));
        assert_eq!(fs::read(&path)?, b"not a zip archive");
        Ok(())
    }

    /// One-sheet package whose `Sheet1` body is `sheet1`.
    fn write_fixture(path: &Path, sheet1: &str) -> Result<()> {
        let workbook = Workbook {
            sheets: vec![Sheet::new("Sheet1")],
        };
        let mut zip = ZipWriter::new(fs::File::create(path)?);
        for (name, body) in package_parts(&workbook) {
            let body = if name == "xl/worksheets/sheet1.xml" {
                sheet1.to_string()
            } else {
                body
            };
            zip.start_file(name, SimpleFileOptions::default())?;
            zip.write_all(body.as_bytes())?;
        }
        zip.finish()?;
        Ok(())
    }

    fn read_part(path: &Path, name: &str) -> Result<String> {
        let mut archive = ZipArchive::new(fs::File::open(path)?)?;
        let mut body = String::new();
        archive.by_name(name)?.read_to_string(&mut body)?;
        Ok(body)
    }

    #[test]
    fn blank_form_rows_are_written_and_counted() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        let blank = table("Name:\nAge:\n");
        assert_eq!(blank.rows(), [vec!["", ""]]);

        let first = merge_rows(&path, "Sheet1", &blank, HeaderPolicy::ByName)?;
        assert_eq!(first.rows_written, 1);
        assert_eq!(
            read_sheet(&path, "Sheet1")?,
            vec![vec!["Name", "Age"], vec!["", ""]]
        );

        let second = merge_rows(&path, "Sheet1", &blank, HeaderPolicy::ByName)?;
        assert_eq!(second.action, MergeAction::Appended);
        assert_eq!(second.first_row, 3);
        assert_eq!(read_sheet(&path, "Sheet1")?.len(), 3);

        let third = merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        assert_eq!(third.first_row, 4);
        assert_eq!(read_sheet(&path, "Sheet1")?[3], vec!["Alice", ""]);
        Ok(())
    }

    #[test]
    fn empty_heading_survives_identical_rerun() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        let t = table("Name: Alice\n: x\n");
        assert_eq!(t.headings(), ["Name", ""]);

        merge_rows(&path, "Sheet1", &t, HeaderPolicy::ByName)?;
        let again = merge_rows(&path, "Sheet1", &t, HeaderPolicy::ByName)?;
        assert_eq!(again.action, MergeAction::Appended);
        merge_rows(&path, "Sheet1", &t, HeaderPolicy::Strict)?;

        assert_eq!(
            read_sheet(&path, "Sheet1")?,
            vec![
                vec!["Name", ""],
                vec!["Alice", "x"],
                vec!["Alice", "x"],
                vec!["Alice", "x"],
            ]
        );
        Ok(())
    }

    #[test]
    fn formulas_styles_and_other_parts_survive_append() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        write_fixture(
            &path,
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
                r#"<dimension ref="A1:B2"/>"#,
                r#"<cols><col min="1" max="1" width="30" customWidth="1"/></cols>"#,
                r#"<sheetData>"#,
                r#"<row r="1"><c r="A1" t="inlineStr"><is><t>Name</t></is></c><c r="B1" t="inlineStr"><is><t>Total</t></is></c></row>"#,
                r#"<row r="2"><c r="A2" t="inlineStr"><is><t>Alice</t></is></c><c r="B2" s="1"><f>10+20</f><v>30</v></c></row>"#,
                r#"</sheetData>"#,
                r#"<mergeCells count="1"><mergeCell ref="C1:D1"/></mergeCells>"#,
                r#"</worksheet>"#
            ),
        )?;
        let styles = read_part(&path, "xl/styles.xml")?;

        let outcome = merge_rows(&path, "Sheet1", &table("Total: 5\nName: Bob"), HeaderPolicy::ByName)?;
        assert_eq!(outcome.action, MergeAction::Appended);
        assert_eq!(outcome.first_row, 3);

        let sheet1 = read_part(&path, "xl/worksheets/sheet1.xml")?;
        assert!(sheet1.contains(r#"<c r="B2" s="1"><f>10+20</f><v>30</v></c>"#));
        assert!(sheet1.contains(r#"<col min="1" max="1" width="30" customWidth="1"/>"#));
        assert!(sheet1.contains(r#"<mergeCell ref="C1:D1"/>"#));
        assert!(sheet1.contains(r#"<dimension ref="A1:B3"/>"#));
        assert_eq!(read_part(&path, "xl/styles.xml")?, styles);

        assert_eq!(
            read_sheet(&path, "Sheet1")?,
            vec![
                vec!["Name", "Total"],
                vec!["Alice", "30"],
                vec!["Bob", "5"],
            ]
        );
        Ok(())
    }

    #[test]
    fn added_sheet_keeps_existing_sheet_bytes() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Archive", &table("Old: 1"), HeaderPolicy::ByName)?;
        let archive_part = read_part(&path, "xl/worksheets/sheet1.xml")?;

        merge_rows(&path, "Intake", &table("Name: Alice"), HeaderPolicy::ByName)?;
        merge_rows(&path, "Intake", &table("Name: Bob"), HeaderPolicy::ByName)?;

        assert_eq!(read_part(&path, "xl/worksheets/sheet1.xml")?, archive_part);
        assert!(read_part(&path, "[Content_Types].xml")?.contains("/xl/worksheets/sheet2.xml"));
        assert_eq!(
            read_sheet(&path, "Intake")?,
            vec![vec!["Name"], vec!["Alice"], vec!["Bob"]]
        );
        Ok(())
    }

    #[test]
    fn styled_blank_rows_are_replaced_in_order() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        write_fixture(
            &path,
            concat!(
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
                r#"<sheetData><row r="3" ht="30" customHeight="1"><c r="A3" s="1"/></row></sheetData>"#,
                r#"</worksheet>"#
            ),
        )?;

        let outcome = merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        assert_eq!(outcome.action, MergeAction::FilledEmptySheet);
        assert!(!read_part(&path, "xl/worksheets/sheet1.xml")?.contains(r#"r="3""#));
        assert_eq!(read_sheet(&path, "Sheet1")?, vec![vec!["Name"], vec!["Alice"]]);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn merge_keeps_file_mode() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o644);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o640))?;
        merge_rows(&path, "Sheet1", &table("Name: Bob"), HeaderPolicy::ByName)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o640);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn read_only_directory_is_persistence_error_and_file_unchanged() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        let bytes = fs::read(&path)?;

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555))?;
        // privileged users can still create files here; nothing to check then
        if fs::write(dir.path().join("writable"), b"").is_ok() {
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        let result = merge_rows(&path, "Sheet1", &table("Name: Bob"), HeaderPolicy::ByName);
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;

        assert!(matches!(result, Err(FormError::Persistence { .. })));
        assert_eq!(fs::read(&path)?, bytes);
        assert_eq!(read_sheet(&path, "Sheet1")?.len(), 2);
        Ok(())
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn held_lock_is_persistence_error_and_file_unchanged() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output.xlsx");
        merge_rows(&path, "Sheet1", &table("Name: Alice"), HeaderPolicy::ByName)?;
        let bytes = fs::read(&path)?;

        let other_writer = MergeLock::acquire(&path)?;
        let err = merge_rows(&path, "Sheet1", &table("Name: Bob"), HeaderPolicy::ByName)
            .unwrap_err();
        assert!(matches!(err, FormError::Persistence { .. }));
        assert_eq!(fs::read(&path)?, bytes);

        drop(other_writer);
        merge_rows(&path, "Sheet1", &table("Name: Bob"), HeaderPolicy::ByName)?;
        assert_eq!(read_sheet(&path, "Sheet1")?.len(), 3);
        Ok(())
    }
}
