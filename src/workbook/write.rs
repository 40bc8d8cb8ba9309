// src/workbook/write.rs

use quick_xml::escape::escape;
use std::{
    fmt::Write as _,
    fs::{self, File, Permissions},
    io::{Seek, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use super::types::{CellValue, Sheet, Workbook};
use crate::error::{Cause, FormError, Result};

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const NS_MAIN: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
pub(super) const NS_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const NS_PKG_REL: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
pub(super) const WORKSHEET_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";

/// Style index 1 in `styles.xml`: numFmt 22 (`m/d/yy h:mm`).
const DATE_STYLE: usize = 1;

const STYLES: &str = concat!(
    r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
    r#"<fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts>"#,
    r#"<fills count="2"><fill><patternFill patternType="none"/></fill>"#,
    r#"<fill><patternFill patternType="gray125"/></fill></fills>"#,
    r#"<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>"#,
    r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#,
    r#"<cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/>"#,
    r#"<xf numFmtId="22" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs>"#,
    r#"<cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles>"#,
    r#"</styleSheet>"#
);

/// Spreadsheet column letters for a 0-based index: 0 → A, 26 → AA.
pub fn column_name(mut idx: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

/// Drop characters XML 1.0 cannot carry (OCR output occasionally has them).
pub(super) fn xml_safe(s: &str) -> String {
    let clean: String = s
        .chars()
        .filter(|&c| matches!(c, '\t' | '\n' | '\r') || c >= ' ')
        .collect();
    if clean.len() != s.len() {
        debug!(
            removed = s.chars().count() - clean.chars().count(),
            value = %clean,
            "dropped control characters from cell text"
        );
    }
    clean
}

fn push_cell(out: &mut String, reference: &str, cell: &CellValue) {
    match cell {
        CellValue::Empty => {}
        CellValue::Text(s) => {
            let _ = write!(
                out,
                r#"<c r="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                reference,
                escape(&xml_safe(s))
            );
        }
        CellValue::Number(n) => {
            let _ = write!(out, r#"<c r="{}"><v>{}</v></c>"#, reference, n);
        }
        CellValue::DateTime(n) => {
            let _ = write!(
                out,
                r#"<c r="{}" s="{}"><v>{}</v></c>"#,
                reference, DATE_STYLE, n
            );
        }
        CellValue::Bool(b) => {
            let _ = write!(out, r#"<c r="{}" t="b"><v>{}</v></c>"#, reference, u8::from(*b));
        }
        CellValue::Error(e) => {
            let _ = write!(
                out,
                r#"<c r="{}" t="e"><v>{}</v></c>"#,
                reference,
                escape(&xml_safe(e))
            );
        }
    }
}

/// One `<row>` element. Only `Empty` cells are left out, so a row of empty
/// strings is still a present row.
pub(super) fn row_xml(row_number: usize, cells: &[CellValue]) -> String {
    let mut out = String::new();
    let _ = write!(out, r#"<row r="{}">"#, row_number);
    for (c, cell) in cells.iter().enumerate() {
        let reference = format!("{}{}", column_name(c), row_number);
        push_cell(&mut out, &reference, cell);
    }
    out.push_str("</row>");
    out
}

pub(super) fn sheet_xml(sheet: &Sheet) -> String {
    let mut out = String::new();
    let _ = write!(out, r#"{}<worksheet xmlns="{}"><sheetData>"#, XML_DECL, NS_MAIN);
    for (r, row) in sheet.rows.iter().enumerate() {
        if row.iter().all(|c| *c == CellValue::Empty) {
            continue;
        }
        out.push_str(&row_xml(r + 1, row));
    }
    out.push_str("</sheetData></worksheet>");
    out
}

fn content_types_xml(sheet_count: usize) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        concat!(
            r#"{}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
            r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
            r#"<Default Extension="xml" ContentType="application/xml"/>"#,
            r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
            r#"<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#
        ),
        XML_DECL
    );
    for i in 1..=sheet_count {
        let _ = write!(
            out,
            r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="{}"/>"#,
            i, WORKSHEET_CONTENT_TYPE
        );
    }
    out.push_str("</Types>");
    out
}

fn root_rels_xml() -> String {
    format!(
        r#"{}<Relationships xmlns="{}"><Relationship Id="rId1" Type="{}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
        XML_DECL, NS_PKG_REL, NS_REL
    )
}

fn workbook_xml(workbook: &Workbook) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        r#"{}<workbook xmlns="{}" xmlns:r="{}"><sheets>"#,
        XML_DECL, NS_MAIN, NS_REL
    );
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        let _ = write!(
            out,
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            escape(&xml_safe(&sheet.name)),
            i + 1,
            i + 1
        );
    }
    out.push_str("</sheets></workbook>");
    out
}

fn workbook_rels_xml(sheet_count: usize) -> String {
    let mut out = String::new();
    let _ = write!(out, r#"{}<Relationships xmlns="{}">"#, XML_DECL, NS_PKG_REL);
    for i in 1..=sheet_count {
        let _ = write!(
            out,
            r#"<Relationship Id="rId{}" Type="{}/worksheet" Target="worksheets/sheet{}.xml"/>"#,
            i, NS_REL, i
        );
    }
    let _ = write!(
        out,
        r#"<Relationship Id="rId{}" Type="{}/styles" Target="styles.xml"/>"#,
        sheet_count + 1,
        NS_REL
    );
    out.push_str("</Relationships>");
    out
}

/// Every part of a fresh package, keyed by zip entry name.
pub(super) fn package_parts(workbook: &Workbook) -> Vec<(String, String)> {
    let n = workbook.sheets.len();
    let mut parts: Vec<(String, String)> = vec![
        ("[Content_Types].xml".into(), content_types_xml(n)),
        ("_rels/.rels".into(), root_rels_xml()),
        ("xl/workbook.xml".into(), workbook_xml(workbook)),
        ("xl/_rels/workbook.xml.rels".into(), workbook_rels_xml(n)),
        ("xl/styles.xml".into(), format!("{}{}", XML_DECL, STYLES)),
    ];
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        parts.push((format!("xl/worksheets/sheet{}.xml", i + 1), sheet_xml(sheet)));
    }
    parts
}

/// Serialize `workbook` as an `.xlsx` package into `writer`.
pub fn encode_workbook<W: Write + Seek>(workbook: &Workbook, writer: W) -> zip::result::ZipResult<W> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(writer);
    for (name, body) in package_parts(workbook) {
        zip.start_file(name, options)?;
        zip.write_all(body.as_bytes())?;
    }
    zip.finish()
}

#[cfg(unix)]
fn new_file_permissions() -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<Permissions> {
    None
}

/// Fill a temp file in the target's directory, then rename it over `path`.
/// The target is either untouched or fully replaced, and keeps its mode
/// (new files get `0644`).
pub(super) fn write_atomically<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::result::Result<(), Cause>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let permissions = match fs::metadata(path) {
        Ok(meta) => Some(meta.permissions()),
        Err(_) => new_file_permissions(),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| FormError::persistence(path, e))?;
    fill(tmp.as_file_mut()).map_err(|e| FormError::persistence(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FormError::persistence(path, e))?;
    if let Some(permissions) = permissions {
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(|e| FormError::persistence(path, e))?;
    }
    tmp.persist(path)
        .map_err(|e| FormError::persistence(path, e.error))?;
    Ok(())
}

/// Write `workbook` to `path` as a new package, atomically.
#[instrument(level = "debug", skip(workbook, path), fields(path = %path.as_ref().display()))]
pub fn write_workbook<P: AsRef<Path>>(workbook: &Workbook, path: P) -> Result<()> {
    let path = path.as_ref();
    write_atomically(path, |file| {
        encode_workbook(workbook, file)
            .map(|_| ())
            .map_err(Into::into)
    })?;
    debug!(sheets = workbook.sheets.len(), "wrote workbook");
    Ok(())
}
