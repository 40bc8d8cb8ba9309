// src/workbook/package.rs

use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, trace};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use super::types::{CellValue, Sheet};
use super::write::{
    column_name, row_xml, sheet_xml, write_atomically, xml_safe, NS_REL, WORKSHEET_CONTENT_TYPE,
};
use crate::error::{Cause, FormError, Result};

const CONTENT_TYPES: &str = "[Content_Types].xml";
const WORKBOOK: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";

/// A worksheet as listed in `xl/workbook.xml`, resolved to its zip entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPart {
    pub name: String,
    pub sheet_id: u32,
    pub part: String,
}

/// Shape of a worksheet's data. Only cells carrying a value (`<v>`, `<is>` or
/// `<f>`) count; style-only cells do not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheetScan {
    /// 1-based number of the last row with a value, 0 when there is none.
    pub last_row: u32,
    /// First row with a value.
    pub header_row: Option<u32>,
    /// Column count up to the last valued cell of the header row.
    pub header_width: u32,
    /// Column count up to the last valued cell of any row.
    pub width: u32,
}

impl SheetScan {
    pub fn is_blank(&self) -> bool {
        self.header_row.is_none()
    }

    fn mark(&mut self, row: u32, col: u32) {
        self.last_row = self.last_row.max(row);
        self.width = self.width.max(col);
        match self.header_row {
            None => {
                self.header_row = Some(row);
                self.header_width = col;
            }
            Some(h) if h == row => self.header_width = self.header_width.max(col),
            Some(_) => {}
        }
    }
}

/// An existing `.xlsx` file opened for patching. Parts that are not edited
/// are copied into the new file byte for byte.
pub struct Package {
    path: PathBuf,
    archive: ZipArchive<File>,
    edits: BTreeMap<String, String>,
}

impl Package {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| FormError::persistence(path, e))?;
        let archive = ZipArchive::new(file).map_err(|e| FormError::persistence(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            edits: BTreeMap::new(),
        })
    }

    fn broken(&self, e: impl Into<Cause>) -> FormError {
        FormError::persistence(&self.path, e)
    }

    /// Text of a part, with pending edits applied.
    pub fn part(&mut self, name: &str) -> Result<String> {
        if let Some(body) = self.edits.get(name) {
            return Ok(body.clone());
        }
        let path = self.path.clone();
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|e| FormError::persistence(&path, format!("{}: {}", name, e)))?;
        let mut body = String::new();
        entry
            .read_to_string(&mut body)
            .map_err(|e| FormError::persistence(&path, e))?;
        Ok(body)
    }

    fn has_part(&self, name: &str) -> bool {
        self.edits.contains_key(name) || self.archive.file_names().any(|n| n == name)
    }

    /// Worksheets in tab order.
    pub fn sheets(&mut self) -> Result<Vec<SheetPart>> {
        let workbook = self.part(WORKBOOK)?;
        let rels = self.part(WORKBOOK_RELS)?;
        let targets = relationship_targets(&rels).map_err(|e| self.broken(e))?;
        let entries = sheet_entries(&workbook).map_err(|e| self.broken(e))?;

        Ok(entries
            .into_iter()
            .filter_map(|(name, sheet_id, rel)| {
                targets.get(&rel).map(|target| SheetPart {
                    name,
                    sheet_id,
                    part: resolve_target(target),
                })
            })
            .collect())
    }

    pub fn sheet(&mut self, name: &str) -> Result<Option<SheetPart>> {
        Ok(self.sheets()?.into_iter().find(|s| s.name == name))
    }

    pub fn scan(&mut self, part: &str) -> Result<SheetScan> {
        let xml = self.part(part)?;
        scan_sheet(&xml).map_err(|e| self.broken(e))
    }

    /// Write `rows` into `part` from 1-based row `first_row` on. Valueless
    /// row elements at or past `first_row` are replaced.
    pub fn append_rows(&mut self, part: &str, first_row: u32, rows: &[Vec<CellValue>]) -> Result<()> {
        let xml = self.part(part)?;
        let scan = scan_sheet(&xml).map_err(|e| self.broken(e))?;
        let patched = append_rows_xml(&xml, first_row, rows, &scan).map_err(|e| self.broken(e))?;
        trace!(part, first_row, rows = rows.len(), "patched worksheet");
        self.edits.insert(part.to_string(), patched);
        Ok(())
    }

    /// Register a new worksheet holding `rows` after the existing ones.
    pub fn add_sheet(&mut self, name: &str, rows: Vec<Vec<CellValue>>) -> Result<SheetPart> {
        let sheets = self.sheets()?;
        let rels = self.part(WORKBOOK_RELS)?;
        let rel_ids = relationship_targets(&rels).map_err(|e| self.broken(e))?;

        let mut n = sheets.len() + 1;
        while self.has_part(&format!("xl/worksheets/sheet{}.xml", n)) {
            n += 1;
        }
        let part = format!("xl/worksheets/sheet{}.xml", n);

        let mut r = rel_ids.len() + 1;
        while rel_ids.contains_key(&format!("rId{}", r)) {
            r += 1;
        }
        let rel = format!("rId{}", r);
        let sheet_id = sheets.iter().map(|s| s.sheet_id).max().unwrap_or(0) + 1;

        let workbook = self.part(WORKBOOK)?;
        let entry = format!(
            r#"<sheet name="{}" sheetId="{}" r:id="{}"/>"#,
            escape(&xml_safe(name)),
            sheet_id,
            rel
        );
        let workbook = insert_into(&workbook, b"sheets", &entry).map_err(|e| self.broken(e))?;

        let relationship = format!(
            r#"<Relationship Id="{}" Type="{}/worksheet" Target="worksheets/sheet{}.xml"/>"#,
            rel, NS_REL, n
        );
        let rels = insert_into(&rels, b"Relationships", &relationship).map_err(|e| self.broken(e))?;

        let types = self.part(CONTENT_TYPES)?;
        let over = format!(
            r#"<Override PartName="/{}" ContentType="{}"/>"#,
            part, WORKSHEET_CONTENT_TYPE
        );
        let types = insert_into(&types, b"Types", &over).map_err(|e| self.broken(e))?;

        let mut sheet = Sheet::new(name);
        sheet.rows = rows;
        self.edits.insert(part.clone(), sheet_xml(&sheet));
        self.edits.insert(WORKBOOK.to_string(), workbook);
        self.edits.insert(WORKBOOK_RELS.to_string(), rels);
        self.edits.insert(CONTENT_TYPES.to_string(), types);

        debug!(sheet = name, part = %part, "added worksheet");
        Ok(SheetPart {
            name: name.to_string(),
            sheet_id,
            part,
        })
    }

    fn copy_into<W: Write + Seek>(&mut self, out: W) -> zip::result::ZipResult<W> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(out);
        for i in 0..self.archive.len() {
            let entry = self.archive.by_index_raw(i)?;
            match self.edits.remove(entry.name()) {
                Some(body) => {
                    let name = entry.name().to_string();
                    drop(entry);
                    zip.start_file(name, options)?;
                    zip.write_all(body.as_bytes())?;
                }
                None => zip.raw_copy_file(entry)?,
            }
        }
        for (name, body) in std::mem::take(&mut self.edits) {
            zip.start_file(name, options)?;
            zip.write_all(body.as_bytes())?;
        }
        zip.finish()
    }

    /// Replace the file on disk with the patched package.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display(), parts = self.edits.len()))]
    pub fn save(self) -> Result<()> {
        let path = self.path.clone();
        write_atomically(&path, move |file| {
            let mut package = self;
            package.copy_into(file)?;
            // the source archive is closed before the rename
            drop(package);
            Ok(())
        })
    }
}

fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn is(e: &BytesStart, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

/// `(name, sheetId, relationship id)` for every `<sheet>` of a workbook part.
fn sheet_entries(xml: &str) -> std::result::Result<Vec<(String, u32, String)>, Cause> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if is(&e, b"sheet") => {
                let name = attr(&e, b"name");
                let sheet_id = attr(&e, b"sheetId")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let rel = e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.prefix().is_some() && a.key.local_name().as_ref() == b"id")
                    .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                if let (Some(name), Some(rel)) = (name, rel) {
                    out.push((name, sheet_id, rel));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn relationship_targets(xml: &str) -> std::result::Result<HashMap<String, String>, Cause> {
    let mut reader = Reader::from_str(xml);
    let mut out = HashMap::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if is(&e, b"Relationship") => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    out.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Relationship targets are relative to `xl/` unless absolute.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

/// 1-based column of a cell reference: `B7` → 2, `AA1` → 27.
fn reference_column(reference: &str) -> Option<u32> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .collect();
    if letters.is_empty() {
        return None;
    }
    Some(
        letters
            .iter()
            .fold(0, |acc, b| acc * 26 + u32::from(b.to_ascii_uppercase() - b'A') + 1),
    )
}

fn row_number(e: &BytesStart, previous: u32) -> u32 {
    attr(e, b"r")
        .and_then(|v| v.parse().ok())
        .unwrap_or(previous + 1)
}

fn cell_column(e: &BytesStart, previous: u32) -> u32 {
    attr(e, b"r")
        .and_then(|r| reference_column(&r))
        .unwrap_or(previous + 1)
}

pub fn scan_sheet(xml: &str) -> std::result::Result<SheetScan, Cause> {
    let mut reader = Reader::from_str(xml);
    let mut scan = SheetScan::default();
    let (mut row, mut col) = (0u32, 0u32);
    let mut in_cell = false;
    let mut valued = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if is(&e, b"row") => {
                row = row_number(&e, row);
                col = 0;
            }
            Event::Start(e) if is(&e, b"c") => {
                col = cell_column(&e, col);
                in_cell = true;
                valued = false;
            }
            Event::Empty(e) if is(&e, b"c") => {
                col = cell_column(&e, col);
            }
            Event::Start(e) | Event::Empty(e)
                if in_cell && (is(&e, b"v") || is(&e, b"is") || is(&e, b"f")) =>
            {
                valued = true;
            }
            Event::End(e) if e.local_name().as_ref() == b"c" => {
                if valued {
                    scan.mark(row, col);
                }
                in_cell = false;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(scan)
}

/// Copy `xml`, putting `fragment` at the end of the first `container` element.
fn insert_into(xml: &str, container: &[u8], fragment: &str) -> std::result::Result<String, Cause> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut inserted = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::End(e) if !inserted && e.local_name().as_ref() == container => {
                writer.get_mut().extend_from_slice(fragment.as_bytes());
                writer.write_event(Event::End(e))?;
                inserted = true;
            }
            Event::Empty(e) if !inserted && is(&e, container) => {
                let end = BytesEnd::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                writer.write_event(Event::Start(e))?;
                writer.get_mut().extend_from_slice(fragment.as_bytes());
                writer.write_event(Event::End(end))?;
                inserted = true;
            }
            event => writer.write_event(event)?,
        }
    }

    if !inserted {
        return Err(format!("no <{}> element", String::from_utf8_lossy(container)).into());
    }
    Ok(String::from_utf8(writer.into_inner())?)
}

/// Copy a worksheet, dropping row elements numbered `first_row` or later
/// (they hold no values), adding `rows` at the end of `<sheetData>`, and
/// widening `<dimension>` to cover them.
fn append_rows_xml(
    xml: &str,
    first_row: u32,
    rows: &[Vec<CellValue>],
    scan: &SheetScan,
) -> std::result::Result<String, Cause> {
    let fragment: String = rows
        .iter()
        .enumerate()
        .map(|(i, r)| row_xml(first_row as usize + i, r))
        .collect();
    let last = (first_row as usize + rows.len())
        .saturating_sub(1)
        .max(scan.last_row as usize)
        .max(1);
    let width = rows
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .max(scan.width as usize)
        .max(1);
    let dimension = format!("A1:{}{}", column_name(width - 1), last);

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut row = 0u32;
    let mut inserted = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) if is(&e, b"row") => {
                row = row_number(&e, row);
                if row >= first_row {
                    reader.read_to_end(e.name())?;
                    continue;
                }
                writer.write_event(Event::Start(e))?;
            }
            Event::Empty(e) if is(&e, b"row") => {
                row = row_number(&e, row);
                if row < first_row {
                    writer.write_event(Event::Empty(e))?;
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"sheetData" => {
                writer.get_mut().extend_from_slice(fragment.as_bytes());
                writer.write_event(Event::End(e))?;
                inserted = true;
            }
            Event::Empty(e) if is(&e, b"sheetData") => {
                let end = BytesEnd::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                writer.write_event(Event::Start(e))?;
                writer.get_mut().extend_from_slice(fragment.as_bytes());
                writer.write_event(Event::End(end))?;
                inserted = true;
            }
            Event::Empty(e) if is(&e, b"dimension") => {
                let mut updated =
                    BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                updated.push_attribute(("ref", dimension.as_str()));
                writer.write_event(Event::Empty(updated))?;
            }
            event => writer.write_event(event)?,
        }
    }

    if !inserted {
        return Err("worksheet has no <sheetData>".into());
    }
    Ok(String::from_utf8(writer.into_inner())?)
}
