// src/structure/lines.rs

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, instrument, trace};

use crate::error::{FormError, Result};

/// `<heading>:<spaces><value>`, heading is everything up to the first colon.
static HEADING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?):\s*(.*)$").expect("static heading regex"));

/// Heading → values, in first-seen heading order.
///
/// Only produced by [`parse_lines`], so it always holds at least one heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingMap {
    entries: Vec<(String, Vec<String>)>,
    index: HashMap<String, usize>,
}

impl HeadingMap {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn push(&mut self, heading: &str, value: &str) {
        let slot = match self.index.get(heading) {
            Some(&i) => i,
            None => {
                self.entries.push((heading.to_string(), Vec::new()));
                self.index.insert(heading.to_string(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        self.entries[slot].1.push(value.to_string());
    }

    pub fn headings(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(h, _)| h.as_str())
    }

    pub fn values(&self, heading: &str) -> Option<&[String]> {
        self.index.get(heading).map(|&i| self.entries[i].1.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(h, v)| (h.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest value list; the number of rows reconciliation will produce.
    pub fn depth(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).max().unwrap_or(0)
    }
}

/// Split extracted text into lines and collect every `heading: value` line.
///
/// Each line is trimmed before matching. Lines without a colon are skipped.
/// Fails with [`FormError::EmptyExtraction`] when nothing matched.
#[instrument(level = "debug", skip(text), fields(text_len = text.len()))]
pub fn parse_lines(text: &str) -> Result<HeadingMap> {
    let mut map = HeadingMap::empty();
    let mut skipped = 0usize;

    for line in text.split('\n') {
        match HEADING_LINE.captures(line.trim()) {
            Some(caps) => {
                let heading = caps.get(1).map_or("", |m| m.as_str());
                let value = caps.get(2).map_or("", |m| m.as_str());
                trace!(heading, value, "matched line");
                map.push(heading, value);
            }
            None => skipped += 1,
        }
    }

    if map.is_empty() {
        debug!(skipped, "no heading lines");
        return Err(FormError::EmptyExtraction);
    }

    debug!(
        headings = map.len(),
        depth = map.depth(),
        skipped,
        "parsed heading lines"
    );
    Ok(map)
}
