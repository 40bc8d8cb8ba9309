use tracing::debug;

use super::HeadingMap;

/// Rectangular table: one column per heading, rows aligned positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTable {
    headings: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RowTable {
    pub fn headings(&self) -> &[String] {
        &self.headings
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn width(&self) -> usize {
        self.headings.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Flatten a [`HeadingMap`] into a [`RowTable`].
///
/// Row `i` takes the `i`-th value of every heading, or `""` when that heading
/// has fewer values. Runs in O(headings × depth).
pub fn reconcile(map: &HeadingMap) -> RowTable {
    let headings: Vec<String> = map.headings().map(str::to_string).collect();
    let depth = map.depth();

    let rows: Vec<Vec<String>> = (0..depth)
        .map(|i| {
            map.iter()
                .map(|(_, values)| values.get(i).cloned().unwrap_or_default())
                .collect()
        })
        .collect();

    debug!(columns = headings.len(), rows = rows.len(), "reconciled rows");
    RowTable { headings, rows }
}
