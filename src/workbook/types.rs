/// A single cell value, as written into a fresh sheet or read back for display.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// No `<c>` element at all. `Text("")` is a present, empty cell.
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Excel serial date, written with a date number format.
    DateTime(f64),
    /// Error literal such as `#DIV/0!`.
    Error(String),
}

impl CellValue {
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) | CellValue::Error(s) => s.clone(),
            CellValue::Number(n) | CellValue::DateTime(n) => n.to_string(),
            CellValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

/// Dense grid anchored at A1. Row `0` is spreadsheet row 1.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }
}

/// Sheets of a newly created workbook, in tab order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}
