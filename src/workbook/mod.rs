// src/workbook/mod.rs

pub mod lock;
pub mod merge;
pub mod package;
pub mod read;
pub mod types;
pub mod write;

pub use lock::MergeLock;
pub use merge::{has_xlsx_extension, merge_rows, MergeAction, MergeOutcome};
pub use package::{Package, SheetScan};
pub use read::read_sheet;
pub use types::{CellValue, Sheet, Workbook};
pub use write::write_workbook;
