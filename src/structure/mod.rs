pub mod lines;
pub mod row_table;

pub use lines::{parse_lines, HeadingMap};
pub use row_table::{reconcile, RowTable};
