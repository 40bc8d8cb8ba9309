//! Turn photographed "Label: value" forms into rows of an `.xlsx` spreadsheet.

pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod structure;
pub mod workbook;

pub use config::{HeaderPolicy, PipelineConfig};
pub use error::{FormError, PipelineError, Stage};
pub use pipeline::{Pipeline, PipelineReport};
