use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by the pipeline stages.
pub type Result<T> = std::result::Result<T, FormError>;

/// Boxed cause carried by persistence failures (I/O, zip, workbook parsing).
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything a single pipeline run can fail with.
#[derive(Debug, Error)]
pub enum FormError {
    /// No image could be obtained (missing file, undecodable upload, no frame).
    #[error("no image available: {reason}")]
    Acquisition { reason: String },

    /// The text extraction collaborator could not be run at all.
    #[error("text extraction failed: {reason}")]
    Extraction { reason: String },

    /// Extracted text contained no `heading: value` line.
    #[error("no `heading: value` lines found in extracted text")]
    EmptyExtraction,

    #[error("output path `{}` must end with `.xlsx`", path.display())]
    InvalidOutputFormat { path: PathBuf },

    /// The run's headings cannot be placed under the sheet's existing header row.
    #[error(
        "headings {headings:?} do not fit existing header {header:?} of sheet `{sheet}`"
    )]
    HeaderMismatch {
        sheet: String,
        header: Vec<String>,
        headings: Vec<String>,
    },

    #[error("spreadsheet `{}` could not be persisted: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: Cause,
    },
}

impl FormError {
    pub fn persistence(path: impl Into<PathBuf>, source: impl Into<Cause>) -> Self {
        FormError::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// The pipeline stage at which a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquisition,
    Extraction,
    Parse,
    Merge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Acquisition => "acquisition",
            Stage::Extraction => "extraction",
            Stage::Parse => "parse",
            Stage::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// A `FormError` tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: FormError,
}

impl PipelineError {
    pub fn at(stage: Stage) -> impl FnOnce(FormError) -> PipelineError {
        move |source| PipelineError { stage, source }
    }
}
