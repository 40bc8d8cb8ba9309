use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_OUTPUT: &str = "output.xlsx";
pub const DEFAULT_SHEET: &str = "Sheet1";

/// How rows are lined up against a sheet that already has a header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPolicy {
    /// Reorder cells to the existing header by column name; reject unknown headings.
    #[default]
    ByName,
    /// Headings must equal the existing header exactly.
    Strict,
    /// Append cells in the run's own column order, whatever the header says.
    Positional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    pub binary: String,
    pub args: Vec<String>,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            binary: "tesseract".into(),
            args: vec!["--oem".into(), "3".into(), "--psm".into(), "6".into()],
        }
    }
}

/// Settings threaded through every pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_path: PathBuf,
    pub sheet_name: String,
    pub header_policy: HeaderPolicy,
    /// Otsu-binarize the grayscale image before handing it to the extractor.
    pub binarize: bool,
    pub tesseract: TesseractConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from(DEFAULT_OUTPUT),
            sheet_name: DEFAULT_SHEET.into(),
            header_policy: HeaderPolicy::default(),
            binarize: true,
            tesseract: TesseractConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a YAML config file; missing keys fall back to their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}
