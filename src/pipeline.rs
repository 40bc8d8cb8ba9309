// src/pipeline.rs

use std::path::Path;
use tracing::{debug, info, info_span, instrument};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::extract::{acquire_image, binarize_otsu, TextExtractor};
use crate::structure::{parse_lines, reconcile};
use crate::workbook::{merge_rows, MergeOutcome};

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub headings: Vec<String>,
    pub rows: usize,
    pub merge: MergeOutcome,
}

/// Acquisition → extraction → parse → reconcile → merge, one image per call.
///
/// Runs are synchronous. Concurrent runs against the same spreadsheet are
/// serialised by the merge lock; nothing else is shared between runs.
pub struct Pipeline<E> {
    config: PipelineConfig,
    extractor: E,
}

impl<E: TextExtractor> Pipeline<E> {
    pub fn new(config: PipelineConfig, extractor: E) -> Self {
        Self { config, extractor }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full run for an image file.
    #[instrument(level = "info", skip(self, image_path), fields(image = %image_path.as_ref().display()))]
    pub fn run_image<P: AsRef<Path>>(&self, image_path: P) -> Result<PipelineReport, PipelineError> {
        let image = acquire_image(image_path).map_err(PipelineError::at(Stage::Acquisition))?;
        let image = if self.config.binarize {
            binarize_otsu(&image)
        } else {
            image
        };

        let text = info_span!("extraction")
            .in_scope(|| self.extractor.extract(&image))
            .map_err(PipelineError::at(Stage::Extraction))?;
        debug!(lines = text.lines().count(), "post-extraction");

        self.run_text(&text)
    }

    /// Run from already extracted text: parse → reconcile → merge.
    pub fn run_text(&self, text: &str) -> Result<PipelineReport, PipelineError> {
        let map = parse_lines(text).map_err(PipelineError::at(Stage::Parse))?;
        let headings: Vec<String> = map.headings().map(str::to_string).collect();
        info!(?headings, "post-parse");

        let table = reconcile(&map);
        drop(map);
        debug!(rows = table.len(), "post-reconcile");

        let merge = merge_rows(
            &self.config.output_path,
            &self.config.sheet_name,
            &table,
            self.config.header_policy,
        )
        .map_err(PipelineError::at(Stage::Merge))?;

        Ok(PipelineReport {
            headings,
            rows: table.len(),
            merge,
        })
    }
}
