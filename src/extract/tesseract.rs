// src/extract/tesseract.rs

use image::{GrayImage, ImageFormat};
use std::process::Command;
use tempfile::Builder;
use tracing::{debug, instrument, trace};

use super::TextExtractor;
use crate::config::TesseractConfig;
use crate::error::{FormError, Result};

/// Runs the `tesseract` command-line tool on a temporary PNG.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: String,
    args: Vec<String>,
}

impl TesseractCli {
    pub fn new(config: &TesseractConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            args: config.args.clone(),
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new(&TesseractConfig::default())
    }
}

impl TextExtractor for TesseractCli {
    #[instrument(level = "debug", skip(self, image), fields(binary = %self.binary))]
    fn extract(&self, image: &GrayImage) -> Result<String> {
        let extraction = |reason: String| FormError::Extraction { reason };

        let tmp = Builder::new()
            .prefix("formsheet-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| extraction(format!("creating temp image: {}", e)))?;
        image
            .save_with_format(tmp.path(), ImageFormat::Png)
            .map_err(|e| extraction(format!("writing temp image: {}", e)))?;

        // tesseract <image> stdout [options...]
        let output = Command::new(&self.binary)
            .arg(tmp.path())
            .arg("stdout")
            .args(&self.args)
            .output()
            .map_err(|e| extraction(format!("running `{}`: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(extraction(format!(
                "`{}` exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(lines = text.lines().count(), "extracted text");
        trace!(%text, "extracted text");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn missing_binary_is_extraction_error() {
        let cli = TesseractCli::new(&TesseractConfig {
            binary: "formsheet-no-such-ocr-binary".into(),
            args: vec![],
        });
        let img = GrayImage::from_pixel(4, 4, Luma([255]));
        let err = cli.extract(&img).unwrap_err();
        assert!(matches!(err, FormError::Extraction { .. }), "{err}");
    }

    #[test]
    #[cfg(unix)]
    fn failing_binary_reports_status() {
        // `false` ignores its arguments and exits 1
        let cli = TesseractCli::new(&TesseractConfig {
            binary: "false".into(),
            args: vec![],
        });
        let img = GrayImage::from_pixel(4, 4, Luma([255]));
        match cli.extract(&img) {
            Err(FormError::Extraction { reason }) => assert!(reason.contains("exited")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    #[cfg(unix)]
    fn stdout_is_returned_as_text() {
        // `echo` prints its arguments: "<png path> stdout Name: Alice"
        let cli = TesseractCli::new(&TesseractConfig {
            binary: "echo".into(),
            args: vec!["Name:".into(), "Alice".into()],
        });
        let img = GrayImage::from_pixel(4, 4, Luma([255]));
        let text = cli.extract(&img).unwrap();
        assert!(text.trim_end().ends_with("stdout Name: Alice"));
    }
}
