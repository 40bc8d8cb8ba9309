use image::{GrayImage, Luma};
use std::path::Path;
use tracing::{debug, instrument};

use crate::error::{FormError, Result};

/// Load an image file and convert it to 8-bit grayscale.
#[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
pub fn acquire_image<P: AsRef<Path>>(path: P) -> Result<GrayImage> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(FormError::Acquisition {
            reason: format!("{} does not exist or is not a file", path.display()),
        });
    }
    let img = image::open(path).map_err(|e| FormError::Acquisition {
        reason: format!("cannot decode {}: {}", path.display(), e),
    })?;
    let gray = img.to_luma8();
    debug!(width = gray.width(), height = gray.height(), "acquired image");
    Ok(gray)
}

/// Otsu's threshold: the gray level maximising between-class variance.
pub fn otsu_threshold(img: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in img.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0;
    }
    let sum_all: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &n)| i as f64 * n as f64)
        .sum();

    let (mut best_t, mut best_var) = (0u8, -1.0f64);
    let (mut w_bg, mut sum_bg) = (0u64, 0f64);
    for t in 0..256usize {
        w_bg += hist[t];
        if w_bg == 0 {
            continue;
        }
        let w_fg = total - w_bg;
        if w_fg == 0 {
            break;
        }
        sum_bg += t as f64 * hist[t] as f64;
        let mean_bg = sum_bg / w_bg as f64;
        let mean_fg = (sum_all - sum_bg) / w_fg as f64;
        let var = w_bg as f64 * w_fg as f64 * (mean_bg - mean_fg).powi(2);
        if var > best_var {
            best_var = var;
            best_t = t as u8;
        }
    }
    best_t
}

/// Black/white image: pixels above the Otsu threshold become 255, the rest 0.
pub fn binarize_otsu(img: &GrayImage) -> GrayImage {
    let t = otsu_threshold(img);
    debug!(threshold = t, "binarizing");
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if img.get_pixel(x, y)[0] > t {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
