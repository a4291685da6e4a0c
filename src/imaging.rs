//! Image decoding, validation and inter-pass enhancement.
//!
//! Everything here is a pure function of its inputs. The engine calls these
//! from `spawn_blocking` closures, so none of them should do I/O.

use image::{DynamicImage, GrayImage, Luma, imageops};
use imageproc::contrast::{ThresholdType, otsu_level, threshold};

use crate::prelude::*;

/// Background fill used when padding ROIs.
const ROI_BACKGROUND: u8 = 255;

/// A validation failure for inbound document bytes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Empty image content")]
    EmptyInput,

    #[error("Image size exceeds {max_mb}MB limit")]
    OversizedInput { max_mb: usize },
}

/// Validate document bytes before any decoding work.
///
/// Inputs larger than `max_mb * 2^20` bytes are rejected.
pub fn validate(bytes: &[u8], max_mb: usize) -> Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    if bytes.len() > max_mb * 1024 * 1024 {
        return Err(ValidationError::OversizedInput { max_mb });
    }
    Ok(())
}

/// Decode raw bytes into an image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("Corrupted or unsupported image format")
}

/// Pad a region of interest on all sides with background fill. Small ROIs
/// OCR noticeably better with a margin around the glyphs.
pub fn prepare_roi(roi: &GrayImage, padding: u32) -> GrayImage {
    let (w, h) = roi.dimensions();
    let mut padded =
        GrayImage::from_pixel(w + 2 * padding, h + 2 * padding, Luma([ROI_BACKGROUND]));
    imageops::overlay(&mut padded, roi, i64::from(padding), i64::from(padding));
    padded
}

/// Sharpen an image ahead of thresholding.
pub fn sharpen(img: &DynamicImage) -> DynamicImage {
    img.unsharpen(1.0, 4)
}

/// Detail-enhancement pass applied between iterations: a light
/// edge-preserving smoothing followed by an unsharp mask, so the next pass
/// sees crisper glyph boundaries without amplified noise.
pub fn enhance_between_iterations(img: &DynamicImage) -> DynamicImage {
    img.blur(0.8).unsharpen(1.5, 2)
}

/// Binarize a grayscale image with an Otsu-derived threshold.
pub fn otsu_binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    threshold(gray, level, ThresholdType::Binary)
}
