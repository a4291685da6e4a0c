//! Document layout analysis.
//!
//! Identifies content regions for targeted extraction and classifies the
//! page into a coarse layout archetype. Uses imageproc contour detection
//! rather than a full computer-vision stack.

use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use schemars::JsonSchema;

use crate::imaging;
use crate::prelude::*;

/// Minimum region width, in pixels. Narrower boxes are noise.
const MIN_REGION_WIDTH: u32 = 20;

/// Minimum region height, in pixels.
const MIN_REGION_HEIGHT: u32 = 10;

/// A detected content region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Region {
    /// Stable id within the document, assigned in contour-iteration order.
    pub id: usize,

    /// Pixel bounding box: x, y, width, height.
    pub bbox: [u32; 4],

    /// Bounding box normalized to image dimensions, each in [0, 1].
    pub rel_bbox: [f64; 4],

    /// Fraction of the page covered by this region, in [0, 1].
    pub area_ratio: f64,
}

/// Coarse layout archetypes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// No detectable content.
    #[default]
    Empty,

    /// Many small regions, like a page of running text.
    DenseText,

    /// A few large regions, like a poster or simple form.
    LargeBlocks,

    /// Everything else.
    StandardForm,
}

impl LayoutKind {
    /// The wire name of this layout kind.
    pub fn as_str(self) -> &'static str {
        match self {
            LayoutKind::Empty => "empty",
            LayoutKind::DenseText => "dense_text",
            LayoutKind::LargeBlocks => "large_blocks",
            LayoutKind::StandardForm => "standard_form",
        }
    }
}

/// Detect content regions in a document image, ordered top-to-bottom (ties
/// broken left-to-right). Returns an empty list when the bytes don't decode.
pub fn detect_regions(image_bytes: &[u8]) -> Vec<Region> {
    let img = match imaging::decode(image_bytes) {
        Ok(img) => img,
        Err(err) => {
            warn!("Failed to decode image for layout analysis: {err}");
            return Vec::new();
        }
    };

    let gray = img.to_luma8();
    let mut thresh = imaging::otsu_binarize(&gray);

    // Contour tracing follows non-zero pixels, so make sure the content (not
    // the page background) is the white phase.
    let (img_w, img_h) = thresh.dimensions();
    let white_pixels = thresh.pixels().filter(|p| p.0[0] > 0).count() as u64;
    if white_pixels > u64::from(img_w) * u64::from(img_h) / 2 {
        invert_in_place(&mut thresh);
    }

    // Three passes of 5x5 rectangular dilation merge glyphs into word and
    // line blobs.
    for _ in 0..3 {
        thresh = dilate(&thresh, Norm::LInf, 2);
    }

    let contours = find_contours::<u32>(&thresh);
    let mut regions = Vec::new();
    for (id, contour) in contours.iter().enumerate() {
        if contour.border_type != BorderType::Outer || contour.points.is_empty() {
            continue;
        }
        let (x, y, w, h) = bounding_rect(&contour.points);
        if w < MIN_REGION_WIDTH || h < MIN_REGION_HEIGHT {
            continue;
        }
        regions.push(Region {
            id,
            bbox: [x, y, w, h],
            rel_bbox: [
                f64::from(x) / f64::from(img_w),
                f64::from(y) / f64::from(img_h),
                f64::from(w) / f64::from(img_w),
                f64::from(h) / f64::from(img_h),
            ],
            area_ratio: f64::from(w) * f64::from(h)
                / (f64::from(img_w) * f64::from(img_h)),
        });
    }

    regions.sort_by_key(|r| (r.bbox[1], r.bbox[0]));
    debug!("Detected {} regions in document", regions.len());
    regions
}

/// Classify a page into a layout archetype from its detected regions.
pub fn classify_layout(regions: &[Region]) -> LayoutKind {
    if regions.is_empty() {
        return LayoutKind::Empty;
    }
    let mean_area =
        regions.iter().map(|r| r.area_ratio).sum::<f64>() / regions.len() as f64;
    if regions.len() > 20 && mean_area < 0.05 {
        return LayoutKind::DenseText;
    }
    if regions.len() < 10 && regions.iter().any(|r| r.area_ratio > 0.4) {
        return LayoutKind::LargeBlocks;
    }
    LayoutKind::StandardForm
}

fn invert_in_place(img: &mut GrayImage) {
    for pixel in img.pixels_mut() {
        pixel.0[0] = 255 - pixel.0[0];
    }
}

fn bounding_rect(points: &[imageproc::point::Point<u32>]) -> (u32, u32, u32, u32) {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}
