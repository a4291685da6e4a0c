//! Pixel reconstruction: image-domain elimination of redactions, color
//! overlays and pixelation ahead of OCR.
//!
//! These are conservative heuristics; full recovery is not guaranteed. The
//! capability registry probes this module at startup, and the engine only
//! calls it when the probe succeeded.

use image::{DynamicImage, GrayImage, Rgb, RgbImage, imageops};
use imageproc::contours::{BorderType, find_contours};
use imageproc::filter::median_filter;
use schemars::JsonSchema;

use crate::prelude::*;

/// Luma below which a pixel counts as "redaction dark".
const REDACTION_LUMA: u8 = 40;

/// Minimum side length of a fill box, in pixels. Ordinary glyph strokes
/// stay untouched.
const MIN_REDACTION_SIDE: u32 = 24;

/// Saturation (max channel minus min channel) above which a pixel counts as
/// part of a color overlay on a document scan.
const OVERLAY_SATURATION: u8 = 60;

/// What the reconstruction pass did to a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReconstructionSummary {
    /// Strategies applied, in order.
    pub steps: Vec<String>,

    /// Number of redaction boxes that were cleared.
    pub redaction_boxes: usize,

    /// Number of overlay pixels that were neutralized.
    pub overlay_pixels: u64,

    /// Dimensions of the reconstructed output.
    pub output_width: u32,
    pub output_height: u32,
}

/// Clear solid dark rectangles (redaction bars) by filling them with page
/// background. Returns the cleaned image and the number of boxes cleared.
pub fn remove_redactions(img: &RgbImage) -> (RgbImage, usize) {
    let (w, h) = img.dimensions();
    let mut mask = GrayImage::new(w, h);
    for (x, y, pixel) in img.enumerate_pixels() {
        let luma = luma_of(pixel);
        mask.put_pixel(x, y, image::Luma([if luma < REDACTION_LUMA { 255 } else { 0 }]));
    }

    let mut cleaned = img.clone();
    let mut boxes = 0;
    for contour in find_contours::<u32>(&mask) {
        if contour.border_type != BorderType::Outer || contour.points.is_empty() {
            continue;
        }
        let (x, y, bw, bh) = bounding_rect(&contour.points);
        if bw < MIN_REDACTION_SIDE || bh < MIN_REDACTION_SIDE {
            continue;
        }
        let fill = surrounding_background(img, x, y, bw, bh);
        for px in x..(x + bw).min(w) {
            for py in y..(y + bh).min(h) {
                cleaned.put_pixel(px, py, fill);
            }
        }
        boxes += 1;
    }
    (cleaned, boxes)
}

/// Neutralize saturated color overlays (highlighter, stamps, watermark
/// tints) toward the page background, leaving near-grayscale ink alone.
/// Returns the cleaned image and the number of pixels touched.
pub fn remove_color_overlay(img: &RgbImage) -> (RgbImage, u64) {
    let mut cleaned = img.clone();
    let mut touched = 0u64;
    for pixel in cleaned.pixels_mut() {
        let [r, g, b] = pixel.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        if max - min > OVERLAY_SATURATION {
            // Keep the luminance so text under a tinted overlay survives.
            let luma = luma_of(&Rgb([r, g, b]));
            let value = luma.saturating_add(40).min(255);
            *pixel = Rgb([value, value, value]);
            touched += 1;
        }
    }
    (cleaned, touched)
}

/// Naive depixelation: upsample 2x and median-filter per-block smoothing.
pub fn depixelate(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let up = imageops::resize(gray, w * 2, h * 2, imageops::FilterType::CatmullRom);
    median_filter(&up, 1, 1)
}

/// Run the full reconstruction pipeline over encoded bytes, returning the
/// reconstructed image (PNG-encoded) and a summary of what was done.
pub fn reconstruct_bytes(
    bytes: &[u8],
    iterations: usize,
) -> Result<(Vec<u8>, ReconstructionSummary)> {
    let img = image::load_from_memory(bytes)
        .context("Corrupted or unsupported image format")?;
    let mut current = img.to_rgb8();
    let mut summary = ReconstructionSummary::default();

    for _ in 0..iterations.max(1) {
        let (cleared, boxes) = remove_redactions(&current);
        summary.redaction_boxes += boxes;
        if boxes > 0 {
            summary.steps.push("remove_redactions".to_owned());
        }

        let (neutral, pixels) = remove_color_overlay(&cleared);
        summary.overlay_pixels += pixels;
        if pixels > 0 {
            summary.steps.push("remove_color_overlay".to_owned());
        }
        current = neutral;

        // Stop early once a pass finds nothing left to fix.
        if boxes == 0 && pixels == 0 {
            break;
        }
    }

    let smoothed = depixelate(&DynamicImage::ImageRgb8(current).to_luma8());
    summary.steps.push("depixelate".to_owned());
    summary.output_width = smoothed.width();
    summary.output_height = smoothed.height();

    let mut out = Vec::new();
    DynamicImage::ImageLuma8(smoothed)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .context("Failed to encode reconstructed image")?;
    Ok((out, summary))
}

/// Sample the border just outside a box to estimate the page background.
fn surrounding_background(img: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> Rgb<u8> {
    let (img_w, img_h) = img.dimensions();
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    let margin = 3;
    let x0 = x.saturating_sub(margin);
    let y0 = y.saturating_sub(margin);
    let x1 = (x + w + margin).min(img_w);
    let y1 = (y + h + margin).min(img_h);
    for px in x0..x1 {
        for py in y0..y1 {
            let inside = px >= x && px < x + w && py >= y && py < y + h;
            if !inside {
                let pixel = img.get_pixel(px, py);
                sum[0] += u64::from(pixel.0[0]);
                sum[1] += u64::from(pixel.0[1]);
                sum[2] += u64::from(pixel.0[2]);
                count += 1;
            }
        }
    }
    if count == 0 {
        return Rgb([255, 255, 255]);
    }
    Rgb([
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
    ])
}

fn luma_of(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8
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

#[cfg(test)]
mod tests {
    use super::*;

    fn white_page_with_redaction() -> RgbImage {
        let mut img = RgbImage::from_pixel(120, 120, Rgb([250, 250, 250]));
        for x in 20..80 {
            for y in 30..70 {
                img.put_pixel(x, y, Rgb([5, 5, 5]));
            }
        }
        img
    }

    #[test]
    fn test_remove_redactions_clears_bar() {
        let img = white_page_with_redaction();
        let (cleaned, boxes) = remove_redactions(&img);
        assert_eq!(boxes, 1);
        // The center of the former bar now matches the page background.
        let center = cleaned.get_pixel(50, 50);
        assert!(center.0[0] > 200, "center still dark: {:?}", center);
    }

    #[test]
    fn test_remove_redactions_ignores_small_marks() {
        let mut img = RgbImage::from_pixel(100, 100, Rgb([250, 250, 250]));
        for x in 10..20 {
            for y in 10..14 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let (cleaned, boxes) = remove_redactions(&img);
        assert_eq!(boxes, 0);
        assert_eq!(cleaned.get_pixel(12, 12), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_remove_color_overlay_neutralizes_tint() {
        let mut img = RgbImage::from_pixel(50, 50, Rgb([250, 250, 250]));
        for x in 0..50 {
            img.put_pixel(x, 25, Rgb([255, 240, 80]));
        }
        let (cleaned, touched) = remove_color_overlay(&img);
        assert_eq!(touched, 50);
        let pixel = cleaned.get_pixel(25, 25);
        assert_eq!(pixel.0[0], pixel.0[1]);
        assert_eq!(pixel.0[1], pixel.0[2]);
    }

    #[test]
    fn test_depixelate_doubles_dimensions() {
        let gray = GrayImage::from_pixel(40, 30, image::Luma([128]));
        let out = depixelate(&gray);
        assert_eq!(out.dimensions(), (80, 60));
    }

    #[test]
    fn test_reconstruct_bytes_roundtrip() {
        let img = white_page_with_redaction();
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let (out, summary) = reconstruct_bytes(&bytes, 3).unwrap();
        assert!(!out.is_empty());
        assert!(summary.redaction_boxes >= 1);
        assert!(summary.steps.iter().any(|s| s == "remove_redactions"));
        assert_eq!(summary.output_width, 240);
        image::load_from_memory(&out).unwrap();
    }

    #[test]
    fn test_reconstruct_bytes_rejects_garbage() {
        assert!(reconstruct_bytes(b"nope", 3).is_err());
    }
}
