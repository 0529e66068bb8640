//! Drawing primitives used to turn raw predictions into display-ready images.

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::font;

/// Dense per-pixel anomaly scores.
pub type AnomalyMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Blend weight of the heat map when superimposed on the source image.
pub const HEATMAP_ALPHA: f32 = 0.4;

pub const ANOMALOUS_COLOR: Rgb<u8> = Rgb([255, 100, 100]);
pub const NORMAL_COLOR: Rgb<u8> = Rgb([225, 252, 134]);
pub const BOUNDARY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Which side of a mask contour gets marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryMode {
    /// Both sides of the contour.
    Thick,
    /// Foreground pixels touching background.
    Inner,
    /// Background pixels touching foreground.
    Outer,
}

/// Jet colormap lookup for `v` in `[0, 1]`.
pub fn jet(v: f32) -> Rgb<u8> {
    let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    let channel = |offset: f32| -> u8 {
        let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Color an anomaly map with the jet colormap.
///
/// Without `normalize` the map is assumed to already lie in `[0, 1]` and is
/// clamped; with it, the map is min-max scaled first.
pub fn anomaly_map_to_color_map(anomaly_map: &AnomalyMap, normalize: bool) -> RgbImage {
    let (lo, hi) = if normalize {
        min_max(anomaly_map)
    } else {
        (0.0, 1.0)
    };
    let range = hi - lo;
    let (w, h) = anomaly_map.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let v = anomaly_map.get_pixel(x, y).0[0];
        let scaled = if range > f32::EPSILON {
            (v - lo) / range
        } else {
            0.0
        };
        // Quantize the way an 8-bit color lookup would.
        jet((scaled.clamp(0.0, 1.0) * 255.0).floor() / 255.0)
    })
}

/// Superimpose the colored anomaly map on top of `image`.
///
/// The map is resized to the image when sizes differ. Output pixels are
/// `alpha * heat + (1 - alpha) * image`.
pub fn superimpose_anomaly_map(
    anomaly_map: &AnomalyMap,
    image: &RgbImage,
    alpha: f32,
    normalize: bool,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let heat = if anomaly_map.dimensions() == (w, h) {
        anomaly_map_to_color_map(anomaly_map, normalize)
    } else {
        let resized: AnomalyMap = imageops::resize(anomaly_map, w, h, FilterType::Triangle);
        anomaly_map_to_color_map(&resized, normalize)
    };
    blend(&heat, image, alpha)
}

fn blend(top: &RgbImage, bottom: &RgbImage, alpha: f32) -> RgbImage {
    let (w, h) = bottom.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let t = top.get_pixel(x, y).0;
        let b = bottom.get_pixel(x, y).0;
        let mix = |i: usize| (alpha * t[i] as f32 + (1.0 - alpha) * b[i] as f32).round() as u8;
        Rgb([mix(0), mix(1), mix(2)])
    })
}

fn min_max(anomaly_map: &AnomalyMap) -> (f32, f32) {
    anomaly_map
        .pixels()
        .map(|p| p.0[0])
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
}

/// Paint a label patch `"<label> - NN%"` in the top-left corner of a copy of `image`.
pub fn add_label(image: &RgbImage, label: &str, color: Rgb<u8>, confidence: Option<f32>) -> RgbImage {
    let mut out = image.clone();
    let text = match confidence {
        Some(c) => format!("{label} - {:.0}%", (c * 100.0).clamp(0.0, 100.0)),
        None => label.to_string(),
    };
    let scale = out.width() / 256 + 1;
    let pad = 2 * scale;
    let patch_w = font::text_width(&text, scale) + 2 * pad;
    let patch_h = font::text_height(scale) + 2 * pad;
    fill_rect(&mut out, [0, 0, patch_w, patch_h], color);
    font::draw_text(&mut out, pad, pad, &text, Rgb([0, 0, 0]), scale);
    out
}

/// Label an image as anomalous with the given confidence.
pub fn add_anomalous_label(image: &RgbImage, confidence: f32) -> RgbImage {
    add_label(image, "Anomalous", ANOMALOUS_COLOR, Some(confidence))
}

/// Label an image as normal with the given confidence.
pub fn add_normal_label(image: &RgbImage, confidence: f32) -> RgbImage {
    add_label(image, "Normal", NORMAL_COLOR, Some(confidence))
}

/// Draw the contour of `mask` (non-zero = foreground) on a copy of `image`.
///
/// A pixel lies on the contour when one of its 4-neighbours carries the other
/// label. The mask is nearest-resized to the image when sizes differ.
pub fn mark_boundaries(
    image: &RgbImage,
    mask: &GrayImage,
    color: Rgb<u8>,
    mode: BoundaryMode,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let resized;
    let mask = if mask.dimensions() == (w, h) {
        mask
    } else {
        resized = imageops::resize(mask, w, h, FilterType::Nearest);
        &resized
    };

    let fg = |x: u32, y: u32| mask.get_pixel(x, y).0[0] > 0;
    let mut out = image.clone();
    for y in 0..h {
        for x in 0..w {
            let center = fg(x, y);
            let mut differs = false;
            if x > 0 {
                differs |= fg(x - 1, y) != center;
            }
            if x + 1 < w {
                differs |= fg(x + 1, y) != center;
            }
            if y > 0 {
                differs |= fg(x, y - 1) != center;
            }
            if y + 1 < h {
                differs |= fg(x, y + 1) != center;
            }
            let marked = differs
                && match mode {
                    BoundaryMode::Thick => true,
                    BoundaryMode::Inner => center,
                    BoundaryMode::Outer => !center,
                };
            if marked {
                out.put_pixel(x, y, color);
            }
        }
    }
    out
}

/// Threshold an anomaly map into a 0/255 mask, then remove specks with a
/// square opening of `kernel_size`.
pub fn compute_mask(anomaly_map: &AnomalyMap, threshold: f32, kernel_size: u32) -> GrayImage {
    let (w, h) = anomaly_map.dimensions();
    let mask = GrayImage::from_fn(w, h, |x, y| {
        if anomaly_map.get_pixel(x, y).0[0] >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    if kernel_size <= 1 {
        return mask;
    }
    let eroded = morph(&mask, kernel_size, false);
    morph(&eroded, kernel_size, true)
}

fn morph(mask: &GrayImage, kernel_size: u32, dilate: bool) -> GrayImage {
    let (w, h) = mask.dimensions();
    let before = (kernel_size - 1) / 2;
    let after = kernel_size - 1 - before;
    GrayImage::from_fn(w, h, |x, y| {
        let x0 = x.saturating_sub(before);
        let y0 = y.saturating_sub(before);
        let x1 = (x + after).min(w - 1);
        let y1 = (y + after).min(h - 1);
        let mut acc = if dilate { 0u8 } else { 255u8 };
        for yy in y0..=y1 {
            for xx in x0..=x1 {
                let v = mask.get_pixel(xx, yy).0[0];
                acc = if dilate { acc.max(v) } else { acc.min(v) };
            }
        }
        Luma([acc])
    })
}

/// Scale a mask whose values lie in `{0, 1}` into `{0, 255}`. Masks already in
/// the 0–255 domain are returned unchanged.
pub fn normalize_mask(mask: GrayImage) -> GrayImage {
    let max = mask.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    if max > 1 {
        return mask;
    }
    let (w, h) = mask.dimensions();
    GrayImage::from_fn(w, h, |x, y| Luma([mask.get_pixel(x, y).0[0].saturating_mul(255)]))
}

/// Fill a rectangle `[x0, y0, x1, y1)` clamped to the image bounds.
pub fn fill_rect(img: &mut RgbImage, rect: [u32; 4], color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    let [x0, y0, x1, y1] = rect;
    for y in y0.min(h)..y1.min(h) {
        for x in x0.min(w)..x1.min(w) {
            img.put_pixel(x, y, color);
        }
    }
}
