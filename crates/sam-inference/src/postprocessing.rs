//! Mask postprocessing.
//!
//! Turns low-resolution mask logits into binary mask images at the
//! original resolution, and derives the per-mask measurements used for
//! filtering and statistics.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use vision_kit_common::PixelBox;

use crate::model::MASK_THRESHOLD;

pub const FOREGROUND: u8 = 255;

/// Postprocessing configuration.
#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// Logit threshold for binarizing masks
    pub mask_threshold: f32,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            mask_threshold: MASK_THRESHOLD,
        }
    }
}

/// Binarizes a row-major logit buffer into a mask image.
pub fn mask_from_logits(logits: &[f32], width: u32, height: u32, threshold: f32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for (index, value) in logits.iter().enumerate() {
        if *value > threshold {
            let x = index as u32 % width;
            let y = index as u32 / width;
            mask.put_pixel(x, y, Luma([FOREGROUND]));
        }
    }
    mask
}

/// Ratio of the mask area under a tightened threshold to the area under
/// a relaxed one. Masks that barely change are stable.
pub fn stability_score(logits: &[f32], threshold: f32, offset: f32) -> f32 {
    let high = logits.iter().filter(|v| **v > threshold + offset).count();
    let low = logits.iter().filter(|v| **v > threshold - offset).count();

    if low == 0 {
        0.0
    } else {
        high as f32 / low as f32
    }
}

/// Number of foreground pixels.
pub fn mask_area(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|pixel| pixel[0] > 0).count() as u64
}

/// Tight half-open bounding box around the foreground, if any.
pub fn mask_bbox(mask: &GrayImage) -> Option<PixelBox> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;

    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    bounds.map(|(x0, y0, x1, y1)| PixelBox::new(x0, y0, x1 + 1, y1 + 1))
}

/// Removes connected foreground regions smaller than `min_area`.
///
/// Returns the cleaned mask and whether anything was removed.
pub fn remove_small_regions(mask: &GrayImage, min_area: u32) -> (GrayImage, bool) {
    if min_area == 0 {
        return (mask.clone(), false);
    }

    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut areas = std::collections::HashMap::new();
    for pixel in labels.pixels() {
        if pixel[0] != 0 {
            *areas.entry(pixel[0]).or_insert(0u32) += 1;
        }
    }

    let mut cleaned = mask.clone();
    let mut changed = false;
    for (x, y, pixel) in labels.enumerate_pixels() {
        if pixel[0] != 0 && areas[&pixel[0]] < min_area {
            cleaned.put_pixel(x, y, Luma([0]));
            changed = true;
        }
    }

    (cleaned, changed)
}

/// Nearest-neighbor resize, keeping the mask strictly binary.
pub fn resize_mask_image(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    image::imageops::resize(mask, width, height, image::imageops::FilterType::Nearest)
}

/// Crops the valid (unpadded) region of a low-resolution mask and
/// resizes it to the original image resolution.
pub fn upscale_to_original(
    mask: &GrayImage,
    scaled_size: (u32, u32),
    target_size: u32,
    original_size: (u32, u32),
) -> GrayImage {
    let (low_w, low_h) = mask.dimensions();

    let valid_w = ((scaled_size.0 as f64 / target_size as f64) * low_w as f64).round() as u32;
    let valid_h = ((scaled_size.1 as f64 / target_size as f64) * low_h as f64).round() as u32;
    let valid_w = valid_w.clamp(1, low_w);
    let valid_h = valid_h.clamp(1, low_h);

    let cropped = image::imageops::crop_imm(mask, 0, 0, valid_w, valid_h).to_image();
    resize_mask_image(&cropped, original_size.0, original_size.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with(pixels: &[(u32, u32)], width: u32, height: u32) -> GrayImage {
        let mut mask = GrayImage::new(width, height);
        for (x, y) in pixels {
            mask.put_pixel(*x, *y, Luma([FOREGROUND]));
        }
        mask
    }

    #[test]
    fn thresholding_binarizes_logits() {
        let logits = vec![-1.0, 0.5, 0.0, 2.0];
        let mask = mask_from_logits(&logits, 2, 2, 0.0);

        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(1, 0)[0], FOREGROUND);
        assert_eq!(mask.get_pixel(0, 1)[0], 0);
        assert_eq!(mask.get_pixel(1, 1)[0], FOREGROUND);
    }

    #[test]
    fn stability_compares_tight_and_relaxed_areas() {
        // Two pixels above +1.0, four above -1.0.
        let logits = vec![2.0, 3.0, 0.5, -0.5, -2.0, -3.0];
        let score = stability_score(&logits, 0.0, 1.0);
        assert!((score - 0.5).abs() < 1e-6);

        assert_eq!(stability_score(&[-5.0, -4.0], 0.0, 1.0), 0.0);
    }

    #[test]
    fn area_and_bbox_measure_foreground() {
        let mask = mask_with(&[(1, 1), (2, 1), (2, 3)], 5, 5);

        assert_eq!(mask_area(&mask), 3);
        let bbox = mask_bbox(&mask).unwrap();
        assert_eq!((bbox.x0, bbox.y0, bbox.x1, bbox.y1), (1, 1, 3, 4));

        assert!(mask_bbox(&GrayImage::new(4, 4)).is_none());
    }

    #[test]
    fn small_regions_are_removed() {
        // A 2x2 block and an isolated pixel.
        let mask = mask_with(&[(0, 0), (1, 0), (0, 1), (1, 1), (4, 4)], 6, 6);

        let (cleaned, changed) = remove_small_regions(&mask, 2);
        assert!(changed);
        assert_eq!(mask_area(&cleaned), 4);
        assert_eq!(cleaned.get_pixel(4, 4)[0], 0);

        let (untouched, changed) = remove_small_regions(&mask, 0);
        assert!(!changed);
        assert_eq!(mask_area(&untouched), 5);
    }

    #[test]
    fn nearest_resize_stays_binary() {
        let mask = mask_with(&[(0, 0), (1, 1)], 2, 2);
        let resized = resize_mask_image(&mask, 4, 4);

        assert_eq!(resized.dimensions(), (4, 4));
        for pixel in resized.pixels() {
            assert!(pixel[0] == 0 || pixel[0] == FOREGROUND);
        }
        assert_eq!(resized.get_pixel(0, 0)[0], FOREGROUND);
        assert_eq!(resized.get_pixel(3, 3)[0], FOREGROUND);
        assert_eq!(resized.get_pixel(3, 0)[0], 0);
    }

    #[test]
    fn upscale_crops_padding_before_resizing() {
        // 4x4 low-res mask whose valid region is the left half
        // (scaled width 32 of a 64 target): column 2 and 3 are padding.
        let mask = mask_with(&[(0, 0), (1, 0), (3, 3)], 4, 4);

        let out = upscale_to_original(&mask, (32, 64), 64, (16, 32));
        assert_eq!(out.dimensions(), (16, 32));

        // The padding-area pixel at (3, 3) must not survive.
        assert_eq!(mask_area(&out), mask_area(&resize_mask_image(&mask_with(&[(0, 0), (1, 0)], 2, 4), 16, 32)));
    }
}
