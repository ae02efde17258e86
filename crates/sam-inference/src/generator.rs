//! Automatic mask generation.
//!
//!  Prompts the model with a regular grid of foreground points, keeps
//!  the confident and stable predictions, and deduplicates overlapping
//!  masks with greedy box NMS.

use anyhow::Result;
use burn::tensor::backend::Backend;
use image::{DynamicImage, GrayImage};
use vision_kit_common::PixelBox;

use crate::model::{Sam, MASK_THRESHOLD};
use crate::postprocessing::{
    mask_area, mask_bbox, mask_from_logits, remove_small_regions, stability_score,
    upscale_to_original,
};
use crate::preprocessing::{preprocess_image, PreprocessConfig};

/// Automatic mask generation configuration.
#[derive(Debug, Clone)]
pub struct MaskGeneratorConfig {
    /// Prompt grid side length; the grid has this many points squared
    pub points_per_side: usize,
    /// Points decoded per model call
    pub points_per_batch: usize,
    /// Minimum predicted mask quality
    pub pred_iou_thresh: f32,
    /// Minimum stability score
    pub stability_score_thresh: f32,
    /// Logit offset used when computing the stability score
    pub stability_score_offset: f32,
    /// IoU above which overlapping masks are deduplicated
    pub box_nms_thresh: f32,
    /// Connected regions smaller than this many pixels are dropped
    pub min_mask_region_area: u32,
}

impl Default for MaskGeneratorConfig {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            points_per_batch: 64,
            pred_iou_thresh: 0.88,
            stability_score_thresh: 0.95,
            stability_score_offset: 1.0,
            box_nms_thresh: 0.7,
            min_mask_region_area: 0,
        }
    }
}

impl MaskGeneratorConfig {
    /// Predicted-IoU filter: candidates must score strictly above the
    /// threshold.
    pub fn clears_iou_threshold(&self, predicted_iou: f32) -> bool {
        predicted_iou > self.pred_iou_thresh
    }

    /// Stability filter: candidates at the threshold are kept.
    pub fn clears_stability_threshold(&self, stability_score: f32) -> bool {
        stability_score >= self.stability_score_thresh
    }
}

/// One generated mask at the original image resolution.
#[derive(Debug, Clone)]
pub struct GeneratedMask {
    /// Binary mask, 255 where the segment is
    pub mask: GrayImage,
    /// Foreground pixels
    pub area: u64,
    /// Tight bounding box
    pub bbox: PixelBox,
    /// Model-predicted mask quality
    pub predicted_iou: f32,
    /// Stability under threshold perturbation
    pub stability_score: f32,
    /// Prompt point in original image coordinates
    pub point: (f32, f32),
}

/// Candidate kept at low resolution until NMS has run.
struct Candidate {
    mask: GrayImage,
    bbox: PixelBox,
    predicted_iou: f32,
    stability_score: f32,
    point: (f32, f32),
}

/// Evenly spaced point grid over the scaled image, in model input
/// coordinates.
pub fn build_point_grid(points_per_side: usize, scaled_size: (u32, u32)) -> Vec<(f32, f32)> {
    let (width, height) = scaled_size;
    let mut points = Vec::with_capacity(points_per_side * points_per_side);

    for row in 0..points_per_side {
        let y = (row as f32 + 0.5) / points_per_side as f32 * height as f32;
        for col in 0..points_per_side {
            let x = (col as f32 + 0.5) / points_per_side as f32 * width as f32;
            points.push((x, y));
        }
    }

    points
}

/// Greedy non-maximum suppression over (box, score) candidates.
///
/// Returns the indices of the kept candidates, highest score first.
pub fn non_max_suppression(candidates: &[(PixelBox, f32)], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .1
            .partial_cmp(&candidates[*a].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<usize> = Vec::new();
    for index in order {
        let survives = kept.iter().all(|kept_index| {
            candidates[index].0.iou(&candidates[*kept_index].0) <= iou_threshold
        });
        if survives {
            kept.push(index);
        }
    }

    kept
}

/// Segments everything in an image.
///
/// Runs the encoder once, prompts it with a point grid and returns the
/// deduplicated masks at the original resolution. An image may
/// legitimately produce no masks at all.
pub fn generate_masks<B: Backend>(
    sam: &Sam<B>,
    image: &DynamicImage,
    config: &MaskGeneratorConfig,
) -> Result<Vec<GeneratedMask>> {
    let device = sam.device();
    let target_size = sam.image_size() as u32;

    let pre = preprocess_image::<B>(
        image,
        &PreprocessConfig {
            target_size,
        },
        &device,
    );
    let embeddings = sam.encode_image(pre.tensor.clone());

    let grid = build_point_grid(config.points_per_side, pre.scaled_size);
    let mut candidates: Vec<Candidate> = Vec::new();

    for chunk in grid.chunks(config.points_per_batch.max(1)) {
        let (masks, iou_preds) = sam.predict_from_point_batch(embeddings.clone(), chunk, true);

        let [batch, masks_per_point, low_h, low_w] = masks.dims();
        let logits: Vec<f32> = masks
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("failed to read mask logits off device: {e:?}"))?;
        let scores: Vec<f32> = iou_preds
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("failed to read quality scores off device: {e:?}"))?;

        let plane = low_h * low_w;
        for prompt in 0..batch {
            for channel in 0..masks_per_point {
                let predicted_iou = scores[prompt * masks_per_point + channel];
                if !config.clears_iou_threshold(predicted_iou) {
                    continue;
                }

                let offset = (prompt * masks_per_point + channel) * plane;
                let mask_logits = &logits[offset..offset + plane];

                let stability = stability_score(
                    mask_logits,
                    MASK_THRESHOLD,
                    config.stability_score_offset,
                );
                if !config.clears_stability_threshold(stability) {
                    continue;
                }

                let mask =
                    mask_from_logits(mask_logits, low_w as u32, low_h as u32, MASK_THRESHOLD);
                let Some(bbox) = mask_bbox(&mask) else {
                    continue;
                };

                candidates.push(Candidate {
                    mask,
                    bbox,
                    predicted_iou,
                    stability_score: stability,
                    point: chunk[prompt],
                });
            }
        }
    }

    let boxes: Vec<(PixelBox, f32)> = candidates
        .iter()
        .map(|c| (c.bbox, c.predicted_iou))
        .collect();
    let kept = non_max_suppression(&boxes, config.box_nms_thresh);

    let mut generated = Vec::with_capacity(kept.len());
    for index in kept {
        let candidate = &candidates[index];

        let full = upscale_to_original(
            &candidate.mask,
            pre.scaled_size,
            target_size,
            pre.original_size,
        );
        let (full, _) = remove_small_regions(&full, config.min_mask_region_area);

        let area = mask_area(&full);
        let Some(bbox) = mask_bbox(&full) else {
            continue;
        };

        // Map the prompt back into original image coordinates.
        let point = (
            candidate.point.0 * pre.original_size.0 as f32 / pre.scaled_size.0 as f32,
            candidate.point.1 * pre.original_size.1 as f32 / pre.scaled_size.1 as f32,
        );

        generated.push(GeneratedMask {
            mask: full,
            area,
            bbox,
            predicted_iou: candidate.predicted_iou,
            stability_score: candidate.stability_score,
            point,
        });
    }

    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sam::tiny_sam_config;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray;

    #[test]
    fn point_grid_is_centered_and_complete() {
        let grid = build_point_grid(4, (64, 32));
        assert_eq!(grid.len(), 16);

        assert_eq!(grid[0], (8.0, 4.0));
        assert_eq!(grid[15], (56.0, 28.0));
        assert!(grid.iter().all(|(x, y)| *x < 64.0 && *y < 32.0));
    }

    #[test]
    fn quality_filters_hold_at_the_documented_boundaries() {
        let config = MaskGeneratorConfig::default();

        // Predicted IoU must be strictly above 0.88.
        assert!(!config.clears_iou_threshold(0.88));
        assert!(config.clears_iou_threshold(0.8801));

        // A stability score of exactly 0.95 is kept.
        assert!(config.clears_stability_threshold(0.95));
        assert!(!config.clears_stability_threshold(0.9499));
    }

    #[test]
    fn nms_drops_heavily_overlapping_boxes() {
        let a = PixelBox::new(0, 0, 10, 10);
        let b = PixelBox::new(1, 1, 11, 11); // iou with a ~0.68
        let c = PixelBox::new(40, 40, 50, 50);

        let kept = non_max_suppression(&[(a, 0.9), (b, 0.8), (c, 0.7)], 0.5);
        assert_eq!(kept, vec![0, 2]);

        let all = non_max_suppression(&[(a, 0.9), (b, 0.8), (c, 0.7)], 0.95);
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn nms_orders_by_score() {
        let a = PixelBox::new(0, 0, 4, 4);
        let b = PixelBox::new(20, 20, 24, 24);

        let kept = non_max_suppression(&[(a, 0.1), (b, 0.9)], 0.5);
        assert_eq!(kept, vec![1, 0]);
    }

    #[test]
    fn generated_masks_land_in_original_resolution() {
        let device = Default::default();
        let sam = tiny_sam_config().init::<TestBackend>(&device);

        let mut image = RgbImage::new(48, 32);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            *pixel = if x < 24 { Rgb([220, 40, 40]) } else { Rgb([20, 20, 200]) };
        }
        let image = DynamicImage::ImageRgb8(image);

        // Permissive thresholds: the weights are random, the plumbing
        // is what is under test.
        let config = MaskGeneratorConfig {
            points_per_side: 2,
            points_per_batch: 3,
            pred_iou_thresh: f32::NEG_INFINITY,
            stability_score_thresh: 0.0,
            box_nms_thresh: 1.0,
            min_mask_region_area: 0,
            ..Default::default()
        };

        let masks = generate_masks(&sam, &image, &config).unwrap();
        for mask in &masks {
            assert_eq!(mask.mask.dimensions(), (48, 32));
            assert!(mask.area > 0);
            assert!(mask.bbox.x1 <= 48 && mask.bbox.y1 <= 32);
            assert!(mask.point.0 < 48.0 && mask.point.1 < 32.0);
            assert!(mask.stability_score >= 0.0);
        }
    }
}
