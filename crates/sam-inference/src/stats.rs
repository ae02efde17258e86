//! Per-image mask statistics and the per-dataset stats file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::generator::GeneratedMask;

/// Flat record of one generated mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskRecord {
    /// Foreground pixels
    pub area: u64,
    /// Half-open bounding box as x0, y0, x1, y1
    pub bbox: [u32; 4],
    pub predicted_iou: f32,
    pub stability_score: f32,
    /// Prompt point in original image coordinates
    pub point: [f32; 2],
}

impl From<&GeneratedMask> for MaskRecord {
    fn from(mask: &GeneratedMask) -> Self {
        Self {
            area: mask.area,
            bbox: [mask.bbox.x0, mask.bbox.y0, mask.bbox.x1, mask.bbox.y1],
            predicted_iou: mask.predicted_iou,
            stability_score: mask.stability_score,
            point: [mask.point.0, mask.point.1],
        }
    }
}

/// Statistics over all masks found in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMaskStats {
    pub width: u32,
    pub height: u32,
    pub mask_count: u64,
    /// Sum of the individual mask areas
    pub total_mask_area: u64,
    /// `total_mask_area` over the image area; exceeds 1.0 when masks
    /// overlap
    pub coverage: f64,
    pub mean_predicted_iou: f32,
    pub masks: Vec<MaskRecord>,
}

impl ImageMaskStats {
    pub fn from_masks(width: u32, height: u32, masks: &[GeneratedMask]) -> Self {
        let total_mask_area: u64 = masks.iter().map(|m| m.area).sum();
        let image_area = width as u64 * height as u64;
        let mean_predicted_iou = if masks.is_empty() {
            0.0
        } else {
            masks.iter().map(|m| m.predicted_iou).sum::<f32>() / masks.len() as f32
        };

        Self {
            width,
            height,
            mask_count: masks.len() as u64,
            total_mask_area,
            coverage: if image_area == 0 {
                0.0
            } else {
                total_mask_area as f64 / image_area as f64
            },
            mean_predicted_iou,
            masks: masks.iter().map(MaskRecord::from).collect(),
        }
    }
}

/// On-disk statistics for one dataset.
///
/// Image paths map to their per-image stats; the two run-wide counters
/// sit alongside the mapping and always describe the most recent run
/// only, never an accumulation across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskStatsFile {
    pub images: BTreeMap<String, ImageMaskStats>,
    /// Images in the most recent run that produced zero masks
    pub total_no_masks_count: u64,
    /// Their paths, in processing order
    pub images_without_masks: Vec<String>,
}

impl MaskStatsFile {
    /// Records the outcome for one image, keeping the zero-mask
    /// counters in step.
    pub fn record(&mut self, image_path: impl Into<String>, stats: ImageMaskStats) {
        let image_path = image_path.into();
        if stats.mask_count == 0 {
            self.total_no_masks_count += 1;
            self.images_without_masks.push(image_path.clone());
        }
        self.images.insert(image_path, stats);
    }

    /// Folds a previously saved file into this run's results.
    ///
    /// Per-image entries from the previous file survive only where this
    /// run did not revisit the image; on conflict the fresh result
    /// wins. The run-wide counters are left untouched so they keep
    /// describing this run alone.
    pub fn absorb_previous(&mut self, previous: MaskStatsFile) {
        for (path, stats) in previous.images {
            self.images.entry(path).or_insert(stats);
        }
    }

    pub fn stats_filename(dataset: &str) -> String {
        format!("{dataset}_SAM_STATS.bin")
    }

    pub fn stats_path(stats_dir: &Path, dataset: &str) -> PathBuf {
        stats_dir.join(Self::stats_filename(dataset))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read stats file {}", path.display()))?;
        let (stats, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .with_context(|| format!("failed to decode stats file {}", path.display()))?;
        Ok(stats)
    }

    pub fn load_if_exists(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            Ok(Some(Self::load(path)?))
        } else {
            Ok(None)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create stats directory {}", parent.display()))?;
        }
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .context("failed to encode stats")?;
        fs::write(path, bytes)
            .with_context(|| format!("failed to write stats file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use vision_kit_common::PixelBox;

    fn sample_mask(area: u64, predicted_iou: f32) -> GeneratedMask {
        GeneratedMask {
            mask: GrayImage::new(4, 4),
            area,
            bbox: PixelBox::new(0, 0, 2, 2),
            predicted_iou,
            stability_score: 0.97,
            point: (1.0, 1.0),
        }
    }

    fn stats_with_masks(count: usize) -> ImageMaskStats {
        let masks: Vec<GeneratedMask> = (0..count).map(|_| sample_mask(8, 0.9)).collect();
        ImageMaskStats::from_masks(10, 10, &masks)
    }

    #[test]
    fn from_masks_aggregates() {
        let masks = vec![sample_mask(30, 0.8), sample_mask(20, 0.6)];
        let stats = ImageMaskStats::from_masks(10, 10, &masks);

        assert_eq!(stats.mask_count, 2);
        assert_eq!(stats.total_mask_area, 50);
        assert!((stats.coverage - 0.5).abs() < 1e-9);
        assert!((stats.mean_predicted_iou - 0.7).abs() < 1e-6);
        assert_eq!(stats.masks[0].bbox, [0, 0, 2, 2]);
    }

    #[test]
    fn from_masks_handles_empty() {
        let stats = ImageMaskStats::from_masks(10, 10, &[]);
        assert_eq!(stats.mask_count, 0);
        assert_eq!(stats.mean_predicted_iou, 0.0);
        assert_eq!(stats.coverage, 0.0);
    }

    #[test]
    fn record_counts_images_without_masks() {
        let mut file = MaskStatsFile::default();
        file.record("a.png", stats_with_masks(2));
        file.record("b.png", stats_with_masks(0));
        file.record("c.png", stats_with_masks(0));

        assert_eq!(file.images.len(), 3);
        assert_eq!(file.total_no_masks_count, 2);
        assert_eq!(file.images_without_masks, vec!["b.png", "c.png"]);
    }

    #[test]
    fn fresh_results_win_on_conflict() {
        let mut previous = MaskStatsFile::default();
        previous.record("shared.png", stats_with_masks(5));
        previous.record("old_only.png", stats_with_masks(1));

        let mut current = MaskStatsFile::default();
        current.record("shared.png", stats_with_masks(2));
        current.record("new_only.png", stats_with_masks(3));

        current.absorb_previous(previous);

        assert_eq!(current.images.len(), 3);
        assert_eq!(current.images["shared.png"].mask_count, 2);
        assert_eq!(current.images["old_only.png"].mask_count, 1);
        assert_eq!(current.images["new_only.png"].mask_count, 3);
    }

    #[test]
    fn counters_describe_current_run_only() {
        let mut previous = MaskStatsFile::default();
        previous.record("x.png", stats_with_masks(0));
        previous.record("y.png", stats_with_masks(0));

        let mut current = MaskStatsFile::default();
        current.record("z.png", stats_with_masks(0));

        current.absorb_previous(previous);

        assert_eq!(current.total_no_masks_count, 1);
        assert_eq!(current.images_without_masks, vec!["z.png"]);
        assert_eq!(current.images.len(), 3);
    }

    #[test]
    fn stats_filename_is_stable() {
        assert_eq!(MaskStatsFile::stats_filename("CUB"), "CUB_SAM_STATS.bin");
        assert_eq!(
            MaskStatsFile::stats_path(Path::new("stats"), "ImageNette"),
            PathBuf::from("stats/ImageNette_SAM_STATS.bin")
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = MaskStatsFile::stats_path(dir.path(), "CUB");

        let mut file = MaskStatsFile::default();
        file.record("a.png", stats_with_masks(2));
        file.record("b.png", stats_with_masks(0));
        file.save(&path).unwrap();

        let loaded = MaskStatsFile::load(&path).unwrap();
        assert_eq!(loaded, file);
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/stats/CUB_SAM_STATS.bin");

        MaskStatsFile::default().save(&path).unwrap();
        assert!(path.exists());

        assert_eq!(MaskStatsFile::load_if_exists(&path).unwrap(), Some(MaskStatsFile::default()));
        let missing = dir.path().join("absent.bin");
        assert_eq!(MaskStatsFile::load_if_exists(&missing).unwrap(), None);
    }
}
