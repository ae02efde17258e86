//! # SAM Inference
//!
//! Segment Anything Model inference built on the Burn deep learning
//! framework.
//!
//! Supports the published ViT-B, ViT-L and ViT-H checkpoints. Images
//! are resized so their longest side matches the model resolution and
//! zero-padded into the bottom-right corner; masks come back at the
//! original resolution. Point and box prompts are available directly,
//! and [`generate_masks`] segments everything in an image from a point
//! grid.

pub mod generator;
pub mod model;
pub mod postprocessing;
pub mod preprocessing;
pub mod stats;
pub mod weights;

pub use generator::{generate_masks, GeneratedMask, MaskGeneratorConfig};
pub use model::{Sam, SamConfig, MASK_THRESHOLD};
pub use postprocessing::PostprocessConfig;
pub use preprocessing::PreprocessConfig;
pub use stats::{ImageMaskStats, MaskRecord, MaskStatsFile};
pub use weights::load_sam_weights;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use burn::tensor::backend::Backend;
use image::{DynamicImage, GrayImage};

use crate::postprocessing::{mask_from_logits, upscale_to_original};
use crate::preprocessing::{apply_coords, preprocess_image};

/// Published SAM model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamVariant {
    /// ViT-B backbone, the smallest published checkpoint
    VitB,
    /// ViT-L backbone
    VitL,
    /// ViT-H backbone, used by the original release scripts
    VitH,
}

impl SamVariant {
    pub fn sam_config(&self) -> SamConfig {
        match self {
            SamVariant::VitB => SamConfig::vit_b(),
            SamVariant::VitL => SamConfig::vit_l(),
            SamVariant::VitH => SamConfig::vit_h(),
        }
    }

    /// Registry key used by the original release.
    pub fn registry_key(&self) -> &'static str {
        match self {
            SamVariant::VitB => "vit_b",
            SamVariant::VitL => "vit_l",
            SamVariant::VitH => "vit_h",
        }
    }

    pub fn checkpoint_filename(&self) -> &'static str {
        match self {
            SamVariant::VitB => "sam_vit_b_01ec64.pth",
            SamVariant::VitL => "sam_vit_l_0b3195.pth",
            SamVariant::VitH => "sam_vit_h_4b8939.pth",
        }
    }

    pub fn checkpoint_url(&self) -> String {
        format!(
            "https://dl.fbaipublicfiles.com/segment_anything/{}",
            self.checkpoint_filename()
        )
    }
}

impl FromStr for SamVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "vit_b" | "vitb" | "b" => Ok(SamVariant::VitB),
            "vit_l" | "vitl" | "l" => Ok(SamVariant::VitL),
            "vit_h" | "vith" | "h" | "default" => Ok(SamVariant::VitH),
            other => {
                anyhow::bail!("unknown SAM variant '{other}' (expected vit_b, vit_l or vit_h)")
            }
        }
    }
}

/// Creates a randomly initialized model for the given variant.
pub fn create_sam_model<B: Backend>(variant: SamVariant, device: &B::Device) -> Sam<B> {
    variant.sam_config().init(device)
}

/// Creates a model and loads the published pretrained weights into it.
pub fn load_sam_model<B: Backend>(
    variant: SamVariant,
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<Sam<B>> {
    weights::load_sam_weights(&variant.sam_config(), checkpoint_path, device)
}

/// High-level wrapper pairing the model with its pre and post
/// processing.
pub struct SamModel<B: Backend> {
    sam: Sam<B>,
    variant: SamVariant,
    postprocess: PostprocessConfig,
}

impl<B: Backend> SamModel<B> {
    /// Creates a model with random weights.
    pub fn new(variant: SamVariant, device: &B::Device) -> Self {
        Self {
            sam: create_sam_model(variant, device),
            variant,
            postprocess: PostprocessConfig::default(),
        }
    }

    /// Creates a model with pretrained weights.
    pub fn load(variant: SamVariant, checkpoint_path: &Path, device: &B::Device) -> Result<Self> {
        Ok(Self {
            sam: load_sam_model(variant, checkpoint_path, device)?,
            variant,
            postprocess: PostprocessConfig::default(),
        })
    }

    pub fn variant(&self) -> SamVariant {
        self.variant
    }

    pub fn network(&self) -> &Sam<B> {
        &self.sam
    }

    /// Segments everything in an image with a point grid prompt.
    pub fn segment_image(
        &self,
        image: &DynamicImage,
        config: &MaskGeneratorConfig,
    ) -> Result<Vec<GeneratedMask>> {
        generate_masks(&self.sam, image, config)
    }

    /// Predicts a single mask from labeled point prompts given in
    /// original image coordinates. Returns the binary mask at the
    /// original resolution and its predicted quality.
    pub fn predict_with_points(
        &self,
        image: &DynamicImage,
        points: &[(f32, f32, bool)],
    ) -> Result<(GrayImage, f32)> {
        if points.is_empty() {
            anyhow::bail!("at least one point prompt is required");
        }

        let device = self.sam.device();
        let target_size = self.sam.image_size() as u32;

        let pre = preprocess_image::<B>(
            image,
            &PreprocessConfig {
                target_size,
            },
            &device,
        );
        let embeddings = self.sam.encode_image(pre.tensor.clone());

        let scaled: Vec<(f32, f32, bool)> = points
            .iter()
            .map(|(x, y, label)| {
                let (sx, sy) = apply_coords((*x, *y), pre.original_size, pre.scaled_size);
                (sx, sy, *label)
            })
            .collect();

        let (masks, iou_preds) = self.sam.predict_from_points(embeddings, &scaled, false);

        let [_, _, low_h, low_w] = masks.dims();
        let logits: Vec<f32> = masks
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("failed to read mask logits off device: {e:?}"))?;
        let score = iou_preds
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("failed to read quality scores off device: {e:?}"))?
            .first()
            .copied()
            .unwrap_or(0.0);

        let low = mask_from_logits(
            &logits,
            low_w as u32,
            low_h as u32,
            self.postprocess.mask_threshold,
        );
        let full = upscale_to_original(&low, pre.scaled_size, target_size, pre.original_size);

        Ok((full, score))
    }
}

/// Returns the checkpoint path for a variant, downloading the weights
/// first when the `download` feature is enabled.
pub fn ensure_checkpoint_exists(variant: SamVariant, checkpoint_dir: &Path) -> Result<PathBuf> {
    let path = checkpoint_dir.join(variant.checkpoint_filename());
    if path.exists() {
        return Ok(path);
    }

    #[cfg(feature = "download")]
    {
        use anyhow::Context;

        std::fs::create_dir_all(checkpoint_dir)
            .with_context(|| format!("failed to create {}", checkpoint_dir.display()))?;

        let url = variant.checkpoint_url();
        log::info!("Downloading {} to {}", url, path.display());

        let response = ureq::get(&url).call()?;
        let mut file = std::fs::File::create(&path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;

        Ok(path)
    }

    #[cfg(not(feature = "download"))]
    {
        anyhow::bail!(
            "checkpoint {} not found; download it from {}",
            path.display(),
            variant.checkpoint_url()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sam::tiny_sam_config;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray;

    #[test]
    fn variant_configs_match_published_architectures() {
        let b = SamVariant::VitB.sam_config();
        assert_eq!(b.image_encoder.embed_dim, 768);
        assert_eq!(b.image_encoder.depth, 12);

        let l = SamVariant::VitL.sam_config();
        assert_eq!(l.image_encoder.embed_dim, 1024);
        assert_eq!(l.image_encoder.depth, 24);

        let h = SamVariant::VitH.sam_config();
        assert_eq!(h.image_encoder.embed_dim, 1280);
        assert_eq!(h.image_encoder.depth, 32);
        assert_eq!(h.image_size, 1024);
        assert_eq!(h.prompt_embed_dim, 256);
    }

    #[test]
    fn checkpoint_locations() {
        assert_eq!(SamVariant::VitH.checkpoint_filename(), "sam_vit_h_4b8939.pth");
        assert_eq!(
            SamVariant::VitH.checkpoint_url(),
            "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_h_4b8939.pth"
        );
        assert_eq!(SamVariant::VitB.checkpoint_filename(), "sam_vit_b_01ec64.pth");
        assert_eq!(SamVariant::VitL.checkpoint_filename(), "sam_vit_l_0b3195.pth");
    }

    #[test]
    fn variant_parses_from_registry_keys_and_aliases() {
        assert_eq!("vit_h".parse::<SamVariant>().unwrap(), SamVariant::VitH);
        assert_eq!("default".parse::<SamVariant>().unwrap(), SamVariant::VitH);
        assert_eq!("ViT_B".parse::<SamVariant>().unwrap(), SamVariant::VitB);
        assert_eq!("l".parse::<SamVariant>().unwrap(), SamVariant::VitL);
        assert!("vit_g".parse::<SamVariant>().is_err());
    }

    #[test]
    fn point_prompt_returns_full_resolution_mask() {
        let device = Default::default();
        let sam = tiny_sam_config().init::<TestBackend>(&device);
        let model = SamModel {
            sam,
            variant: SamVariant::VitB,
            postprocess: PostprocessConfig::default(),
        };

        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 24, Rgb([128, 90, 60])));
        let (mask, score) = model.predict_with_points(&image, &[(20.0, 12.0, true)]).unwrap();

        assert_eq!(mask.dimensions(), (40, 24));
        assert!(score.is_finite());

        assert!(model.predict_with_points(&image, &[]).is_err());
    }

    #[cfg(not(feature = "download"))]
    #[test]
    fn missing_checkpoint_reports_download_url() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_checkpoint_exists(SamVariant::VitH, dir.path()).unwrap_err();
        assert!(err.to_string().contains("sam_vit_h_4b8939.pth"));
    }
}
