//! # DINOv2 Inference
//!
//! Image embedding inference with DINOv2 Vision Transformers, built on
//! the Burn deep learning framework.
//!
//! Supports the published ViT-S/14, ViT-B/14 and ViT-L/14 backbones.
//! Images go through the standard eval transform (resize, center crop,
//! ImageNet normalization) and come out as one embedding vector per
//! image, taken from the final-layer class token.

pub mod embeddings;
pub mod model;
pub mod preprocessing;
pub mod weights;

pub use embeddings::{compute_embeddings, EmbeddingBundle, EmbeddingMatrix, DEFAULT_BATCH_SIZE};
pub use model::{Dinov2Config, DinoVisionTransformer};
pub use preprocessing::{preprocess_image, preprocess_image_batch, PreprocessConfig};
pub use weights::load_dinov2_weights;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;

/// Published DINOv2 model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dinov2Variant {
    /// ViT-S/14, 384-dimensional embeddings
    Small,
    /// ViT-B/14, 768-dimensional embeddings
    Base,
    /// ViT-L/14, 1024-dimensional embeddings
    Large,
}

impl Dinov2Variant {
    pub fn vit_config(&self) -> Dinov2Config {
        let (embed_dim, depth, num_heads) = match self {
            Dinov2Variant::Small => (384, 12, 6),
            Dinov2Variant::Base => (768, 12, 12),
            Dinov2Variant::Large => (1024, 24, 16),
        };

        Dinov2Config {
            image_size: 224,
            patch_size: 14,
            embed_dim,
            depth,
            num_heads,
            mlp_ratio: 4.0,
            layer_scale_init: 1e-5,
        }
    }

    /// Torch hub identifier, also used in artifact file names.
    pub fn model_id(&self) -> &'static str {
        match self {
            Dinov2Variant::Small => "dinov2_vits14",
            Dinov2Variant::Base => "dinov2_vitb14",
            Dinov2Variant::Large => "dinov2_vitl14",
        }
    }

    pub fn checkpoint_filename(&self) -> String {
        format!("{}_pretrain.pth", self.model_id())
    }

    pub fn checkpoint_url(&self) -> String {
        let id = self.model_id();
        format!("https://dl.fbaipublicfiles.com/dinov2/{id}/{id}_pretrain.pth")
    }
}

impl FromStr for Dinov2Variant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dinov2_vits14" | "vits14" | "small" => Ok(Dinov2Variant::Small),
            "dinov2_vitb14" | "vitb14" | "base" => Ok(Dinov2Variant::Base),
            "dinov2_vitl14" | "vitl14" | "large" => Ok(Dinov2Variant::Large),
            other => anyhow::bail!(
                "unknown DINOv2 variant '{other}' (expected dinov2_vits14, dinov2_vitb14 or dinov2_vitl14)"
            ),
        }
    }
}

/// Creates a randomly initialized model for the given variant.
pub fn create_dinov2_model<B: Backend>(
    variant: Dinov2Variant,
    device: &B::Device,
) -> DinoVisionTransformer<B> {
    DinoVisionTransformer::new(&variant.vit_config(), device)
}

/// Creates a model and loads the published pretrained weights into it.
pub fn load_dinov2_model<B: Backend>(
    variant: Dinov2Variant,
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<DinoVisionTransformer<B>> {
    weights::load_dinov2_weights(&variant.vit_config(), checkpoint_path, device)
}

/// High-level wrapper pairing a backbone with its eval transform.
pub struct Dinov2Model<B: Backend> {
    model: DinoVisionTransformer<B>,
    variant: Dinov2Variant,
    preprocess: PreprocessConfig,
}

impl<B: Backend> Dinov2Model<B> {
    /// Creates a model with random weights.
    pub fn new(variant: Dinov2Variant, device: &B::Device) -> Self {
        Self {
            model: create_dinov2_model(variant, device),
            variant,
            preprocess: PreprocessConfig::default(),
        }
    }

    /// Creates a model with pretrained weights.
    pub fn load(variant: Dinov2Variant, checkpoint_path: &Path, device: &B::Device) -> Result<Self> {
        Ok(Self {
            model: load_dinov2_model(variant, checkpoint_path, device)?,
            variant,
            preprocess: PreprocessConfig::default(),
        })
    }

    pub fn variant(&self) -> Dinov2Variant {
        self.variant
    }

    pub fn network(&self) -> &DinoVisionTransformer<B> {
        &self.model
    }

    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// Embeds a batch of decoded images, [N, embed_dim].
    pub fn embed_images(&self, images: &[DynamicImage]) -> Result<Tensor<B, 2>> {
        if images.is_empty() {
            anyhow::bail!("cannot embed an empty image batch");
        }
        let device = self.model.device();
        let batch = preprocess_image_batch::<B>(images, &self.preprocess, &device);
        Ok(self.model.forward(batch))
    }
}

/// Returns the checkpoint path for a variant, downloading the weights
/// first when the `download` feature is enabled.
pub fn ensure_checkpoint_exists(variant: Dinov2Variant, checkpoint_dir: &Path) -> Result<PathBuf> {
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
