//! Batched embedding computation and the per-split bundle artifact.
//!
//! Each dataset split is embedded into a single safetensors file holding
//! one `[N, dim]` matrix plus metadata, with row `i` corresponding to
//! the `i`-th entry of the stored path list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use indicatif::ProgressBar;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;

use crate::model::DinoVisionTransformer;
use crate::preprocessing::{self, PreprocessConfig};

pub const DEFAULT_BATCH_SIZE: usize = 32;

const EMBEDDINGS_TENSOR: &str = "embeddings";

/// Row-major embedding matrix, one row per image.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    pub rows: usize,
    pub dim: usize,
    pub data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }
}

/// A computed split: the embedding matrix together with the image paths
/// it was computed from, in matching order.
#[derive(Debug, Clone)]
pub struct EmbeddingBundle {
    pub dataset: String,
    pub split: String,
    pub model: String,
    pub paths: Vec<String>,
    pub matrix: EmbeddingMatrix,
}

impl EmbeddingBundle {
    /// File name for a split artifact, e.g.
    /// `images_cifar10_train_dinov2_vitl14.safetensors`.
    pub fn filename(dataset: &str, split: &str, model: &str) -> String {
        format!("images_{dataset}_{split}_{model}.safetensors")
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Writes the bundle as a safetensors file with the path list and
    /// identifying fields carried in the header metadata.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("dataset".to_string(), self.dataset.clone());
        metadata.insert("split".to_string(), self.split.clone());
        metadata.insert("model".to_string(), self.model.clone());
        metadata.insert("dim".to_string(), self.matrix.dim.to_string());
        metadata.insert(
            "paths".to_string(),
            serde_json::to_string(&self.paths).context("failed to encode path list")?,
        );

        let view = TensorView::new(
            safetensors::Dtype::F32,
            vec![self.matrix.rows, self.matrix.dim],
            bytemuck::cast_slice(&self.matrix.data),
        )
        .map_err(|e| anyhow::anyhow!("invalid embedding tensor: {e:?}"))?;

        safetensors::tensor::serialize_to_file(
            vec![(EMBEDDINGS_TENSOR.to_string(), view)],
            &Some(metadata),
            path,
        )
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e:?}", path.display()))?;

        log::info!(
            "Saved {} embeddings ({} dims) to {}",
            self.matrix.rows,
            self.matrix.dim,
            path.display()
        );
        Ok(())
    }

    /// Reads a bundle previously written by [`EmbeddingBundle::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let (_, header) = SafeTensors::read_metadata(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid safetensors header in {}: {e:?}", path.display()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e:?}", path.display()))?;
        let view = tensors
            .tensor(EMBEDDINGS_TENSOR)
            .map_err(|e| anyhow::anyhow!("missing '{EMBEDDINGS_TENSOR}' tensor: {e:?}"))?;

        let shape = view.shape();
        let (rows, dim) = match shape {
            [rows, dim] => (*rows, *dim),
            other => anyhow::bail!("expected a 2d embedding matrix, got shape {other:?}"),
        };
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());

        let paths: Vec<String> = match metadata.get("paths") {
            Some(encoded) => serde_json::from_str(encoded).context("corrupt path list")?,
            None => Vec::new(),
        };

        Ok(Self {
            dataset: metadata.get("dataset").cloned().unwrap_or_default(),
            split: metadata.get("split").cloned().unwrap_or_default(),
            model: metadata.get("model").cloned().unwrap_or_default(),
            paths,
            matrix: EmbeddingMatrix { rows, dim, data },
        })
    }
}

/// Runs the model over `image_paths` in fixed-size batches.
///
/// Rows are appended in input order. Any unreadable image aborts the
/// whole computation.
pub fn compute_embeddings<B: Backend>(
    model: &DinoVisionTransformer<B>,
    config: &PreprocessConfig,
    image_paths: &[PathBuf],
    batch_size: usize,
    device: &B::Device,
) -> Result<EmbeddingMatrix> {
    let batch_size = batch_size.max(1);
    let bar = ProgressBar::new(image_paths.len() as u64);

    let mut data = Vec::new();
    let mut dim = 0;

    for chunk in image_paths.chunks(batch_size) {
        let mut images = Vec::with_capacity(chunk.len());
        for path in chunk {
            let image = image::open(path)
                .with_context(|| format!("failed to open image {}", path.display()))?;
            images.push(image);
        }

        let batch = preprocessing::preprocess_image_batch::<B>(&images, config, device);
        let embeddings = model.forward(batch);

        let [_, embed_dim] = embeddings.dims();
        dim = embed_dim;

        let values: Vec<f32> = embeddings
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("failed to read embeddings off device: {e:?}"))?;
        data.extend_from_slice(&values);

        bar.inc(chunk.len() as u64);
    }

    bar.finish_and_clear();

    Ok(EmbeddingMatrix {
        rows: image_paths.len(),
        dim,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dinov2Config;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray;

    fn sample_bundle() -> EmbeddingBundle {
        EmbeddingBundle {
            dataset: "cifar10".to_string(),
            split: "train".to_string(),
            model: "dinov2_vitl14".to_string(),
            paths: vec!["a/0.png".to_string(), "a/1.png".to_string(), "b/2.png".to_string()],
            matrix: EmbeddingMatrix {
                rows: 3,
                dim: 4,
                data: (0..12).map(|v| v as f32).collect(),
            },
        }
    }

    #[test]
    fn filename_includes_dataset_split_and_model() {
        assert_eq!(
            EmbeddingBundle::filename("cifar10", "train", "dinov2_vitl14"),
            "images_cifar10_train_dinov2_vitl14.safetensors"
        );
    }

    #[test]
    fn bundle_round_trips_through_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.safetensors");

        let bundle = sample_bundle();
        bundle.save(&path).unwrap();

        let loaded = EmbeddingBundle::load(&path).unwrap();
        assert_eq!(loaded.dataset, "cifar10");
        assert_eq!(loaded.split, "train");
        assert_eq!(loaded.model, "dinov2_vitl14");
        assert_eq!(loaded.paths, bundle.paths);
        assert_eq!(loaded.matrix, bundle.matrix);
    }

    #[test]
    fn matrix_rows_match_path_order() {
        let bundle = sample_bundle();
        assert_eq!(bundle.matrix.row(1), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(bundle.len(), 3);
    }

    #[test]
    fn empty_bundle_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");

        let bundle = EmbeddingBundle {
            dataset: "cifar100".to_string(),
            split: "val".to_string(),
            model: "dinov2_vitl14".to_string(),
            paths: Vec::new(),
            matrix: EmbeddingMatrix {
                rows: 0,
                dim: 0,
                data: Vec::new(),
            },
        };
        bundle.save(&path).unwrap();

        let loaded = EmbeddingBundle::load(&path).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.matrix.rows, 0);
    }

    #[test]
    fn compute_embeds_every_image_in_order() {
        let device = Default::default();
        let config = Dinov2Config {
            image_size: 28,
            patch_size: 14,
            embed_dim: 16,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 4.0,
            layer_scale_init: 1e-5,
        };
        let model = crate::model::DinoVisionTransformer::<TestBackend>::new(&config, &device);

        let preprocess = PreprocessConfig {
            resize_size: 32,
            crop_size: 28,
            ..Default::default()
        };

        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..3u8 {
            let path = dir.path().join(format!("{i}.png"));
            RgbImage::from_pixel(40, 50, Rgb([i * 40, 10, 200]))
                .save(&path)
                .unwrap();
            paths.push(path);
        }

        let matrix = compute_embeddings(&model, &preprocess, &paths, 2, &device).unwrap();
        assert_eq!(matrix.rows, 3);
        assert_eq!(matrix.dim, 16);
        assert_eq!(matrix.data.len(), 48);
    }

    #[test]
    fn unreadable_image_aborts_computation() {
        let device = Default::default();
        let config = Dinov2Config {
            image_size: 28,
            patch_size: 14,
            embed_dim: 16,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 4.0,
            layer_scale_init: 1e-5,
        };
        let model = crate::model::DinoVisionTransformer::<TestBackend>::new(&config, &device);

        let result = compute_embeddings(
            &model,
            &PreprocessConfig::default(),
            &[PathBuf::from("/nonexistent/image.png")],
            8,
            &device,
        );
        assert!(result.is_err());
    }
}
