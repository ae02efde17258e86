#![recursion_limit = "256"]

use clap::Parser;
use cli::{init_reporting, resolve_device, to_eyre, Backend};
use color_eyre::eyre::Result;
use std::path::PathBuf;
use tracing::{info, warn};

use datasets::{list_split_images, DatasetName, Split};
use vision_kit_common::utils::ensure_dir;
use dinov2_inference::{
    compute_embeddings, ensure_checkpoint_exists, Dinov2Model, Dinov2Variant, EmbeddingBundle,
    DEFAULT_BATCH_SIZE,
};

/// Extract DINOv2 embeddings for every image of a dataset, one tensor
/// bundle per split.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Dataset name (cifar10, cifar100, ImageNet, ClimateTV, CUB,
    /// Places365, MiT-States, ImageNet-R)
    #[arg(long)]
    dataset: String,

    /// Compute device (cpu, default, gpu:<n>, integrated:<n>, virtual:<n>)
    #[arg(long, default_value = "default")]
    device: String,

    /// Model variant (dinov2_vits14, dinov2_vitb14, dinov2_vitl14)
    #[arg(long, default_value = "dinov2_vitl14")]
    model: String,

    /// Root directory holding the dataset layouts
    #[arg(long, default_value = ".")]
    data_root: PathBuf,

    /// Directory holding the pretrained checkpoints
    #[arg(long, default_value = "weights")]
    weights_dir: PathBuf,

    /// Directory receiving the embedding bundles
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Images per forward pass
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

fn main() -> Result<()> {
    init_reporting()?;
    let cli = Cli::parse();

    let dataset = DatasetName::parse(&cli.dataset)?;
    let variant: Dinov2Variant = cli.model.parse().map_err(to_eyre)?;
    let device = resolve_device(&cli.device)?;

    let checkpoint = ensure_checkpoint_exists(variant, &cli.weights_dir).map_err(to_eyre)?;
    info!("Loading {} from {}", variant.model_id(), checkpoint.display());
    let model = Dinov2Model::<Backend>::load(variant, &checkpoint, &device).map_err(to_eyre)?;

    let dataset_root = dataset.embedding_root(&cli.data_root)?;
    ensure_dir(&cli.output_dir)?;

    for split in [Split::Train, Split::Val, Split::Test] {
        let images = list_split_images(&dataset_root, split)?;
        if images.is_empty() {
            warn!(
                "No {split} images for {dataset} under {}; writing an empty bundle",
                dataset_root.display()
            );
        } else {
            info!("Embedding {} {split} images of {dataset}", images.len());
        }

        let matrix = compute_embeddings(
            model.network(),
            model.preprocess_config(),
            &images,
            cli.batch_size,
            &device,
        )
        .map_err(to_eyre)?;

        let bundle = EmbeddingBundle {
            dataset: dataset.to_string(),
            split: split.to_string(),
            model: variant.model_id().to_string(),
            paths: images
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            matrix,
        };

        let out_path = cli.output_dir.join(EmbeddingBundle::filename(
            &bundle.dataset,
            &bundle.split,
            &bundle.model,
        ));
        bundle.save(&out_path).map_err(to_eyre)?;
        info!(
            "Wrote {} embeddings ({}-dimensional) to {}",
            bundle.len(),
            bundle.matrix.dim,
            out_path.display()
        );
    }

    info!("Embedding extraction completed");
    Ok(())
}
