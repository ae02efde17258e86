#![recursion_limit = "256"]

use clap::{ArgAction, Parser};
use cli::{init_reporting, resolve_device, to_eyre, Backend};
use color_eyre::eyre::{Result, WrapErr};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use tracing::info;

use datasets::{mask_output_dir, segmentation_worklist, DatasetName};
use vision_kit_common::utils::ensure_dir;
use sam_inference::{
    ensure_checkpoint_exists, GeneratedMask, ImageMaskStats, MaskGeneratorConfig, MaskStatsFile,
    SamModel, SamVariant,
};

/// Generate SAM masks for every image of a dataset, plus per-image
/// statistics.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Dataset name (CUB, ImageNet, ImageNette, ImageWoof)
    #[arg(long)]
    dataset: String,

    /// Whether to write segment mask images
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    create_segments: bool,

    /// Whether to collect and save statistics
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    create_stats: bool,

    /// Compute device (cpu, default, gpu:<n>, integrated:<n>, virtual:<n>)
    #[arg(long, default_value = "default")]
    device: String,

    /// Whether to skip images that already have a mask directory
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    check_existing: bool,

    /// Model variant (vit_b, vit_l, vit_h)
    #[arg(long, default_value = "vit_h")]
    model: String,

    /// Root directory holding the dataset layouts
    #[arg(long, default_value = ".")]
    data_root: PathBuf,

    /// Directory holding the pretrained checkpoints
    #[arg(long, default_value = "weights")]
    weights_dir: PathBuf,

    /// Directory receiving the per-dataset mask folders
    #[arg(long, default_value = ".")]
    output_root: PathBuf,

    /// Directory receiving the statistics files
    #[arg(long, default_value = "stats")]
    stats_dir: PathBuf,

    /// Side length of the point prompt grid
    #[arg(long, default_value_t = 32)]
    points_per_side: usize,
}

fn main() -> Result<()> {
    init_reporting()?;
    let cli = Cli::parse();

    let dataset = DatasetName::parse(&cli.dataset)?;
    let variant: SamVariant = cli.model.parse().map_err(to_eyre)?;
    let device = resolve_device(&cli.device)?;

    let out_root = cli.output_root.join(dataset.sam_output_dirname());
    ensure_dir(&out_root)?;

    let worklist = segmentation_worklist(dataset, &cli.data_root, &out_root, cli.check_existing)?;
    if worklist.is_empty() {
        info!("No images left to segment for {dataset}");
        return Ok(());
    }
    info!("Segmenting {} images of {dataset}", worklist.len());

    let checkpoint = ensure_checkpoint_exists(variant, &cli.weights_dir).map_err(to_eyre)?;
    info!(
        "Loading SAM {} from {}",
        variant.registry_key(),
        checkpoint.display()
    );
    let model = SamModel::<Backend>::load(variant, &checkpoint, &device).map_err(to_eyre)?;

    let generator_config = MaskGeneratorConfig {
        points_per_side: cli.points_per_side,
        ..Default::default()
    };
    let mut stats = MaskStatsFile::default();

    let bar = ProgressBar::new(worklist.len() as u64);
    for image_path in &worklist {
        let image = image::open(image_path)
            .wrap_err_with(|| format!("failed to open {}", image_path.display()))?;

        let masks = model.segment_image(&image, &generator_config).map_err(to_eyre)?;

        if cli.create_segments {
            write_segment_masks(&out_root, image_path, &masks)?;
        }
        if cli.create_stats {
            stats.record(
                image_path.to_string_lossy(),
                ImageMaskStats::from_masks(image.width(), image.height(), &masks),
            );
        }

        bar.inc(1);
    }
    bar.finish_and_clear();

    info!(
        "Mask generation completed: {} images, {} without masks",
        worklist.len(),
        stats.total_no_masks_count
    );

    if cli.create_stats {
        let stats_path = MaskStatsFile::stats_path(&cli.stats_dir, &dataset.to_string());
        if let Some(previous) = MaskStatsFile::load_if_exists(&stats_path).map_err(to_eyre)? {
            info!(
                "Merging {} entries from the previous run at {}",
                previous.images.len(),
                stats_path.display()
            );
            stats.absorb_previous(previous);
        }
        stats.save(&stats_path).map_err(to_eyre)?;
        info!(
            "Wrote statistics for {} images to {}",
            stats.images.len(),
            stats_path.display()
        );
    }

    Ok(())
}

/// Writes one PNG per mask under `<out_root>/<class>/<stem>/`.
fn write_segment_masks(
    out_root: &Path,
    image_path: &Path,
    masks: &[GeneratedMask],
) -> Result<()> {
    let dir = mask_output_dir(out_root, image_path);
    ensure_dir(&dir)?;

    for (index, mask) in masks.iter().enumerate() {
        mask.mask.save(dir.join(format!("mask_{index}.png")))?;
    }

    Ok(())
}
