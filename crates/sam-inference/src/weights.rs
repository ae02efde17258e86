//! Checkpoint loading for the published SAM weights.

use std::path::Path;

use anyhow::Result;
use burn::tensor::backend::Backend;

use crate::model::{Sam, SamConfig};

/// Renames from the checkpoint's anonymous sequential stacks to the
/// named submodules used here. Everything else already lines up.
#[cfg(any(feature = "pytorch-weights", test))]
fn key_remap_rules() -> Vec<(&'static str, &'static str)> {
    vec![
        (r"image_encoder\.neck\.0\.(.+)", "image_encoder.neck.conv1.$1"),
        (r"image_encoder\.neck\.1\.(.+)", "image_encoder.neck.ln1.$1"),
        (r"image_encoder\.neck\.2\.(.+)", "image_encoder.neck.conv2.$1"),
        (r"image_encoder\.neck\.3\.(.+)", "image_encoder.neck.ln2.$1"),
        (
            r"prompt_encoder\.mask_downscaling\.0\.(.+)",
            "prompt_encoder.mask_downscaling.conv1.$1",
        ),
        (
            r"prompt_encoder\.mask_downscaling\.1\.(.+)",
            "prompt_encoder.mask_downscaling.ln1.$1",
        ),
        (
            r"prompt_encoder\.mask_downscaling\.3\.(.+)",
            "prompt_encoder.mask_downscaling.conv2.$1",
        ),
        (
            r"prompt_encoder\.mask_downscaling\.4\.(.+)",
            "prompt_encoder.mask_downscaling.ln2.$1",
        ),
        (
            r"prompt_encoder\.mask_downscaling\.6\.(.+)",
            "prompt_encoder.mask_downscaling.conv3.$1",
        ),
        (
            r"mask_decoder\.output_upscaling\.0\.(.+)",
            "mask_decoder.output_upscaling.conv1.$1",
        ),
        (
            r"mask_decoder\.output_upscaling\.1\.(.+)",
            "mask_decoder.output_upscaling.ln.$1",
        ),
        (
            r"mask_decoder\.output_upscaling\.3\.(.+)",
            "mask_decoder.output_upscaling.conv2.$1",
        ),
    ]
}

/// Loads pretrained weights from a PyTorch checkpoint file.
#[cfg(feature = "pytorch-weights")]
pub fn load_sam_weights<B: Backend>(
    config: &SamConfig,
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<Sam<B>> {
    use crate::model::sam::SamRecord;
    use burn::module::Module;
    use burn::record::{FullPrecisionSettings, Recorder};
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    if !checkpoint_path.exists() {
        anyhow::bail!("checkpoint not found: {}", checkpoint_path.display());
    }

    log::info!("Loading SAM weights from {}", checkpoint_path.display());

    let load_args = key_remap_rules()
        .into_iter()
        .fold(LoadArgs::new(checkpoint_path.to_path_buf()), |args, (from, to)| {
            args.with_key_remap(from, to)
        });

    let record: SamRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::new()
        .load(load_args, device)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e:?}", checkpoint_path.display()))?;

    Ok(config.init(device).load_record(record))
}

/// Loads pretrained weights from a PyTorch checkpoint file.
#[cfg(not(feature = "pytorch-weights"))]
pub fn load_sam_weights<B: Backend>(
    _config: &SamConfig,
    checkpoint_path: &Path,
    _device: &B::Device,
) -> Result<Sam<B>> {
    anyhow::bail!(
        "built without the pytorch-weights feature; cannot load {}",
        checkpoint_path.display()
    )
}
