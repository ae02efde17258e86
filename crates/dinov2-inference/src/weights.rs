//! Checkpoint loading for the published DINOv2 weights.

use std::path::Path;

use anyhow::Result;
use burn::tensor::backend::Backend;

use crate::model::{Dinov2Config, DinoVisionTransformer};

/// Loads pretrained weights from a PyTorch checkpoint file.
#[cfg(feature = "pytorch-weights")]
pub fn load_dinov2_weights<B: Backend>(
    config: &Dinov2Config,
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<DinoVisionTransformer<B>> {
    use crate::model::DinoVisionTransformerRecord;
    use burn::module::Module;
    use burn::record::{FullPrecisionSettings, Recorder};
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    if !checkpoint_path.exists() {
        anyhow::bail!("checkpoint not found: {}", checkpoint_path.display());
    }

    log::info!("Loading DINOv2 weights from {}", checkpoint_path.display());

    // Module field names follow the checkpoint layout, so no key
    // remapping is needed. Checkpoint keys with no counterpart in the
    // module (the iBOT mask token) are skipped by the recorder.
    let load_args = LoadArgs::new(checkpoint_path.to_path_buf());
    let record: DinoVisionTransformerRecord<B> =
        PyTorchFileRecorder::<FullPrecisionSettings>::new()
            .load(load_args, device)
            .map_err(|e| {
                anyhow::anyhow!("failed to load {}: {e:?}", checkpoint_path.display())
            })?;

    Ok(DinoVisionTransformer::new(config, device).load_record(record))
}

/// Loads pretrained weights from a PyTorch checkpoint file.
#[cfg(not(feature = "pytorch-weights"))]
pub fn load_dinov2_weights<B: Backend>(
    _config: &Dinov2Config,
    checkpoint_path: &Path,
    _device: &B::Device,
) -> Result<DinoVisionTransformer<B>> {
    anyhow::bail!(
        "built without the pytorch-weights feature; cannot load {}",
        checkpoint_path.display()
    )
}
