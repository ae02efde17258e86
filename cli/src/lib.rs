//! Shared plumbing for the pipeline binaries.

use color_eyre::eyre::{Report, Result};
use tracing_subscriber::EnvFilter;
use vision_kit_common::DeviceSpec;

/// Inference backend used by both pipelines.
pub type Backend = burn::backend::Wgpu;

/// Device handle for [`Backend`].
pub type Device = burn::backend::wgpu::WgpuDevice;

/// Installs the error report handler and the fmt subscriber.
///
/// `RUST_LOG` controls verbosity; the default is `info`.
pub fn init_reporting() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    Ok(())
}

/// Resolves a `--device` argument to a wgpu device.
pub fn resolve_device(spec: &str) -> Result<Device> {
    let spec: DeviceSpec = spec.parse()?;
    Ok(spec.to_wgpu())
}

/// Adapts library errors to the report type used by the binaries.
pub fn to_eyre(err: anyhow::Error) -> Report {
    Report::msg(format!("{err:?}"))
}
