//! # Vision Kit Common - Shared Types and Utilities
//!
//! A foundational library providing shared data structures and helpers for the
//! Vision Kit crates: compute-device selection for the wgpu backend,
//! pixel-space geometry, and small file utilities.
//!
//! ## Example
//!
//! ```rust
//! use vision_kit_common::{DeviceSpec, PixelBox};
//!
//! // Parse a device selection as passed on the command line
//! let device: DeviceSpec = "gpu:0".parse().unwrap();
//! assert_eq!(device, DeviceSpec::DiscreteGpu(0));
//!
//! // Pixel-space bounding boxes
//! let a = PixelBox::new(0, 0, 10, 10);
//! let b = PixelBox::new(5, 5, 15, 15);
//! assert!(a.iou(&b) > 0.0);
//! ```

use burn_wgpu::WgpuDevice;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Result type for vision kit operations
pub type Result<T> = std::result::Result<T, VisionKitError>;

/// Standard error type for vision kit operations
#[derive(Error, Debug)]
pub enum VisionKitError {
    #[error(
        "Invalid device '{spec}': expected cpu, default, gpu:<n>, discrete:<n>, integrated:<n> or virtual:<n>"
    )]
    InvalidDeviceSpec { spec: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Compute device selection, parsed from a `--device` command line string.
///
/// `gpu:<n>` and `cuda:<n>` both select the n-th discrete adapter, so
/// invocations written against CUDA tooling keep working unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceSpec {
    Cpu,
    Default,
    DiscreteGpu(usize),
    IntegratedGpu(usize),
    VirtualGpu(usize),
}

impl DeviceSpec {
    /// Resolve the selection to a wgpu device handle.
    pub fn to_wgpu(&self) -> WgpuDevice {
        match self {
            DeviceSpec::Cpu => WgpuDevice::Cpu,
            DeviceSpec::Default => WgpuDevice::DefaultDevice,
            DeviceSpec::DiscreteGpu(n) => WgpuDevice::DiscreteGpu(*n),
            DeviceSpec::IntegratedGpu(n) => WgpuDevice::IntegratedGpu(*n),
            DeviceSpec::VirtualGpu(n) => WgpuDevice::VirtualGpu(*n),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = VisionKitError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VisionKitError::InvalidDeviceSpec {
            spec: s.to_string(),
        };

        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => return Ok(DeviceSpec::Cpu),
            "default" => return Ok(DeviceSpec::Default),
            _ => {}
        }

        let (kind, index) = lower.split_once(':').ok_or_else(invalid)?;
        let index: usize = index.parse().map_err(|_| invalid())?;

        match kind {
            "gpu" | "cuda" | "discrete" => Ok(DeviceSpec::DiscreteGpu(index)),
            "integrated" => Ok(DeviceSpec::IntegratedGpu(index)),
            "virtual" => Ok(DeviceSpec::VirtualGpu(index)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Default => write!(f, "default"),
            DeviceSpec::DiscreteGpu(n) => write!(f, "gpu:{n}"),
            DeviceSpec::IntegratedGpu(n) => write!(f, "integrated:{n}"),
            DeviceSpec::VirtualGpu(n) => write!(f, "virtual:{n}"),
        }
    }
}

/// Axis-aligned bounding box in pixel coordinates.
///
/// Half-open on the right and bottom edges, so a box covering a single pixel
/// at (x, y) is `PixelBox::new(x, y, x + 1, y + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PixelBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelBox {
    /// Create a new box from corner coordinates
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    /// Area in pixels
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Area of the overlap with another box, in pixels
    pub fn intersection_area(&self, other: &PixelBox) -> u64 {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        let x1 = self.x1.min(other.x1);
        let y1 = self.y1.min(other.y1);

        if x1 <= x0 || y1 <= y0 {
            0
        } else {
            (x1 - x0) as u64 * (y1 - y0) as u64
        }
    }

    /// Intersection over union with another box, in [0, 1]
    pub fn iou(&self, other: &PixelBox) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;

        if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }
}

/// Small file-system helpers shared across the pipelines
pub mod utils {
    use super::*;

    /// Check if a path's extension indicates an image file
    pub fn is_image_file(path: &Path) -> bool {
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            matches!(
                ext.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "bmp" | "tif" | "tiff" | "webp"
            )
        } else {
            false
        }
    }

    /// Ensure a directory exists, creating it and its parents if needed
    pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_spec_parsing() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("default".parse::<DeviceSpec>().unwrap(), DeviceSpec::Default);
        assert_eq!(
            "gpu:0".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::DiscreteGpu(0)
        );
        assert_eq!(
            "cuda:1".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::DiscreteGpu(1)
        );
        assert_eq!(
            "discrete:2".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::DiscreteGpu(2)
        );
        assert_eq!(
            "integrated:0".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::IntegratedGpu(0)
        );
        assert_eq!(
            "virtual:3".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::VirtualGpu(3)
        );
    }

    #[test]
    fn test_device_spec_parsing_is_case_insensitive() {
        assert_eq!("CPU".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!(
            "GPU:0".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::DiscreteGpu(0)
        );
    }

    #[test]
    fn test_invalid_device_specs() {
        assert!("".parse::<DeviceSpec>().is_err());
        assert!("gpu".parse::<DeviceSpec>().is_err());
        assert!("gpu:".parse::<DeviceSpec>().is_err());
        assert!("gpu:abc".parse::<DeviceSpec>().is_err());
        assert!("tpu:0".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_device_spec_display_round_trip() {
        for spec in [
            DeviceSpec::Cpu,
            DeviceSpec::Default,
            DeviceSpec::DiscreteGpu(1),
            DeviceSpec::IntegratedGpu(0),
            DeviceSpec::VirtualGpu(2),
        ] {
            let parsed: DeviceSpec = spec.to_string().parse().unwrap();
            assert_eq!(parsed, spec);
        }
    }

    #[test]
    fn test_pixel_box_dimensions() {
        let b = PixelBox::new(10, 20, 110, 70);
        assert_eq!(b.width(), 100);
        assert_eq!(b.height(), 50);
        assert_eq!(b.area(), 5000);
    }

    #[test]
    fn test_pixel_box_intersection() {
        let a = PixelBox::new(0, 0, 10, 10);
        let b = PixelBox::new(5, 5, 15, 15);
        let c = PixelBox::new(20, 20, 30, 30);

        assert_eq!(a.intersection_area(&b), 25);
        assert_eq!(a.intersection_area(&c), 0);
    }

    #[test]
    fn test_pixel_box_iou() {
        let a = PixelBox::new(0, 0, 10, 10);

        // Identical boxes overlap completely
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        // 25 / (100 + 100 - 25)
        let b = PixelBox::new(5, 5, 15, 15);
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);

        // Disjoint boxes
        let c = PixelBox::new(20, 20, 30, 30);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_ensure_dir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");

        utils::ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());

        // Already existing is fine.
        utils::ensure_dir(&nested).unwrap();
    }

    #[test]
    fn test_is_image_file() {
        assert!(utils::is_image_file(Path::new("photo.jpg")));
        assert!(utils::is_image_file(Path::new("photo.JPEG")));
        assert!(utils::is_image_file(Path::new("mask.png")));
        assert!(!utils::is_image_file(Path::new("notes.txt")));
        assert!(!utils::is_image_file(Path::new("no_extension")));
    }
}
