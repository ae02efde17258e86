//! Dataset naming and directory conventions for the embedding and
//! segmentation pipelines.
//!
//! Every supported dataset lives under a shared data root in its upstream
//! directory layout. This crate maps dataset names to those fixed layouts and
//! enumerates their image files; it never rearranges or copies anything on
//! disk.

pub mod error;
pub mod walk;

pub use error::{DatasetError, Result};
pub use walk::{list_class_images, list_split_images, mask_output_dir, segmentation_worklist};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};

/// The datasets the pipelines know how to locate.
///
/// Names match the upstream spelling exactly ("MiT-States", "ImageNet-R"),
/// since they are also used verbatim in artifact file names.
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq, Hash,
)]
pub enum DatasetName {
    #[serde(rename = "cifar10")]
    #[strum(serialize = "cifar10")]
    Cifar10,

    #[serde(rename = "cifar100")]
    #[strum(serialize = "cifar100")]
    Cifar100,

    #[serde(rename = "ImageNet")]
    #[strum(serialize = "ImageNet")]
    ImageNet,

    #[serde(rename = "ClimateTV")]
    #[strum(serialize = "ClimateTV")]
    ClimateTv,

    #[serde(rename = "CUB")]
    #[strum(serialize = "CUB")]
    Cub,

    #[serde(rename = "Places365")]
    #[strum(serialize = "Places365")]
    Places365,

    #[serde(rename = "MiT-States")]
    #[strum(serialize = "MiT-States")]
    MitStates,

    #[serde(rename = "ImageNet-R")]
    #[strum(serialize = "ImageNet-R")]
    ImageNetR,

    #[serde(rename = "ImageNette")]
    #[strum(serialize = "ImageNette")]
    ImageNette,

    #[serde(rename = "ImageWoof")]
    #[strum(serialize = "ImageWoof")]
    ImageWoof,
}

impl DatasetName {
    /// Parse a dataset name as passed on the command line.
    pub fn parse(name: &str) -> Result<Self> {
        name.parse::<Self>()
            .map_err(|_| DatasetError::UnknownName(name.to_string()))
    }

    /// Relative directory fragment holding this dataset's split folders
    /// (`train`/`val`/`test`).
    pub fn embedding_fragment(&self) -> Result<&'static str> {
        match self {
            DatasetName::Cifar10 => Ok("cifar10"),
            DatasetName::Cifar100 => Ok("cifar100"),
            DatasetName::ImageNet => Ok("ImageNet/ILSVRC/Data/CLS-LOC"),
            DatasetName::ClimateTv => Ok("ClimateTV"),
            DatasetName::Cub => Ok("CUB_200_2011"),
            DatasetName::Places365 => Ok("Places365/Data"),
            DatasetName::MitStates => Ok("MiT-States/release_dataset/"),
            DatasetName::ImageNetR => Ok("ImageNet-R/imagenet-r"),
            DatasetName::ImageNette | DatasetName::ImageWoof => {
                Err(DatasetError::NoEmbeddingLayout(*self))
            }
        }
    }

    /// Root directory holding this dataset's split folders, under `data_root`.
    pub fn embedding_root(&self, data_root: &Path) -> Result<PathBuf> {
        Ok(data_root.join(self.embedding_fragment()?))
    }

    /// Relative directory fragment holding this dataset's training images,
    /// used as the segmentation worklist source.
    pub fn segmentation_fragment(&self) -> Result<&'static str> {
        match self {
            DatasetName::Cub => Ok("CUB_200_2011/images"),
            DatasetName::ImageNet => Ok("ImageNet/ILSVRC/Data/CLS-LOC/train"),
            DatasetName::ImageNette => Ok("imagenette2/train"),
            DatasetName::ImageWoof => Ok("imagewoof2/train"),
            _ => Err(DatasetError::NoSegmentationLayout(*self)),
        }
    }

    /// Training-image directory for segmentation, under `data_root`.
    pub fn segmentation_root(&self, data_root: &Path) -> Result<PathBuf> {
        Ok(data_root.join(self.segmentation_fragment()?))
    }

    /// Name of the directory that receives this dataset's generated masks.
    pub fn sam_output_dirname(&self) -> String {
        format!("{self}_SAM")
    }
}

/// Dataset split, spelled lowercase on disk and in artifact names.
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}
