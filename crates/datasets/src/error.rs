use crate::DatasetName;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Unknown dataset name: '{0}'")]
    UnknownName(String),

    #[error("{0} has no image-embedding layout")]
    NoEmbeddingLayout(DatasetName),

    #[error("{0} has no segmentation layout; choose from CUB, ImageNet, ImageNette, ImageWoof")]
    NoSegmentationLayout(DatasetName),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatasetError>;
