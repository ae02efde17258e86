pub mod common;
pub mod mask_decoder;
pub mod prompt_encoder;
pub mod sam;
pub mod vit;

pub use mask_decoder::MaskDecoder;
pub use prompt_encoder::PromptEncoder;
pub use sam::{Sam, SamConfig, MASK_THRESHOLD};
pub use vit::{ViT, ViTConfig};
