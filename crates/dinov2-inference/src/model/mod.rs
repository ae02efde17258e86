pub mod vit;

pub use vit::*;
