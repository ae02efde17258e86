//! Image preprocessing for DINOv2.
//!
//! The classification eval transform used by the published models:
//! resize the shorter side, take a center crop, scale to [0, 1] and
//! normalize with the ImageNet statistics.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage, RgbImage};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing configuration.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Target length of the shorter image side before cropping
    pub resize_size: u32,
    /// Side length of the center crop fed to the model
    pub crop_size: u32,
    /// Per-channel normalization mean
    pub mean: [f32; 3],
    /// Per-channel normalization std
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resize_size: 256,
            crop_size: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

/// Resizes so the shorter side equals `target`, preserving aspect ratio.
pub fn resize_shorter_side(image: &DynamicImage, target: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let shorter = width.min(height).max(1);

    let new_width = ((width as f64 * target as f64 / shorter as f64).round()) as u32;
    let new_height = ((height as f64 * target as f64 / shorter as f64).round()) as u32;

    image.resize_exact(new_width, new_height, FilterType::CatmullRom)
}

/// Crops a `size` x `size` square from the image center.
pub fn center_crop(image: &DynamicImage, size: u32) -> DynamicImage {
    let x0 = image.width().saturating_sub(size) / 2;
    let y0 = image.height().saturating_sub(size) / 2;
    image.crop_imm(x0, y0, size, size)
}

/// Converts an RGB image into a normalized [1, 3, H, W] tensor.
pub fn rgb_to_tensor<B: Backend>(
    image: &RgbImage,
    mean: [f32; 3],
    std: [f32; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;

    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }

    Tensor::from_data(TensorData::new(data, [1, 3, height, width]), device)
}

/// Applies the full eval transform to a single image.
pub fn preprocess_image<B: Backend>(
    image: &DynamicImage,
    config: &PreprocessConfig,
    device: &B::Device,
) -> Tensor<B, 4> {
    let resized = resize_shorter_side(image, config.resize_size);
    let cropped = center_crop(&resized, config.crop_size);
    rgb_to_tensor(&cropped.to_rgb8(), config.mean, config.std, device)
}

/// Preprocesses a batch of images into a single [N, 3, crop, crop] tensor.
pub fn preprocess_image_batch<B: Backend>(
    images: &[DynamicImage],
    config: &PreprocessConfig,
    device: &B::Device,
) -> Tensor<B, 4> {
    let tensors: Vec<Tensor<B, 4>> = images
        .iter()
        .map(|image| preprocess_image(image, config, device))
        .collect();

    Tensor::cat(tensors, 0)
}
