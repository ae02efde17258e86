//! Image preprocessing for SAM.
//!
//! Images are resized so their longest side matches the model input
//! resolution and converted to raw 0..255 float tensors; normalization
//! and padding happen inside the model so the padded border stays at
//! the training-time zero.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage, RgbImage};

/// Preprocessing configuration.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Model input resolution (longest side after resizing)
    pub target_size: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self { target_size: 1024 }
    }
}

/// A resized image ready for encoding, with the geometry needed to map
/// model outputs back to the original resolution.
#[derive(Debug)]
pub struct PreprocessedImage<B: Backend> {
    /// [1, 3, scaled_h, scaled_w] raw 0..255 floats
    pub tensor: Tensor<B, 4>,
    /// Original (width, height)
    pub original_size: (u32, u32),
    /// (width, height) after the aspect-preserving resize
    pub scaled_size: (u32, u32),
}

/// Size after resizing so the longest side equals `target`.
pub fn scaled_size(original: (u32, u32), target: u32) -> (u32, u32) {
    let (width, height) = original;
    let longest = width.max(height).max(1);
    let scale = target as f64 / longest as f64;

    let scaled_w = ((width as f64 * scale + 0.5) as u32).clamp(1, target);
    let scaled_h = ((height as f64 * scale + 0.5) as u32).clamp(1, target);
    (scaled_w, scaled_h)
}

/// Maps a point from original image coordinates into model input
/// coordinates.
pub fn apply_coords(
    point: (f32, f32),
    original_size: (u32, u32),
    scaled: (u32, u32),
) -> (f32, f32) {
    let (x, y) = point;
    (
        x * scaled.0 as f32 / original_size.0 as f32,
        y * scaled.1 as f32 / original_size.1 as f32,
    )
}

/// Converts an RGB image into a [1, 3, H, W] tensor of raw pixel values.
pub fn rgb_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;

    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = pixel[c] as f32;
        }
    }

    Tensor::from_data(TensorData::new(data, [1, 3, height, width]), device)
}

/// Resizes an image for the encoder and records its geometry.
pub fn preprocess_image<B: Backend>(
    image: &DynamicImage,
    config: &PreprocessConfig,
    device: &B::Device,
) -> PreprocessedImage<B> {
    let original_size = (image.width(), image.height());
    let scaled = scaled_size(original_size, config.target_size);

    let resized = image.resize_exact(scaled.0, scaled.1, FilterType::Triangle);

    PreprocessedImage {
        tensor: rgb_to_tensor(&resized.to_rgb8(), device),
        original_size,
        scaled_size: scaled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    type TestBackend = NdArray;

    #[test]
    fn scaled_size_targets_longest_side() {
        assert_eq!(scaled_size((2048, 1024), 1024), (1024, 512));
        assert_eq!(scaled_size((800, 600), 1024), (1024, 768));
        assert_eq!(scaled_size((600, 800), 1024), (768, 1024));
        assert_eq!(scaled_size((1024, 1024), 1024), (1024, 1024));
    }

    #[test]
    fn apply_coords_scales_into_model_space() {
        let (x, y) = apply_coords((400.0, 300.0), (800, 600), (1024, 768));
        assert!((x - 512.0).abs() < 1e-3);
        assert!((y - 384.0).abs() < 1e-3);
    }

    #[test]
    fn preprocess_keeps_raw_pixel_range() {
        let device = Default::default();
        let config = PreprocessConfig { target_size: 64 };

        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(128, 96, Rgb([200, 100, 50])));
        let pre = preprocess_image::<TestBackend>(&image, &config, &device);

        assert_eq!(pre.original_size, (128, 96));
        assert_eq!(pre.scaled_size, (64, 48));
        assert_eq!(pre.tensor.dims(), [1, 3, 48, 64]);

        let values: Vec<f32> = pre.tensor.into_data().to_vec().unwrap();
        let plane = 48 * 64;
        assert!((values[0] - 200.0).abs() < 1.0);
        assert!((values[plane] - 100.0).abs() < 1.0);
        assert!((values[2 * plane] - 50.0).abs() < 1.0);
    }
}
