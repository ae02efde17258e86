//! The assembled SAM model: image encoder, prompt encoder and mask
//! decoder, plus the pixel normalization applied before encoding.

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor, TensorData},
};

use super::mask_decoder::MaskDecoder;
use super::prompt_encoder::PromptEncoder;
use super::vit::{ViT, ViTConfig};

/// Logit threshold at which a mask pixel counts as foreground.
pub const MASK_THRESHOLD: f32 = 0.0;

/// Full model configuration.
#[derive(Config, Debug)]
pub struct SamConfig {
    pub image_encoder: ViTConfig,
    /// Width of the prompt and image embeddings fed to the decoder
    pub prompt_embed_dim: usize,
    /// Model input resolution
    pub image_size: usize,
    /// Channels of the mask-hint downscaling stack
    pub mask_in_chans: usize,
    /// Attention heads in the decoder transformer
    pub decoder_num_heads: usize,
    /// Hidden width of the decoder MLPs
    pub decoder_mlp_dim: usize,
    /// Multi-mask channels predicted per prompt
    pub num_multimask_outputs: usize,
}

impl SamConfig {
    fn with_encoder(
        embed_dim: usize,
        depth: usize,
        num_heads: usize,
        global_attn_indices: Vec<usize>,
    ) -> Self {
        Self {
            image_encoder: ViTConfig {
                image_size: 1024,
                patch_size: 16,
                embed_dim,
                depth,
                num_heads,
                mlp_ratio: 4.0,
                out_channels: 256,
                window_size: 14,
                global_attn_indices,
            },
            prompt_embed_dim: 256,
            image_size: 1024,
            mask_in_chans: 16,
            decoder_num_heads: 8,
            decoder_mlp_dim: 2048,
            num_multimask_outputs: 3,
        }
    }

    /// ViT-B backbone (91M parameters).
    pub fn vit_b() -> Self {
        Self::with_encoder(768, 12, 12, vec![2, 5, 8, 11])
    }

    /// ViT-L backbone (308M parameters).
    pub fn vit_l() -> Self {
        Self::with_encoder(1024, 24, 16, vec![5, 11, 17, 23])
    }

    /// ViT-H backbone (636M parameters).
    pub fn vit_h() -> Self {
        Self::with_encoder(1280, 32, 16, vec![7, 15, 23, 31])
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Sam<B> {
        let image_embedding_size = self.image_encoder.feature_size();

        let pixel_mean = Tensor::from_data(
            TensorData::new(vec![123.675f32, 116.28, 103.53], [3, 1, 1]),
            device,
        );
        let pixel_std = Tensor::from_data(
            TensorData::new(vec![58.395f32, 57.12, 57.375], [3, 1, 1]),
            device,
        );

        Sam {
            image_encoder: ViT::new(&self.image_encoder, device),
            prompt_encoder: PromptEncoder::new(
                self.prompt_embed_dim,
                image_embedding_size,
                self.image_size,
                self.mask_in_chans,
                device,
            ),
            mask_decoder: MaskDecoder::new(
                self.prompt_embed_dim,
                self.decoder_num_heads,
                self.decoder_mlp_dim,
                self.num_multimask_outputs,
                device,
            ),
            pixel_mean,
            pixel_std,
            image_size: self.image_size,
        }
    }
}

/// Segment Anything model.
#[derive(Module, Debug)]
pub struct Sam<B: Backend> {
    pub image_encoder: ViT<B>,
    pub prompt_encoder: PromptEncoder<B>,
    pub mask_decoder: MaskDecoder<B>,
    pixel_mean: Tensor<B, 3>,
    pixel_std: Tensor<B, 3>,
    image_size: usize,
}

impl<B: Backend> Sam<B> {
    pub fn device(&self) -> B::Device {
        self.prompt_encoder.device()
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Normalizes raw 0..255 pixel values, zero-pads to the model
    /// resolution and runs the image encoder.
    ///
    /// The input holds the aspect-preserving resize of the original
    /// image in its top-left corner.
    pub fn encode_image(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = image.dims();

        let mean = self.pixel_mean.clone().unsqueeze::<4>();
        let std = self.pixel_std.clone().unsqueeze::<4>();
        let x = (image - mean) / std;

        let x = if height < self.image_size || width < self.image_size {
            let canvas: Tensor<B, 4> =
                Tensor::zeros([batch, channels, self.image_size, self.image_size], &x.device());
            canvas.slice_assign([0..batch, 0..channels, 0..height, 0..width], x)
        } else {
            x
        };

        self.image_encoder.forward(x)
    }

    /// Predicts masks for one prompt of labeled points (model input
    /// coordinates). Returns low-resolution logits and quality scores.
    pub fn predict_from_points(
        &self,
        image_embeddings: Tensor<B, 4>,
        points: &[(f32, f32, bool)],
        multimask_output: bool,
    ) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let sparse = self.prompt_encoder.encode_points(points, true);
        let dense = self.prompt_encoder.no_mask_embedding(1);
        let image_pe = self.prompt_encoder.dense_pe();

        self.mask_decoder
            .forward(image_embeddings, image_pe, sparse, dense, multimask_output)
    }

    /// Predicts masks for a batch of single-point foreground prompts.
    pub fn predict_from_point_batch(
        &self,
        image_embeddings: Tensor<B, 4>,
        points: &[(f32, f32)],
        multimask_output: bool,
    ) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let sparse = self.prompt_encoder.encode_point_batch(points);
        let dense = self.prompt_encoder.no_mask_embedding(points.len());
        let image_pe = self.prompt_encoder.dense_pe();

        self.mask_decoder
            .forward(image_embeddings, image_pe, sparse, dense, multimask_output)
    }

    /// Predicts masks for a box prompt (model input coordinates).
    pub fn predict_from_box(
        &self,
        image_embeddings: Tensor<B, 4>,
        corners: (f32, f32, f32, f32),
        multimask_output: bool,
    ) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let sparse = self.prompt_encoder.encode_box(corners);
        let dense = self.prompt_encoder.no_mask_embedding(1);
        let image_pe = self.prompt_encoder.dense_pe();

        self.mask_decoder
            .forward(image_embeddings, image_pe, sparse, dense, multimask_output)
    }
}

#[cfg(test)]
pub(crate) fn tiny_sam_config() -> SamConfig {
    SamConfig {
        image_encoder: ViTConfig {
            image_size: 64,
            patch_size: 16,
            embed_dim: 8,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 2.0,
            out_channels: 8,
            window_size: 2,
            global_attn_indices: vec![1],
        },
        prompt_embed_dim: 8,
        image_size: 64,
        mask_in_chans: 4,
        decoder_num_heads: 2,
        decoder_mlp_dim: 16,
        num_multimask_outputs: 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn preset_configs_match_published_backbones() {
        let b = SamConfig::vit_b();
        assert_eq!(b.image_encoder.embed_dim, 768);
        assert_eq!(b.image_encoder.depth, 12);
        assert_eq!(b.image_encoder.global_attn_indices, vec![2, 5, 8, 11]);

        let l = SamConfig::vit_l();
        assert_eq!(l.image_encoder.embed_dim, 1024);
        assert_eq!(l.image_encoder.depth, 24);
        assert_eq!(l.image_encoder.global_attn_indices, vec![5, 11, 17, 23]);

        let h = SamConfig::vit_h();
        assert_eq!(h.image_encoder.embed_dim, 1280);
        assert_eq!(h.image_encoder.depth, 32);
        assert_eq!(h.image_encoder.num_heads, 16);
        assert_eq!(h.image_encoder.global_attn_indices, vec![7, 15, 23, 31]);

        for config in [b, l, h] {
            assert_eq!(config.prompt_embed_dim, 256);
            assert_eq!(config.image_size, 1024);
            assert_eq!(config.image_encoder.window_size, 14);
        }
    }

    #[test]
    fn encode_image_pads_to_model_resolution() {
        let device = Default::default();
        let sam = tiny_sam_config().init::<TestBackend>(&device);

        // A 64x43 input, as produced by the aspect-preserving resize.
        let image = Tensor::random([1, 3, 43, 64], Distribution::Uniform(0.0, 255.0), &device);
        let embeddings = sam.encode_image(image);

        assert_eq!(embeddings.dims(), [1, 8, 4, 4]);
    }

    #[test]
    fn point_prompt_produces_multimask_logits() {
        let device = Default::default();
        let sam = tiny_sam_config().init::<TestBackend>(&device);

        let image = Tensor::random([1, 3, 64, 64], Distribution::Uniform(0.0, 255.0), &device);
        let embeddings = sam.encode_image(image);

        let (masks, iou) =
            sam.predict_from_points(embeddings, &[(32.0, 32.0, true)], true);
        assert_eq!(masks.dims(), [1, 3, 16, 16]);
        assert_eq!(iou.dims(), [1, 3]);
    }

    #[test]
    fn point_batch_predicts_one_mask_set_per_point() {
        let device = Default::default();
        let sam = tiny_sam_config().init::<TestBackend>(&device);

        let image = Tensor::random([1, 3, 64, 64], Distribution::Uniform(0.0, 255.0), &device);
        let embeddings = sam.encode_image(image);

        let points = [(10.0, 10.0), (32.0, 40.0), (60.0, 8.0), (5.0, 60.0)];
        let (masks, iou) = sam.predict_from_point_batch(embeddings, &points, true);
        assert_eq!(masks.dims(), [4, 3, 16, 16]);
        assert_eq!(iou.dims(), [4, 3]);
    }

    #[test]
    fn box_prompt_produces_single_mask() {
        let device = Default::default();
        let sam = tiny_sam_config().init::<TestBackend>(&device);

        let image = Tensor::random([1, 3, 64, 64], Distribution::Uniform(0.0, 255.0), &device);
        let embeddings = sam.encode_image(image);

        let (masks, iou) = sam.predict_from_box(embeddings, (8.0, 8.0, 48.0, 40.0), false);
        assert_eq!(masks.dims(), [1, 1, 16, 16]);
        assert_eq!(iou.dims(), [1, 1]);
    }
}
