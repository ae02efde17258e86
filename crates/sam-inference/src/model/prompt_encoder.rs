//! Prompt encoder.
//!
//! Turns point, box and mask prompts into the sparse and dense
//! embeddings consumed by the mask decoder, using the random-Fourier
//! positional encoding of the published checkpoints.

use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Embedding, EmbeddingConfig,
    },
    tensor::{activation, backend::Backend, Distribution, Tensor, TensorData},
};

use super::common::LayerNorm2d;

/// Positional encoding from random spatial frequencies.
#[derive(Module, Debug)]
pub struct PositionEmbeddingRandom<B: Backend> {
    positional_encoding_gaussian_matrix: Param<Tensor<B, 2>>,
}

impl<B: Backend> PositionEmbeddingRandom<B> {
    pub fn new(num_pos_feats: usize, device: &B::Device) -> Self {
        Self {
            positional_encoding_gaussian_matrix: Param::from_tensor(Tensor::random(
                [2, num_pos_feats],
                Distribution::Normal(0.0, 1.0),
                device,
            )),
        }
    }

    pub fn device(&self) -> B::Device {
        self.positional_encoding_gaussian_matrix.device()
    }

    /// Encodes coordinates already normalized to [0, 1]: [n, 2] -> [n, 2 * num_pos_feats].
    fn encode(&self, coords: Tensor<B, 2>) -> Tensor<B, 2> {
        let coords = coords.mul_scalar(2.0).sub_scalar(1.0);
        let projected = coords
            .matmul(self.positional_encoding_gaussian_matrix.val())
            .mul_scalar(2.0 * std::f64::consts::PI);

        Tensor::cat(vec![projected.clone().sin(), projected.cos()], 1)
    }

    /// Dense positional encoding over a grid, [2 * num_pos_feats, h, w].
    pub fn forward_grid(&self, height: usize, width: usize) -> Tensor<B, 3> {
        let mut coords = Vec::with_capacity(height * width * 2);
        for y in 0..height {
            for x in 0..width {
                coords.push((x as f32 + 0.5) / width as f32);
                coords.push((y as f32 + 0.5) / height as f32);
            }
        }
        let coords = Tensor::from_data(TensorData::new(coords, [height * width, 2]), &self.device());

        let pe = self.encode(coords);
        let [_, channels] = pe.dims();
        pe.swap_dims(0, 1).reshape([channels, height, width])
    }

    /// Encodes (x, y) pixel coordinates relative to `image_size`.
    pub fn forward_with_coords(
        &self,
        coords: Tensor<B, 2>,
        image_size: (usize, usize),
    ) -> Tensor<B, 2> {
        let (height, width) = image_size;
        let scale = Tensor::from_floats(
            [[1.0 / width as f32, 1.0 / height as f32]],
            &self.device(),
        );
        self.encode(coords * scale)
    }
}

/// Downscales a mask hint to the dense embedding resolution.
#[derive(Module, Debug)]
pub struct MaskDownscaling<B: Backend> {
    conv1: Conv2d<B>,
    ln1: LayerNorm2d<B>,
    conv2: Conv2d<B>,
    ln2: LayerNorm2d<B>,
    conv3: Conv2d<B>,
}

impl<B: Backend> MaskDownscaling<B> {
    pub fn new(embed_dim: usize, mask_in_chans: usize, device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([1, mask_in_chans / 4], [2, 2])
                .with_stride([2, 2])
                .init(device),
            ln1: LayerNorm2d::new(mask_in_chans / 4, device),
            conv2: Conv2dConfig::new([mask_in_chans / 4, mask_in_chans], [2, 2])
                .with_stride([2, 2])
                .init(device),
            ln2: LayerNorm2d::new(mask_in_chans, device),
            conv3: Conv2dConfig::new([mask_in_chans, embed_dim], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = activation::gelu(self.ln1.forward(self.conv1.forward(mask)));
        let x = activation::gelu(self.ln2.forward(self.conv2.forward(x)));
        self.conv3.forward(x)
    }
}

/// Encodes prompts into the decoder's sparse and dense embeddings.
#[derive(Module, Debug)]
pub struct PromptEncoder<B: Backend> {
    pe_layer: PositionEmbeddingRandom<B>,
    point_embeddings: Vec<Embedding<B>>,
    not_a_point_embed: Embedding<B>,
    no_mask_embed: Embedding<B>,
    mask_downscaling: MaskDownscaling<B>,
    embed_dim: usize,
    input_image_size: usize,
    image_embedding_size: usize,
}

impl<B: Backend> PromptEncoder<B> {
    pub fn new(
        embed_dim: usize,
        image_embedding_size: usize,
        input_image_size: usize,
        mask_in_chans: usize,
        device: &B::Device,
    ) -> Self {
        // Negative point, positive point, and the two box corners.
        let point_embeddings = (0..4)
            .map(|_| EmbeddingConfig::new(1, embed_dim).init(device))
            .collect();

        Self {
            pe_layer: PositionEmbeddingRandom::new(embed_dim / 2, device),
            point_embeddings,
            not_a_point_embed: EmbeddingConfig::new(1, embed_dim).init(device),
            no_mask_embed: EmbeddingConfig::new(1, embed_dim).init(device),
            mask_downscaling: MaskDownscaling::new(embed_dim, mask_in_chans, device),
            embed_dim,
            input_image_size,
            image_embedding_size,
        }
    }

    pub fn device(&self) -> B::Device {
        self.pe_layer.device()
    }

    /// Positional encoding of the image embedding grid, [1, embed_dim, g, g].
    pub fn dense_pe(&self) -> Tensor<B, 4> {
        self.pe_layer
            .forward_grid(self.image_embedding_size, self.image_embedding_size)
            .unsqueeze::<4>()
    }

    /// Dense embedding standing in for an absent mask hint, [batch, embed_dim, g, g].
    pub fn no_mask_embedding(&self, batch: usize) -> Tensor<B, 4> {
        self.no_mask_embed
            .weight
            .val()
            .reshape([1, self.embed_dim, 1, 1])
            .repeat_dim(0, batch)
            .repeat_dim(2, self.image_embedding_size)
            .repeat_dim(3, self.image_embedding_size)
    }

    /// Encodes one prompt of labeled points as [1, n(+1), embed_dim].
    ///
    /// Coordinates are in the model input pixel space. With `pad` set,
    /// a learned padding token is appended in place of a box prompt.
    pub fn encode_points(&self, points: &[(f32, f32, bool)], pad: bool) -> Tensor<B, 3> {
        let device = self.device();

        let mut data = Vec::with_capacity(points.len() * 2);
        for (x, y, _) in points {
            data.push(x + 0.5);
            data.push(y + 0.5);
        }
        let coords = Tensor::from_data(TensorData::new(data, [points.len(), 2]), &device);
        let pe = self.pe_layer.forward_with_coords(
            coords,
            (self.input_image_size, self.input_image_size),
        );

        let mut rows = Vec::with_capacity(points.len() + 1);
        for (index, (_, _, positive)) in points.iter().enumerate() {
            let label = usize::from(*positive);
            let row = pe.clone().slice([index..index + 1])
                + self.point_embeddings[label].weight.val();
            rows.push(row);
        }
        if pad {
            rows.push(self.not_a_point_embed.weight.val());
        }

        Tensor::cat(rows, 0).unsqueeze::<3>()
    }

    /// Encodes one prompt per point, each padded, as [n, 2, embed_dim].
    ///
    /// This is the batched form used by the automatic mask generator,
    /// where every grid point is its own foreground prompt.
    pub fn encode_point_batch(&self, points: &[(f32, f32)]) -> Tensor<B, 3> {
        let device = self.device();
        let count = points.len();

        let mut data = Vec::with_capacity(count * 2);
        for (x, y) in points {
            data.push(x + 0.5);
            data.push(y + 0.5);
        }
        let coords = Tensor::from_data(TensorData::new(data, [count, 2]), &device);

        let pe = self.pe_layer.forward_with_coords(
            coords,
            (self.input_image_size, self.input_image_size),
        ) + self.point_embeddings[1].weight.val();
        let pad = self.not_a_point_embed.weight.val().repeat_dim(0, count);

        Tensor::stack(vec![pe, pad], 1)
    }

    /// Encodes a box prompt as its two corner tokens, [1, 2, embed_dim].
    pub fn encode_box(&self, corners: (f32, f32, f32, f32)) -> Tensor<B, 3> {
        let device = self.device();
        let (x0, y0, x1, y1) = corners;

        let coords = Tensor::from_data(
            TensorData::new(vec![x0 + 0.5, y0 + 0.5, x1 + 0.5, y1 + 0.5], [2, 2]),
            &device,
        );
        let pe = self.pe_layer.forward_with_coords(
            coords,
            (self.input_image_size, self.input_image_size),
        );

        let first = pe.clone().slice([0..1]) + self.point_embeddings[2].weight.val();
        let second = pe.slice([1..2]) + self.point_embeddings[3].weight.val();

        Tensor::cat(vec![first, second], 0).unsqueeze::<3>()
    }

    /// Downscales a mask hint into a dense embedding.
    pub fn encode_mask(&self, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        self.mask_downscaling.forward(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn encoder() -> PromptEncoder<TestBackend> {
        let device = Default::default();
        PromptEncoder::new(8, 4, 64, 4, &device)
    }

    #[test]
    fn grid_encoding_is_bounded_sinusoids() {
        let encoder = encoder();
        let pe = encoder.dense_pe();
        assert_eq!(pe.dims(), [1, 8, 4, 4]);

        let values: Vec<f32> = pe.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn point_prompts_append_padding_token() {
        let encoder = encoder();

        let padded = encoder.encode_points(&[(8.0, 8.0, true), (30.0, 12.0, false)], true);
        assert_eq!(padded.dims(), [1, 3, 8]);

        let bare = encoder.encode_points(&[(8.0, 8.0, true)], false);
        assert_eq!(bare.dims(), [1, 1, 8]);
    }

    #[test]
    fn point_batch_encodes_one_prompt_per_point() {
        let encoder = encoder();
        let batch = encoder.encode_point_batch(&[(4.0, 4.0), (20.0, 40.0), (63.0, 1.0)]);
        assert_eq!(batch.dims(), [3, 2, 8]);
    }

    #[test]
    fn box_prompt_uses_two_corner_tokens() {
        let encoder = encoder();
        let tokens = encoder.encode_box((4.0, 4.0, 40.0, 52.0));
        assert_eq!(tokens.dims(), [1, 2, 8]);
    }

    #[test]
    fn no_mask_embedding_fills_the_grid() {
        let encoder = encoder();
        let dense = encoder.no_mask_embedding(3);
        assert_eq!(dense.dims(), [3, 8, 4, 4]);

        // Same learned value broadcast over every cell of a channel plane.
        let values: Vec<f32> = dense.into_data().to_vec().unwrap();
        let plane = &values[0..16];
        assert!(plane.iter().all(|v| (*v - plane[0]).abs() < 1e-6));
    }

    #[test]
    fn mask_hint_downscales_to_embedding_grid() {
        let encoder = encoder();
        let device = Default::default();

        let mask = Tensor::<TestBackend, 4>::zeros([1, 1, 16, 16], &device);
        assert_eq!(encoder.encode_mask(mask).dims(), [1, 8, 4, 4]);
    }

    #[test]
    fn positional_encoding_is_deterministic() {
        let encoder = encoder();
        let a: Vec<f32> = encoder.dense_pe().into_data().to_vec().unwrap();
        let b: Vec<f32> = encoder.dense_pe().into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }
}
