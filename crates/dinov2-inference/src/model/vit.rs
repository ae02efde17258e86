//! DINOv2 Vision Transformer.
//!
//! Mirrors the layer and parameter layout of the published `dinov2_*14`
//! checkpoints (fused qkv attention, LayerScale residual scaling, class
//! token prepended to the patch sequence) so the weights can be loaded
//! without surgery.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{activation, backend::Backend, Distribution, Tensor},
};

/// Vision Transformer configuration for a DINOv2 backbone.
#[derive(Config, Debug)]
pub struct Dinov2Config {
    /// Input image size (height and width)
    pub image_size: usize,
    /// Patch size
    pub patch_size: usize,
    /// Embedding dimension
    pub embed_dim: usize,
    /// Number of transformer blocks
    pub depth: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// MLP hidden dimension ratio
    pub mlp_ratio: f64,
    /// Initial value for the LayerScale parameters
    pub layer_scale_init: f64,
}

impl Dinov2Config {
    /// Number of patch tokens (excluding the class token).
    pub fn num_patches(&self) -> usize {
        let side = self.image_size / self.patch_size;
        side * side
    }
}

/// Splits the image into non-overlapping patches and projects each one
/// into the embedding space.
#[derive(Module, Debug)]
pub struct PatchEmbedding<B: Backend> {
    proj: Conv2d<B>,
}

impl<B: Backend> PatchEmbedding<B> {
    pub fn new(in_channels: usize, embed_dim: usize, patch_size: usize, device: &B::Device) -> Self {
        let proj = Conv2dConfig::new([in_channels, embed_dim], [patch_size, patch_size])
            .with_stride([patch_size, patch_size])
            .with_bias(true)
            .init(device);

        Self { proj }
    }

    /// [batch, 3, H, W] -> [batch, num_patches, embed_dim]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.proj.forward(x);
        let [batch_size, embed_dim, h, w] = x.dims();
        x.reshape([batch_size, embed_dim, h * w]).swap_dims(1, 2)
    }
}

/// Multi-head self-attention with the fused qkv projection used by the
/// DINOv2 checkpoints.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    qkv: Linear<B>,
    proj: Linear<B>,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    pub fn new(embed_dim: usize, num_heads: usize, device: &B::Device) -> Self {
        let qkv = LinearConfig::new(embed_dim, embed_dim * 3)
            .with_bias(true)
            .init(device);
        let proj = LinearConfig::new(embed_dim, embed_dim)
            .with_bias(true)
            .init(device);

        Self {
            qkv,
            proj,
            num_heads,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, seq_len, embed_dim] = x.dims();
        let head_dim = embed_dim / self.num_heads;
        let scale = (head_dim as f64).powf(-0.5);

        // [batch, seq, 3 * dim] -> [3, batch, heads, seq, head_dim]
        let qkv = self
            .qkv
            .forward(x)
            .reshape([batch_size, seq_len, 3, self.num_heads, head_dim])
            .permute([2, 0, 3, 1, 4]);

        let q = qkv
            .clone()
            .slice([0..1])
            .reshape([batch_size * self.num_heads, seq_len, head_dim]);
        let k = qkv
            .clone()
            .slice([1..2])
            .reshape([batch_size * self.num_heads, seq_len, head_dim]);
        let v = qkv
            .slice([2..3])
            .reshape([batch_size * self.num_heads, seq_len, head_dim]);

        let attn = q.mul_scalar(scale).matmul(k.transpose());
        let attn = activation::softmax(attn, 2);

        let out = attn
            .matmul(v)
            .reshape([batch_size, self.num_heads, seq_len, head_dim])
            .permute([0, 2, 1, 3])
            .reshape([batch_size, seq_len, embed_dim]);

        self.proj.forward(out)
    }
}

/// Learnable per-channel scaling applied to each residual branch.
#[derive(Module, Debug)]
pub struct LayerScale<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
}

impl<B: Backend> LayerScale<B> {
    pub fn new(dim: usize, init_value: f64, device: &B::Device) -> Self {
        let gamma = Param::from_tensor(Tensor::ones([dim], device).mul_scalar(init_value));

        Self { gamma }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        x * self.gamma.val().unsqueeze::<3>()
    }
}

/// MLP block with GELU activation.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn new(in_features: usize, hidden_features: usize, device: &B::Device) -> Self {
        let fc1 = LinearConfig::new(in_features, hidden_features).init(device);
        let fc2 = LinearConfig::new(hidden_features, in_features).init(device);
        let dropout = DropoutConfig::new(0.0).init();

        Self { fc1, fc2, dropout }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.fc1.forward(x);
        let x = activation::gelu(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }
}

/// Transformer block: pre-norm attention and MLP, each followed by a
/// LayerScale before the residual add.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    ls1: LayerScale<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    ls2: LayerScale<B>,
}

impl<B: Backend> Block<B> {
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        mlp_hidden: usize,
        layer_scale_init: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            norm1: LayerNormConfig::new(embed_dim).init(device),
            attn: Attention::new(embed_dim, num_heads, device),
            ls1: LayerScale::new(embed_dim, layer_scale_init, device),
            norm2: LayerNormConfig::new(embed_dim).init(device),
            mlp: Mlp::new(embed_dim, mlp_hidden, device),
            ls2: LayerScale::new(embed_dim, layer_scale_init, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.ls1.forward(self.attn.forward(self.norm1.forward(x)));
        x.clone() + self.ls2.forward(self.mlp.forward(self.norm2.forward(x)))
    }
}

/// DINOv2 Vision Transformer backbone.
#[derive(Module, Debug)]
pub struct DinoVisionTransformer<B: Backend> {
    patch_embed: PatchEmbedding<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embed: Param<Tensor<B, 3>>,
    blocks: Vec<Block<B>>,
    norm: LayerNorm<B>,
}

impl<B: Backend> DinoVisionTransformer<B> {
    pub fn new(config: &Dinov2Config, device: &B::Device) -> Self {
        let patch_embed = PatchEmbedding::new(3, config.embed_dim, config.patch_size, device);

        let cls_token = Param::from_tensor(Tensor::random(
            [1, 1, config.embed_dim],
            Distribution::Normal(0.0, 0.02),
            device,
        ));
        let pos_embed = Param::from_tensor(Tensor::random(
            [1, 1 + config.num_patches(), config.embed_dim],
            Distribution::Normal(0.0, 0.02),
            device,
        ));

        let mlp_hidden = (config.embed_dim as f64 * config.mlp_ratio) as usize;
        let blocks = (0..config.depth)
            .map(|_| {
                Block::new(
                    config.embed_dim,
                    config.num_heads,
                    mlp_hidden,
                    config.layer_scale_init,
                    device,
                )
            })
            .collect();

        let norm = LayerNormConfig::new(config.embed_dim).init(device);

        Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
        }
    }

    /// Embeds a batch of preprocessed images.
    ///
    /// Input must match the configured `image_size`. Returns the
    /// normalized class token, [batch, embed_dim].
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let patches = self.patch_embed.forward(images);
        let cls = self.cls_token.val().repeat_dim(0, batch_size);

        let mut x = Tensor::cat(vec![cls, patches], 1) + self.pos_embed.val();
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.norm.forward(x);

        let [_, _, embed_dim] = x.dims();
        x.slice([0..batch_size, 0..1])
            .reshape([batch_size, embed_dim])
    }

    pub fn device(&self) -> B::Device {
        self.pos_embed.device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> Dinov2Config {
        Dinov2Config {
            image_size: 28,
            patch_size: 14,
            embed_dim: 16,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 4.0,
            layer_scale_init: 1e-5,
        }
    }

    #[test]
    fn num_patches_counts_grid_cells() {
        assert_eq!(tiny_config().num_patches(), 4);

        let large = Dinov2Config {
            image_size: 224,
            patch_size: 14,
            embed_dim: 1024,
            depth: 24,
            num_heads: 16,
            mlp_ratio: 4.0,
            layer_scale_init: 1e-5,
        };
        assert_eq!(large.num_patches(), 256);
    }

    #[test]
    fn patch_embedding_shape() {
        let device = Default::default();
        let patch_embed = PatchEmbedding::<TestBackend>::new(3, 16, 14, &device);

        let x = Tensor::zeros([2, 3, 28, 28], &device);
        let out = patch_embed.forward(x);

        assert_eq!(out.dims(), [2, 4, 16]);
    }

    #[test]
    fn attention_preserves_shape() {
        let device = Default::default();
        let attn = Attention::<TestBackend>::new(16, 2, &device);

        let x = Tensor::random([1, 5, 16], Distribution::Normal(0.0, 1.0), &device);
        let out = attn.forward(x);

        assert_eq!(out.dims(), [1, 5, 16]);
    }

    #[test]
    fn layer_scale_multiplies_by_init_value() {
        let device = Default::default();
        let ls = LayerScale::<TestBackend>::new(4, 0.5, &device);

        let x = Tensor::ones([1, 2, 4], &device);
        let out: Vec<f32> = ls.forward(x).into_data().to_vec().unwrap();

        for value in out {
            assert!((value - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn forward_returns_class_token_embedding() {
        let device = Default::default();
        let config = tiny_config();
        let model = DinoVisionTransformer::<TestBackend>::new(&config, &device);

        let images = Tensor::random([2, 3, 28, 28], Distribution::Normal(0.0, 1.0), &device);
        let embeddings = model.forward(images);

        assert_eq!(embeddings.dims(), [2, 16]);
    }
}
