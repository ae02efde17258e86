//! ViTDet image encoder.
//!
//! Windowed attention with decomposed relative position embeddings,
//! interleaved with a few global-attention blocks, followed by a neck
//! that projects the feature map down to the prompt embedding width.
//! The parameter layout matches the `image_encoder` section of the
//! published SAM checkpoints.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation, backend::Backend, Distribution, Int, Tensor, TensorData},
};

use super::common::{LayerNorm2d, MlpBlock};

/// Image encoder configuration.
#[derive(Config, Debug)]
pub struct ViTConfig {
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
    /// Channels of the output feature map
    pub out_channels: usize,
    /// Attention window size for the windowed blocks
    pub window_size: usize,
    /// Indices of the blocks that attend globally
    pub global_attn_indices: Vec<usize>,
}

impl ViTConfig {
    /// Side length of the patch grid.
    pub fn feature_size(&self) -> usize {
        self.image_size / self.patch_size
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

    /// [batch, 3, H, W] -> [batch, H/p, W/p, embed_dim]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.proj.forward(x).permute([0, 2, 3, 1])
    }
}

/// Partitions a [B, H, W, C] map into `window_size` square windows,
/// zero-padding the bottom and right edges when needed.
///
/// Returns the windows as [B * num_windows, ws, ws, C] together with
/// the padded spatial size.
pub fn window_partition<B: Backend>(
    x: Tensor<B, 4>,
    window_size: usize,
) -> (Tensor<B, 4>, (usize, usize)) {
    let [batch, height, width, channels] = x.dims();

    let pad_h = (window_size - height % window_size) % window_size;
    let pad_w = (window_size - width % window_size) % window_size;
    let (padded_h, padded_w) = (height + pad_h, width + pad_w);

    let x = if pad_h > 0 || pad_w > 0 {
        let canvas: Tensor<B, 4> = Tensor::zeros([batch, padded_h, padded_w, channels], &x.device());
        canvas.slice_assign([0..batch, 0..height, 0..width, 0..channels], x)
    } else {
        x
    };

    let windows = x
        .reshape([
            batch,
            padded_h / window_size,
            window_size,
            padded_w / window_size,
            window_size,
            channels,
        ])
        .permute([0, 1, 3, 2, 4, 5])
        .reshape([
            batch * (padded_h / window_size) * (padded_w / window_size),
            window_size,
            window_size,
            channels,
        ]);

    (windows, (padded_h, padded_w))
}

/// Reverses [`window_partition`], cropping away any padding.
pub fn window_unpartition<B: Backend>(
    windows: Tensor<B, 4>,
    window_size: usize,
    padded_hw: (usize, usize),
    original_hw: (usize, usize),
) -> Tensor<B, 4> {
    let (padded_h, padded_w) = padded_hw;
    let (height, width) = original_hw;
    let [total_windows, _, _, channels] = windows.dims();
    let batch = total_windows / ((padded_h / window_size) * (padded_w / window_size));

    let x = windows
        .reshape([
            batch,
            padded_h / window_size,
            padded_w / window_size,
            window_size,
            window_size,
            channels,
        ])
        .permute([0, 1, 3, 2, 4, 5])
        .reshape([batch, padded_h, padded_w, channels]);

    if padded_h > height || padded_w > width {
        x.slice([0..batch, 0..height, 0..width, 0..channels])
    } else {
        x
    }
}

/// Looks up the relative position embedding for every query/key pair
/// along one axis: [size, size, head_dim].
fn rel_pos_table<B: Backend>(size: usize, rel_pos: Tensor<B, 2>) -> Tensor<B, 3> {
    let device = rel_pos.device();
    let [_, head_dim] = rel_pos.dims();

    let mut indices = Vec::with_capacity(size * size);
    for q in 0..size {
        for k in 0..size {
            indices.push((q + size - 1 - k) as i64);
        }
    }
    let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [size * size]), &device);

    rel_pos.select(0, indices).reshape([size, size, head_dim])
}

/// Adds decomposed relative position biases to the attention logits.
///
/// `attn` is [batch * heads, h * w, h * w] and `q` the matching query
/// tensor; query and key grids share the same size here.
fn add_decomposed_rel_pos<B: Backend>(
    attn: Tensor<B, 3>,
    q: Tensor<B, 3>,
    rel_pos_h: Tensor<B, 2>,
    rel_pos_w: Tensor<B, 2>,
    size: (usize, usize),
) -> Tensor<B, 3> {
    let (height, width) = size;
    let [batch_heads, _, head_dim] = q.dims();

    let rh = rel_pos_table(height, rel_pos_h);
    let rw = rel_pos_table(width, rel_pos_w);

    let r_q = q.reshape([batch_heads, height, width, head_dim]);

    // rel_h[b, qh, qw, kh] = sum_c r_q[b, qh, qw, c] * rh[qh, kh, c]
    let rel_h = r_q
        .clone()
        .permute([1, 0, 2, 3])
        .reshape([height, batch_heads * width, head_dim])
        .matmul(rh.swap_dims(1, 2))
        .reshape([height, batch_heads, width, height])
        .permute([1, 0, 2, 3]);

    // rel_w[b, qh, qw, kw] = sum_c r_q[b, qh, qw, c] * rw[qw, kw, c]
    let rel_w = r_q
        .permute([2, 0, 1, 3])
        .reshape([width, batch_heads * height, head_dim])
        .matmul(rw.swap_dims(1, 2))
        .reshape([width, batch_heads, height, width])
        .permute([1, 2, 0, 3]);

    let attn = attn.reshape([batch_heads, height, width, height, width])
        + rel_h.unsqueeze_dim::<5>(4)
        + rel_w.unsqueeze_dim::<5>(3);

    attn.reshape([batch_heads, height * width, height * width])
}

/// Multi-head self-attention over a spatial grid, with the fused qkv
/// projection and relative position embeddings of the checkpoints.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    qkv: Linear<B>,
    proj: Linear<B>,
    rel_pos_h: Param<Tensor<B, 2>>,
    rel_pos_w: Param<Tensor<B, 2>>,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    /// `input_size` is the grid side the block attends over: the window
    /// size for windowed blocks, the full patch grid otherwise.
    pub fn new(embed_dim: usize, num_heads: usize, input_size: usize, device: &B::Device) -> Self {
        let head_dim = embed_dim / num_heads;

        Self {
            qkv: LinearConfig::new(embed_dim, embed_dim * 3)
                .with_bias(true)
                .init(device),
            proj: LinearConfig::new(embed_dim, embed_dim)
                .with_bias(true)
                .init(device),
            rel_pos_h: Param::from_tensor(Tensor::zeros([2 * input_size - 1, head_dim], device)),
            rel_pos_w: Param::from_tensor(Tensor::zeros([2 * input_size - 1, head_dim], device)),
            num_heads,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, height, width, channels] = x.dims();
        let head_dim = channels / self.num_heads;
        let scale = (head_dim as f64).powf(-0.5);
        let tokens = height * width;

        let qkv = self
            .qkv
            .forward(x.reshape([batch, tokens, channels]))
            .reshape([batch, tokens, 3, self.num_heads, head_dim])
            .permute([2, 0, 3, 1, 4]);

        let q = qkv
            .clone()
            .slice([0..1])
            .reshape([batch * self.num_heads, tokens, head_dim]);
        let k = qkv
            .clone()
            .slice([1..2])
            .reshape([batch * self.num_heads, tokens, head_dim]);
        let v = qkv
            .slice([2..3])
            .reshape([batch * self.num_heads, tokens, head_dim]);

        let attn = q.clone().mul_scalar(scale).matmul(k.transpose());
        let attn = add_decomposed_rel_pos(
            attn,
            q,
            self.rel_pos_h.val(),
            self.rel_pos_w.val(),
            (height, width),
        );
        let attn = activation::softmax(attn, 2);

        let out = attn
            .matmul(v)
            .reshape([batch, self.num_heads, height, width, head_dim])
            .permute([0, 2, 3, 1, 4])
            .reshape([batch, height, width, channels]);

        self.proj.forward(out)
    }
}

/// Transformer block, windowed unless `window_size` is zero.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    norm2: LayerNorm<B>,
    mlp: MlpBlock<B>,
    window_size: usize,
}

impl<B: Backend> Block<B> {
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        mlp_hidden: usize,
        window_size: usize,
        grid_size: usize,
        device: &B::Device,
    ) -> Self {
        let input_size = if window_size > 0 { window_size } else { grid_size };

        Self {
            norm1: LayerNormConfig::new(embed_dim).init(device),
            attn: Attention::new(embed_dim, num_heads, input_size, device),
            norm2: LayerNormConfig::new(embed_dim).init(device),
            mlp: MlpBlock::new(embed_dim, mlp_hidden, true, device),
            window_size,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, height, width, _] = x.dims();
        let shortcut = x.clone();

        let x = self.norm1.forward(x);

        let (x, padded_hw) = if self.window_size > 0 {
            window_partition(x, self.window_size)
        } else {
            (x, (height, width))
        };

        let x = self.attn.forward(x);

        let x = if self.window_size > 0 {
            window_unpartition(x, self.window_size, padded_hw, (height, width))
        } else {
            x
        };

        let x = shortcut + x;
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }
}

/// Projects the encoder output down to the prompt embedding width.
#[derive(Module, Debug)]
pub struct Neck<B: Backend> {
    conv1: Conv2d<B>,
    ln1: LayerNorm2d<B>,
    conv2: Conv2d<B>,
    ln2: LayerNorm2d<B>,
}

impl<B: Backend> Neck<B> {
    pub fn new(embed_dim: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([embed_dim, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            ln1: LayerNorm2d::new(out_channels, device),
            conv2: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            ln2: LayerNorm2d::new(out_channels, device),
        }
    }

    /// [batch, H, W, C] -> [batch, out_channels, H, W]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = x.permute([0, 3, 1, 2]);
        let x = self.ln1.forward(self.conv1.forward(x));
        self.ln2.forward(self.conv2.forward(x))
    }
}

/// SAM image encoder.
#[derive(Module, Debug)]
pub struct ViT<B: Backend> {
    patch_embed: PatchEmbedding<B>,
    pos_embed: Param<Tensor<B, 4>>,
    blocks: Vec<Block<B>>,
    neck: Neck<B>,
}

impl<B: Backend> ViT<B> {
    pub fn new(config: &ViTConfig, device: &B::Device) -> Self {
        let grid_size = config.feature_size();

        let patch_embed = PatchEmbedding::new(3, config.embed_dim, config.patch_size, device);
        let pos_embed = Param::from_tensor(Tensor::random(
            [1, grid_size, grid_size, config.embed_dim],
            Distribution::Normal(0.0, 0.02),
            device,
        ));

        let mlp_hidden = (config.embed_dim as f64 * config.mlp_ratio) as usize;
        let blocks = (0..config.depth)
            .map(|index| {
                let window_size = if config.global_attn_indices.contains(&index) {
                    0
                } else {
                    config.window_size
                };
                Block::new(
                    config.embed_dim,
                    config.num_heads,
                    mlp_hidden,
                    window_size,
                    grid_size,
                    device,
                )
            })
            .collect();

        let neck = Neck::new(config.embed_dim, config.out_channels, device);

        Self {
            patch_embed,
            pos_embed,
            blocks,
            neck,
        }
    }

    /// [batch, 3, image_size, image_size] -> [batch, out_channels, grid, grid]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.patch_embed.forward(x) + self.pos_embed.val();
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.neck.forward(x)
    }

    pub fn device(&self) -> B::Device {
        self.pos_embed.device()
    }
}
