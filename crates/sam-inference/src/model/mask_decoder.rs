//! Mask decoder.
//!
//! A small two-way transformer lets the prompt tokens and the image
//! embedding attend to each other, then hypernetwork heads turn the
//! mask tokens into per-mask convolution weights over an upscaled
//! feature map. Parameter layout matches the `mask_decoder` section of
//! the published checkpoints.

use burn::{
    module::Module,
    nn::{
        conv::{ConvTranspose2d, ConvTranspose2dConfig},
        Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{activation, backend::Backend, Tensor},
};

use super::common::{LayerNorm2d, MlpBlock};

/// Attention with explicit projections and optional internal
/// downsampling of the embedding width.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    q_proj: Linear<B>,
    k_proj: Linear<B>,
    v_proj: Linear<B>,
    out_proj: Linear<B>,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    pub fn new(
        embedding_dim: usize,
        num_heads: usize,
        downsample_rate: usize,
        device: &B::Device,
    ) -> Self {
        let internal_dim = embedding_dim / downsample_rate;

        Self {
            q_proj: LinearConfig::new(embedding_dim, internal_dim).init(device),
            k_proj: LinearConfig::new(embedding_dim, internal_dim).init(device),
            v_proj: LinearConfig::new(embedding_dim, internal_dim).init(device),
            out_proj: LinearConfig::new(internal_dim, embedding_dim).init(device),
            num_heads,
        }
    }

    fn separate_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, tokens, internal] = x.dims();
        let head_dim = internal / self.num_heads;
        x.reshape([batch, tokens, self.num_heads, head_dim])
            .swap_dims(1, 2)
            .reshape([batch * self.num_heads, tokens, head_dim])
    }

    pub fn forward(&self, q: Tensor<B, 3>, k: Tensor<B, 3>, v: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, q_tokens, _] = q.dims();

        let q = self.separate_heads(self.q_proj.forward(q));
        let k = self.separate_heads(self.k_proj.forward(k));
        let v = self.separate_heads(self.v_proj.forward(v));

        let [_, _, head_dim] = q.dims();
        let scale = (head_dim as f64).powf(-0.5);

        let attn = activation::softmax(q.mul_scalar(scale).matmul(k.transpose()), 2);
        let out = attn.matmul(v);

        let [_, _, head_dim] = out.dims();
        let out = out
            .reshape([batch, self.num_heads, q_tokens, head_dim])
            .swap_dims(1, 2)
            .reshape([batch, q_tokens, self.num_heads * head_dim]);

        self.out_proj.forward(out)
    }
}

/// One round of token self-attention plus cross-attention in both
/// directions between tokens and image embedding.
#[derive(Module, Debug)]
pub struct TwoWayAttentionBlock<B: Backend> {
    self_attn: Attention<B>,
    norm1: LayerNorm<B>,
    cross_attn_token_to_image: Attention<B>,
    norm2: LayerNorm<B>,
    mlp: MlpBlock<B>,
    norm3: LayerNorm<B>,
    cross_attn_image_to_token: Attention<B>,
    norm4: LayerNorm<B>,
    skip_first_layer_pe: bool,
}

impl<B: Backend> TwoWayAttentionBlock<B> {
    pub fn new(
        embedding_dim: usize,
        num_heads: usize,
        mlp_dim: usize,
        skip_first_layer_pe: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            self_attn: Attention::new(embedding_dim, num_heads, 1, device),
            norm1: LayerNormConfig::new(embedding_dim).init(device),
            cross_attn_token_to_image: Attention::new(embedding_dim, num_heads, 2, device),
            norm2: LayerNormConfig::new(embedding_dim).init(device),
            mlp: MlpBlock::new(embedding_dim, mlp_dim, false, device),
            norm3: LayerNormConfig::new(embedding_dim).init(device),
            cross_attn_image_to_token: Attention::new(embedding_dim, num_heads, 2, device),
            norm4: LayerNormConfig::new(embedding_dim).init(device),
            skip_first_layer_pe,
        }
    }

    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        query_pe: Tensor<B, 3>,
        key_pe: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let queries = if self.skip_first_layer_pe {
            self.self_attn
                .forward(queries.clone(), queries.clone(), queries)
        } else {
            let q = queries.clone() + query_pe.clone();
            queries.clone() + self.self_attn.forward(q.clone(), q, queries)
        };
        let queries = self.norm1.forward(queries);

        let q = queries.clone() + query_pe.clone();
        let k = keys.clone() + key_pe.clone();
        let queries = queries + self.cross_attn_token_to_image.forward(q, k, keys.clone());
        let queries = self.norm2.forward(queries);

        let queries = queries.clone() + self.mlp.forward(queries);
        let queries = self.norm3.forward(queries);

        let q = queries.clone() + query_pe;
        let k = keys.clone() + key_pe;
        let keys = keys + self.cross_attn_image_to_token.forward(k, q, queries.clone());
        let keys = self.norm4.forward(keys);

        (queries, keys)
    }
}

/// Stack of two-way blocks with a final token-to-image attention.
#[derive(Module, Debug)]
pub struct TwoWayTransformer<B: Backend> {
    layers: Vec<TwoWayAttentionBlock<B>>,
    final_attn_token_to_image: Attention<B>,
    norm_final_attn: LayerNorm<B>,
}

impl<B: Backend> TwoWayTransformer<B> {
    pub fn new(
        depth: usize,
        embedding_dim: usize,
        num_heads: usize,
        mlp_dim: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..depth)
            .map(|index| {
                TwoWayAttentionBlock::new(embedding_dim, num_heads, mlp_dim, index == 0, device)
            })
            .collect();

        Self {
            layers,
            final_attn_token_to_image: Attention::new(embedding_dim, num_heads, 2, device),
            norm_final_attn: LayerNormConfig::new(embedding_dim).init(device),
        }
    }

    /// Returns the refined (tokens, image embedding) pair.
    pub fn forward(
        &self,
        image_embedding: Tensor<B, 4>,
        image_pe: Tensor<B, 4>,
        point_embedding: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, channels, height, width] = image_embedding.dims();

        let image_embedding = image_embedding
            .reshape([batch, channels, height * width])
            .swap_dims(1, 2);
        let image_pe = image_pe
            .reshape([batch, channels, height * width])
            .swap_dims(1, 2);

        let mut queries = point_embedding.clone();
        let mut keys = image_embedding;
        for layer in &self.layers {
            (queries, keys) =
                layer.forward(queries, keys, point_embedding.clone(), image_pe.clone());
        }

        let q = queries.clone() + point_embedding;
        let k = keys.clone() + image_pe;
        let attn_out = self
            .final_attn_token_to_image
            .forward(q, k, keys.clone());
        let queries = self.norm_final_attn.forward(queries + attn_out);

        (queries, keys)
    }
}

/// Multi-layer perceptron with a configurable number of hidden layers.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
}

impl<B: Backend> Mlp<B> {
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        device: &B::Device,
    ) -> Self {
        let mut layers = Vec::with_capacity(num_layers);
        let mut in_dim = input_dim;
        for index in 0..num_layers {
            let out_dim = if index + 1 == num_layers {
                output_dim
            } else {
                hidden_dim
            };
            layers.push(LinearConfig::new(in_dim, out_dim).init(device));
            in_dim = out_dim;
        }

        Self { layers }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len().saturating_sub(1);
        let mut x = x;
        for (index, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if index != last {
                x = activation::relu(x);
            }
        }
        x
    }
}

/// Doubles the feature map resolution twice while narrowing channels.
#[derive(Module, Debug)]
pub struct OutputUpscaling<B: Backend> {
    conv1: ConvTranspose2d<B>,
    ln: LayerNorm2d<B>,
    conv2: ConvTranspose2d<B>,
}

impl<B: Backend> OutputUpscaling<B> {
    pub fn new(transformer_dim: usize, device: &B::Device) -> Self {
        Self {
            conv1: ConvTranspose2dConfig::new([transformer_dim, transformer_dim / 4], [2, 2])
                .with_stride([2, 2])
                .init(device),
            ln: LayerNorm2d::new(transformer_dim / 4, device),
            conv2: ConvTranspose2dConfig::new([transformer_dim / 4, transformer_dim / 8], [2, 2])
                .with_stride([2, 2])
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = activation::gelu(self.ln.forward(self.conv1.forward(x)));
        activation::gelu(self.conv2.forward(x))
    }
}

/// Predicts masks and their quality scores from image and prompt
/// embeddings.
#[derive(Module, Debug)]
pub struct MaskDecoder<B: Backend> {
    transformer: TwoWayTransformer<B>,
    iou_token: Embedding<B>,
    mask_tokens: Embedding<B>,
    output_upscaling: OutputUpscaling<B>,
    output_hypernetworks_mlps: Vec<Mlp<B>>,
    iou_prediction_head: Mlp<B>,
    num_mask_tokens: usize,
}

impl<B: Backend> MaskDecoder<B> {
    pub fn new(
        transformer_dim: usize,
        num_heads: usize,
        mlp_dim: usize,
        num_multimask_outputs: usize,
        device: &B::Device,
    ) -> Self {
        let num_mask_tokens = num_multimask_outputs + 1;

        let output_hypernetworks_mlps = (0..num_mask_tokens)
            .map(|_| Mlp::new(transformer_dim, transformer_dim, transformer_dim / 8, 3, device))
            .collect();

        Self {
            transformer: TwoWayTransformer::new(2, transformer_dim, num_heads, mlp_dim, device),
            iou_token: EmbeddingConfig::new(1, transformer_dim).init(device),
            mask_tokens: EmbeddingConfig::new(num_mask_tokens, transformer_dim).init(device),
            output_upscaling: OutputUpscaling::new(transformer_dim, device),
            output_hypernetworks_mlps,
            iou_prediction_head: Mlp::new(transformer_dim, transformer_dim, num_mask_tokens, 3, device),
            num_mask_tokens,
        }
    }

    /// Predicts low-resolution mask logits and quality scores.
    ///
    /// With `multimask_output` the three multi-mask channels are
    /// returned, otherwise only the single-mask channel.
    pub fn forward(
        &self,
        image_embeddings: Tensor<B, 4>,
        image_pe: Tensor<B, 4>,
        sparse_prompts: Tensor<B, 3>,
        dense_prompts: Tensor<B, 4>,
        multimask_output: bool,
    ) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let (masks, iou_pred) = self.predict_masks(image_embeddings, image_pe, sparse_prompts, dense_prompts);

        let [batch, _, _, _] = masks.dims();
        if multimask_output {
            (
                masks.slice([0..batch, 1..self.num_mask_tokens]),
                iou_pred.slice([0..batch, 1..self.num_mask_tokens]),
            )
        } else {
            (masks.slice([0..batch, 0..1]), iou_pred.slice([0..batch, 0..1]))
        }
    }

    fn predict_masks(
        &self,
        image_embeddings: Tensor<B, 4>,
        image_pe: Tensor<B, 4>,
        sparse_prompts: Tensor<B, 3>,
        dense_prompts: Tensor<B, 4>,
    ) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let [batch, _, dim] = sparse_prompts.dims();

        let output_tokens = Tensor::cat(
            vec![self.iou_token.weight.val(), self.mask_tokens.weight.val()],
            0,
        )
        .unsqueeze::<3>()
        .repeat_dim(0, batch);
        let tokens = Tensor::cat(vec![output_tokens, sparse_prompts], 1);

        // A single image embedding serves every prompt in the batch.
        let src = if image_embeddings.dims()[0] == batch {
            image_embeddings
        } else {
            image_embeddings.repeat_dim(0, batch)
        };
        let src = src + dense_prompts;
        let pos_src = if image_pe.dims()[0] == batch {
            image_pe
        } else {
            image_pe.repeat_dim(0, batch)
        };

        let [_, channels, height, width] = src.dims();
        let (hs, src) = self.transformer.forward(src, pos_src, tokens);

        let iou_token_out = hs.clone().slice([0..batch, 0..1]).reshape([batch, dim]);
        let mask_tokens_out = hs.slice([0..batch, 1..1 + self.num_mask_tokens]);

        let src = src
            .swap_dims(1, 2)
            .reshape([batch, channels, height, width]);
        let upscaled = self.output_upscaling.forward(src);
        let [_, up_channels, up_height, up_width] = upscaled.dims();

        let hyper_in = Tensor::stack::<3>(
            (0..self.num_mask_tokens)
                .map(|index| {
                    let token = mask_tokens_out
                        .clone()
                        .slice([0..batch, index..index + 1])
                        .reshape([batch, dim]);
                    self.output_hypernetworks_mlps[index].forward(token)
                })
                .collect(),
            1,
        );

        let masks = hyper_in
            .matmul(upscaled.reshape([batch, up_channels, up_height * up_width]))
            .reshape([batch, self.num_mask_tokens, up_height, up_width]);
        let iou_pred = self.iou_prediction_head.forward(iou_token_out);

        (masks, iou_pred)
    }
}
