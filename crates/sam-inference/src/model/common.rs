//! Building blocks shared by the SAM submodules.

use burn::{
    module::{Module, Param},
    nn::{Linear, LinearConfig},
    tensor::{activation, backend::Backend, Tensor},
};

/// LayerNorm over the channel dimension of a [N, C, H, W] tensor.
#[derive(Module, Debug)]
pub struct LayerNorm2d<B: Backend> {
    weight: Param<Tensor<B, 1>>,
    bias: Param<Tensor<B, 1>>,
    eps: f64,
}

impl<B: Backend> LayerNorm2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            eps: 1e-6,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();

        let mean = x.clone().mean_dim(1);
        let centered = x - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(1);
        let normed = centered / var.add_scalar(self.eps).sqrt();

        normed * self.weight.val().reshape([1, channels, 1, 1])
            + self.bias.val().reshape([1, channels, 1, 1])
    }
}

/// Two-layer feed-forward block.
#[derive(Module, Debug)]
pub struct MlpBlock<B: Backend> {
    lin1: Linear<B>,
    lin2: Linear<B>,
    gelu: bool,
}

impl<B: Backend> MlpBlock<B> {
    pub fn new(embed_dim: usize, mlp_dim: usize, gelu: bool, device: &B::Device) -> Self {
        Self {
            lin1: LinearConfig::new(embed_dim, mlp_dim).init(device),
            lin2: LinearConfig::new(mlp_dim, embed_dim).init(device),
            gelu,
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let hidden = self.lin1.forward(x);
        let hidden = if self.gelu {
            activation::gelu(hidden)
        } else {
            activation::relu(hidden)
        };
        self.lin2.forward(hidden)
    }
}
