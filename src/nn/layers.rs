//! Base layers of the host model
//!
//! Weights are flat tensors in row-major order; each layer records the
//! logical shape needed to interpret them.

use super::functional::{channel_broadcast, Conv2dGeometry};
use super::init::kaiming_uniform;
use super::ShapedTensor;
use crate::autograd::{add, broadcast_rows, gather, matmul, transpose_tensor, Tensor};
use rand::Rng;

/// Dense layer: `y = x @ W^T + b` with `W` stored `[out_features, in_features]`
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new<R: Rng>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let weight = kaiming_uniform(rng, out_features * in_features, in_features);
        let bias = bias.then(|| Tensor::from_vec(kaiming_uniform(rng, out_features, in_features), true));
        Self { weight: Tensor::from_vec(weight, true), bias, in_features, out_features }
    }

    /// Build from explicit weights (`weight` is `[out_features, in_features]`)
    pub fn from_weights(
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
        in_features: usize,
        out_features: usize,
    ) -> Self {
        assert_eq!(weight.len(), in_features * out_features, "Linear weight size mismatch");
        Self {
            weight: Tensor::from_vec(weight, true),
            bias: bias.map(|b| Tensor::from_vec(b, true)),
            in_features,
            out_features,
        }
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.out_features, self.in_features]
    }

    pub fn forward(&self, x: &ShapedTensor) -> ShapedTensor {
        let rows = x.rows(self.in_features);
        let w_t = transpose_tensor(&self.weight, self.out_features, self.in_features);
        let mut y = matmul(&x.tensor, &w_t, rows, self.in_features, self.out_features);
        if let Some(bias) = &self.bias {
            y = add(&y, &broadcast_rows(bias, rows));
        }
        x.with_last_dim(y, self.out_features)
    }
}

/// Lookup table `[num_embeddings, embedding_dim]`; inputs hold indices as floats
#[derive(Clone, Debug)]
pub struct Embedding {
    pub weight: Tensor,
    pub num_embeddings: usize,
    pub embedding_dim: usize,
}

impl Embedding {
    pub fn new<R: Rng>(num_embeddings: usize, embedding_dim: usize, rng: &mut R) -> Self {
        let weight = super::init::normal(rng, num_embeddings * embedding_dim, 1.0);
        Self { weight: Tensor::from_vec(weight, true), num_embeddings, embedding_dim }
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.num_embeddings, self.embedding_dim]
    }

    /// Token ids carried by an index tensor
    pub fn token_ids(&self, x: &ShapedTensor) -> Vec<usize> {
        x.tensor
            .data()
            .iter()
            .map(|v| {
                let id = v.round() as usize;
                assert!(id < self.num_embeddings, "embedding index {id} out of range");
                id
            })
            .collect()
    }

    /// Rows of a `[num_embeddings, width]` table for each token id
    pub fn lookup(table: &Tensor, ids: &[usize], width: usize) -> Tensor {
        let indices: Vec<Option<usize>> =
            ids.iter().flat_map(|id| (0..width).map(move |j| Some(id * width + j))).collect();
        gather(table, &indices)
    }

    pub fn forward(&self, x: &ShapedTensor) -> ShapedTensor {
        let ids = self.token_ids(x);
        let y = Self::lookup(&self.weight, &ids, self.embedding_dim);
        let mut shape = x.shape.clone();
        shape.push(self.embedding_dim);
        ShapedTensor::new(y, shape)
    }
}

/// Transposed-linear 1D convolution: `y = x @ W + b` with `W` stored `[nx, nf]`
#[derive(Clone, Debug)]
pub struct Conv1D {
    pub weight: Tensor,
    pub bias: Tensor,
    /// Input features
    pub nx: usize,
    /// Output features
    pub nf: usize,
}

impl Conv1D {
    pub fn new<R: Rng>(nf: usize, nx: usize, rng: &mut R) -> Self {
        let weight = super::init::normal(rng, nx * nf, 0.02);
        Self { weight: Tensor::from_vec(weight, true), bias: Tensor::zeros(nf, true), nx, nf }
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.nx, self.nf]
    }

    pub fn forward(&self, x: &ShapedTensor) -> ShapedTensor {
        let rows = x.rows(self.nx);
        let y = matmul(&x.tensor, &self.weight, rows, self.nx, self.nf);
        let y = add(&y, &broadcast_rows(&self.bias, rows));
        x.with_last_dim(y, self.nf)
    }
}

/// 2D convolution over NCHW input with weight `[out, in, kh, kw]`
#[derive(Clone, Debug)]
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub geometry: Conv2dGeometry,
}

impl Conv2d {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Self {
        let geometry = Conv2dGeometry {
            in_channels,
            out_channels,
            kernel: (kernel_size, kernel_size),
            stride: 1,
            padding: 0,
        };
        let fan_in = geometry.patch_len();
        let weight = kaiming_uniform(rng, out_channels * fan_in, fan_in);
        let bias = Tensor::from_vec(kaiming_uniform(rng, out_channels, fan_in), true);
        Self { weight: Tensor::from_vec(weight, true), bias: Some(bias), geometry }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.geometry.stride = stride.max(1);
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.geometry.padding = padding;
        self
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        let g = &self.geometry;
        vec![g.out_channels, g.in_channels, g.kernel.0, g.kernel.1]
    }

    pub fn forward(&self, x: &ShapedTensor) -> ShapedTensor {
        let g = &self.geometry;
        let patches = g.unfold(x);
        let w_t = transpose_tensor(&self.weight, g.out_channels, g.patch_len());
        let rows = matmul(&patches.columns, &w_t, patches.rows(), g.patch_len(), g.out_channels);
        let y = g.fold_rows(&rows, &patches, g.out_channels);
        match &self.bias {
            Some(bias) => y.map(|t| add(t, &gather(bias, &channel_broadcast(&y.shape)))),
            None => y,
        }
    }
}
