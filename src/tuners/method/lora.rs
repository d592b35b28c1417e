//! LoRA: low-rank additive adapters
//!
//! For a frozen weight W ∈ ℝ^(d_out × d_in), LoRA adds
//! ΔW = (alpha/r) · B·A with A ∈ ℝ^(r × d_in) and B ∈ ℝ^(d_out × r).
//!
//! Forward pass: y = W@x + (alpha/r) · B@(A@dropout(x))

use crate::autograd::{matmul_compute, Context, Tensor};
use crate::nn::{init, ShapedTensor};
use crate::tuners::layer::TunableBase;
use rand::rngs::StdRng;

/// Low-rank factors of one adapter on one layer
#[derive(Clone, Debug)]
pub struct LoraWeights {
    /// Down-projection `[r, fan_in]`
    pub lora_a: Tensor,
    /// Up-projection `[fan_out, r]`
    pub lora_b: Tensor,
    pub rank: usize,
    pub alpha: f32,
}

impl LoraWeights {
    /// Fresh factors for `base`
    ///
    /// With `init_weights`, one factor is zero so the adapter starts as a
    /// no-op: `B = 0` for dense and convolution layers, `A = 0` for
    /// embeddings. Otherwise both factors are random.
    pub fn new(base: &TunableBase, rank: usize, alpha: f32, init_weights: bool, rng: &mut StdRng) -> Self {
        let (fan_out, fan_in) = (base.fan_out(), base.fan_in());
        let is_embedding = matches!(base, TunableBase::Embedding(_));

        let lora_a = if init_weights && is_embedding {
            vec![0.0; rank * fan_in]
        } else {
            init::kaiming_uniform(rng, rank * fan_in, fan_in)
        };
        let lora_b = match (init_weights, is_embedding) {
            (true, false) => vec![0.0; fan_out * rank],
            (true, true) => init::normal(rng, fan_out * rank, 1.0),
            (false, _) => init::kaiming_uniform(rng, fan_out * rank, rank),
        };

        Self::from_factors(lora_a, lora_b, rank, alpha)
    }

    pub fn from_factors(lora_a: Vec<f32>, lora_b: Vec<f32>, rank: usize, alpha: f32) -> Self {
        Self {
            lora_a: Tensor::from_vec(lora_a, true),
            lora_b: Tensor::from_vec(lora_b, true),
            rank,
            alpha,
        }
    }

    /// Scaling factor `alpha / r`
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank.max(1) as f32
    }

    /// ΔW = scaling · B·A in logical `[fan_out, fan_in]` layout
    pub fn delta_weight(&self, base: &TunableBase) -> Vec<f32> {
        let (fan_out, fan_in) = (base.fan_out(), base.fan_in());
        let mut delta = matmul_compute(self.lora_b.as_slice(), self.lora_a.as_slice(), fan_out, self.rank, fan_in);
        let scaling = self.scaling();
        delta.iter_mut().for_each(|d| *d *= scaling);
        delta
    }

    pub fn forward(&self, base: &TunableBase, x: &ShapedTensor, dropout: f32, ctx: &Context) -> ShapedTensor {
        base.low_rank_branch(x, &self.lora_a, &self.lora_b, self.rank, self.scaling(), dropout, ctx)
    }

    pub fn shapes(&self, base: &TunableBase) -> [Vec<usize>; 2] {
        [vec![self.rank, base.fan_in()], vec![base.fan_out(), self.rank]]
    }
}
