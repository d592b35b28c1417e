//! AdaLoRA: low-rank adapters in SVD form with an adjustable rank
//!
//! ΔW = alpha / ranknum · B·diag(E)·A, where `E` holds the singular values
//! the rank allocator masks or prunes. `ranknum` is fixed at the initial
//! rank, so pruning zeroed triplets leaves the output unchanged.

use crate::autograd::{add, gather, matmul, mul, sqrt, sum, transpose_tensor, Context, Tensor};
use crate::nn::{init, ShapedTensor};
use crate::tuners::layer::TunableBase;
use rand::rngs::StdRng;

const RANKNUM_EPS: f32 = 1e-5;

#[derive(Clone, Debug)]
pub struct AdaLoraWeights {
    /// Right singular vectors `[r, fan_in]`
    pub lora_a: Tensor,
    /// Singular values `[r]`
    pub lora_e: Tensor,
    /// Left singular vectors `[fan_out, r]`
    pub lora_b: Tensor,
    pub rank: usize,
    pub ranknum: f32,
    pub alpha: f32,
}

impl AdaLoraWeights {
    /// `E` starts at zero (no-op adapter) unless `init_weights` is off
    pub fn new(base: &TunableBase, rank: usize, alpha: f32, init_weights: bool, rng: &mut StdRng) -> Self {
        let (fan_out, fan_in) = (base.fan_out(), base.fan_in());
        let lora_e = if init_weights { vec![0.0; rank] } else { init::normal(rng, rank, 1.0) };
        Self {
            lora_a: Tensor::from_vec(init::normal(rng, rank * fan_in, 0.02), true),
            lora_e: Tensor::from_vec(lora_e, true),
            lora_b: Tensor::from_vec(init::normal(rng, fan_out * rank, 0.02), true),
            rank,
            ranknum: rank as f32,
            alpha,
        }
    }

    pub fn scaling(&self) -> f32 {
        self.alpha / (self.ranknum + RANKNUM_EPS)
    }

    /// Alpha giving the current scaling once `ranknum` is reset to `rank`
    pub fn equivalent_alpha(&self) -> f32 {
        self.scaling() * (self.rank as f32 + RANKNUM_EPS)
    }

    /// `A ⊙ E` with `E` broadcast along each row of `A`
    fn scaled_a(&self, fan_in: usize) -> Tensor {
        let indices: Vec<Option<usize>> = (0..self.rank * fan_in).map(|i| Some(i / fan_in)).collect();
        mul(&self.lora_a, &gather(&self.lora_e, &indices))
    }

    pub fn delta_weight(&self, base: &TunableBase) -> Vec<f32> {
        let (fan_out, fan_in) = (base.fan_out(), base.fan_in());
        let a_e = self.scaled_a(fan_in);
        let delta = matmul(&self.lora_b.detach(), &a_e.detach(), fan_out, self.rank, fan_in);
        let scaling = self.scaling();
        delta.data().iter().map(|d| d * scaling).collect()
    }

    pub fn forward(&self, base: &TunableBase, x: &ShapedTensor, dropout: f32, ctx: &Context) -> ShapedTensor {
        let a_e = self.scaled_a(base.fan_in());
        base.low_rank_branch(x, &a_e, &self.lora_b, self.rank, self.scaling(), dropout, ctx)
    }

    /// Keep only the triplets where `keep[i]` is set; `ranknum` is unchanged
    pub fn prune(&mut self, keep: &[bool], base: &TunableBase) {
        debug_assert_eq!(keep.len(), self.rank, "rank mask length mismatch");
        let (fan_out, fan_in) = (base.fan_out(), base.fan_in());
        let kept: Vec<usize> = (0..self.rank).filter(|i| keep[*i]).collect();
        let new_rank = kept.len();

        let a = self.lora_a.as_slice();
        let e = self.lora_e.as_slice();
        let b = self.lora_b.as_slice();
        let mut lora_a = Vec::with_capacity(new_rank * fan_in);
        let mut lora_b = Vec::with_capacity(fan_out * new_rank);
        for k in &kept {
            lora_a.extend_from_slice(&a[k * fan_in..(k + 1) * fan_in]);
        }
        for o in 0..fan_out {
            for k in &kept {
                lora_b.push(b[o * self.rank + k]);
            }
        }
        let lora_e: Vec<f32> = kept.iter().map(|k| e[*k]).collect();

        let requires_grad = self.lora_a.requires_grad();
        self.lora_a = Tensor::from_vec(lora_a, requires_grad);
        self.lora_e = Tensor::from_vec(lora_e, requires_grad);
        self.lora_b = Tensor::from_vec(lora_b, requires_grad);
        self.rank = new_rank;
    }

    /// Zero the singular values where `keep[i]` is unset
    pub fn mask(&mut self, keep: &[bool]) {
        for (value, keep) in self.lora_e.as_slice_mut().iter_mut().zip(keep) {
            if !keep {
                *value = 0.0;
            }
        }
    }

    /// ‖A·Aᵀ − I‖_F + ‖Bᵀ·B − I‖_F
    pub fn orth_penalty(&self, base: &TunableBase) -> Tensor {
        let (fan_out, fan_in) = (base.fan_out(), base.fan_in());
        let r = self.rank;
        let a_t = transpose_tensor(&self.lora_a, r, fan_in);
        let a_cov = matmul(&self.lora_a, &a_t, r, fan_in, r);
        let b_t = transpose_tensor(&self.lora_b, fan_out, r);
        let b_cov = matmul(&b_t, &self.lora_b, r, fan_out, r);
        add(&frobenius_from_identity(&a_cov, r), &frobenius_from_identity(&b_cov, r))
    }

    pub fn shapes(&self, base: &TunableBase) -> [Vec<usize>; 3] {
        [vec![self.rank, base.fan_in()], vec![self.rank], vec![base.fan_out(), self.rank]]
    }
}

fn frobenius_from_identity(cov: &Tensor, r: usize) -> Tensor {
    let neg_eye: Vec<f32> = (0..r * r).map(|i| if i % (r + 1) == 0 { -1.0 } else { 0.0 }).collect();
    let diff = add(cov, &Tensor::constant(neg_eye));
    sqrt(&sum(&mul(&diff, &diff)))
}
