//! IA³: learned rescaling vectors
//!
//! Each adapter holds one vector `l`; the layer is rescaled by `(1 + l)`,
//! on the input channels for feedforward modules and on the output
//! channels otherwise. `l` starts at zero, so a fresh adapter is the
//! identity.
//!
//! Output rescaling multiplies the whole layer output, so the bias is
//! scaled too, and merging folds `l` into both weight and bias. Input
//! rescaling leaves the bias alone: only the weight's input columns
//! absorb `l` on merge.

use crate::autograd::{add, Tensor};
use crate::nn::init;
use crate::tuners::layer::TunableBase;
use rand::rngs::StdRng;

/// Guards the division that undoes a merged rescaling
const UNMERGE_EPS: f32 = 1e-8;

#[derive(Clone, Debug)]
pub struct Ia3Weights {
    pub ia3_l: Tensor,
    /// Rescale the input instead of the output
    pub feedforward: bool,
}

impl Ia3Weights {
    pub fn new(base: &TunableBase, feedforward: bool, init_weights: bool, rng: &mut StdRng) -> Self {
        let len = if feedforward { base.in_channels() } else { base.fan_out() };
        let values = if init_weights { vec![0.0; len] } else { init::uniform(rng, len, -0.5, 0.5) };
        Self { ia3_l: Tensor::from_vec(values, true), feedforward }
    }

    /// Differentiable `1 + l`
    pub fn factor(&self) -> Tensor {
        add(&self.ia3_l, &Tensor::ones(self.ia3_l.len(), false))
    }

    fn factor_values(&self) -> Vec<f32> {
        self.ia3_l.data().iter().map(|v| 1.0 + v).collect()
    }

    /// Fold the rescaling into the base weights
    pub fn merge_into(&self, base: &mut TunableBase) {
        let factors = self.factor_values();
        if self.feedforward {
            base.scale_input_channels(&factors);
        } else {
            base.scale_output_channels(&factors);
        }
    }

    /// Divide the rescaling back out
    pub fn unmerge_from(&self, base: &mut TunableBase) {
        let inverse: Vec<f32> = self.factor_values().iter().map(|f| 1.0 / (f + UNMERGE_EPS)).collect();
        if self.feedforward {
            base.scale_input_channels(&inverse);
        } else {
            base.scale_output_channels(&inverse);
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        vec![self.ia3_l.len()]
    }
}
