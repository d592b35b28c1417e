//! Adapter method variants
//!
//! Every variant realizes the same wrapper contract (forward contribution,
//! merge, unmerge) with its own algebra.

mod adalora;
mod ia3;
mod lora;

pub use adalora::AdaLoraWeights;
pub use ia3::Ia3Weights;
pub use lora::LoraWeights;

use super::config::{AdapterConfig, PeftMethod};
use super::layer::TunableBase;
use crate::autograd::Tensor;
use crate::error::{PeftError, Result};
use rand::rngs::StdRng;

/// Whether `method` has an implementation for layers of `kind`
pub fn is_supported(method: PeftMethod, kind: &str) -> bool {
    match method {
        PeftMethod::Lora => matches!(kind, "Linear" | "Embedding" | "Conv1D" | "Conv2d"),
        PeftMethod::Ia3 => matches!(kind, "Linear" | "Conv1D" | "Conv2d"),
        PeftMethod::AdaLora => matches!(kind, "Linear" | "Conv1D"),
    }
}

/// Trainable tensors of one adapter on one layer
#[derive(Clone, Debug)]
pub enum AdapterWeights {
    Lora(LoraWeights),
    Ia3(Ia3Weights),
    AdaLora(AdaLoraWeights),
}

impl AdapterWeights {
    /// Create weights for the module at `path`, sized from `base`
    pub fn create(base: &TunableBase, path: &str, config: &AdapterConfig, rng: &mut StdRng) -> Result<Self> {
        let method = config.peft_type;
        if !is_supported(method, base.kind()) {
            return Err(PeftError::UnsupportedLayer {
                path: path.to_string(),
                kind: base.kind(),
                method: method.name(),
            });
        }

        let rank = config.rank_for(path);
        let alpha = config.alpha_for(path);
        Ok(match method {
            PeftMethod::Lora => {
                AdapterWeights::Lora(LoraWeights::new(base, rank, alpha, config.init_weights, rng))
            }
            PeftMethod::Ia3 => AdapterWeights::Ia3(Ia3Weights::new(
                base,
                config.is_feedforward(path)?,
                config.init_weights,
                rng,
            )),
            PeftMethod::AdaLora => {
                AdapterWeights::AdaLora(AdaLoraWeights::new(base, rank, alpha, config.init_weights, rng))
            }
        })
    }

    pub fn method(&self) -> PeftMethod {
        match self {
            AdapterWeights::Lora(_) => PeftMethod::Lora,
            AdapterWeights::Ia3(_) => PeftMethod::Ia3,
            AdapterWeights::AdaLora(_) => PeftMethod::AdaLora,
        }
    }

    /// Current rank (0 for rescaling adapters)
    pub fn rank(&self) -> usize {
        match self {
            AdapterWeights::Lora(w) => w.rank,
            AdapterWeights::Ia3(_) => 0,
            AdapterWeights::AdaLora(w) => w.rank,
        }
    }

    /// Named tensors, in a fixed order per method
    pub fn tensors(&self) -> Vec<(&'static str, &Tensor)> {
        match self {
            AdapterWeights::Lora(w) => vec![("lora_A", &w.lora_a), ("lora_B", &w.lora_b)],
            AdapterWeights::Ia3(w) => vec![("ia3_l", &w.ia3_l)],
            AdapterWeights::AdaLora(w) => {
                vec![("lora_A", &w.lora_a), ("lora_E", &w.lora_e), ("lora_B", &w.lora_b)]
            }
        }
    }

    pub fn tensors_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        match self {
            AdapterWeights::Lora(w) => vec![("lora_A", &mut w.lora_a), ("lora_B", &mut w.lora_b)],
            AdapterWeights::Ia3(w) => vec![("ia3_l", &mut w.ia3_l)],
            AdapterWeights::AdaLora(w) => vec![
                ("lora_A", &mut w.lora_a),
                ("lora_E", &mut w.lora_e),
                ("lora_B", &mut w.lora_b),
            ],
        }
    }

    /// Logical shapes matching [`Self::tensors`]
    pub fn shapes(&self, base: &TunableBase) -> Vec<Vec<usize>> {
        match self {
            AdapterWeights::Lora(w) => w.shapes(base).to_vec(),
            AdapterWeights::Ia3(w) => vec![w.shape()],
            AdapterWeights::AdaLora(w) => w.shapes(base).to_vec(),
        }
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        for (_, tensor) in self.tensors_mut() {
            tensor.set_requires_grad(requires_grad);
        }
    }

    /// Fold into the base weights
    pub fn merge_into(&self, base: &mut TunableBase) {
        match self {
            AdapterWeights::Lora(w) => {
                let delta = w.delta_weight(base);
                base.add_delta(&delta, 1.0);
            }
            AdapterWeights::Ia3(w) => w.merge_into(base),
            AdapterWeights::AdaLora(w) => {
                let delta = w.delta_weight(base);
                base.add_delta(&delta, 1.0);
            }
        }
    }

    /// Exact inverse of [`Self::merge_into`] for unchanged weights
    pub fn unmerge_from(&self, base: &mut TunableBase) {
        match self {
            AdapterWeights::Lora(w) => {
                let delta = w.delta_weight(base);
                base.add_delta(&delta, -1.0);
            }
            AdapterWeights::Ia3(w) => w.unmerge_from(base),
            AdapterWeights::AdaLora(w) => {
                let delta = w.delta_weight(base);
                base.add_delta(&delta, -1.0);
            }
        }
    }
}
