//! Combining trained LoRA adapters into a new adapter

use super::PeftModel;
use crate::error::{PeftError, Result};
use crate::tuners::config::{BiasMode, PeftMethod};
use crate::tuners::method::{AdapterWeights, LoraWeights};
use serde::{Deserialize, Serialize};

/// How [`PeftModel::add_weighted_adapter`] combines its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationType {
    /// Stack the factors along the rank dimension; exact for any ranks
    Cat,
    /// Weighted sum of same-rank factors
    Linear,
}

impl PeftModel {
    /// Create `adapter_name` from a weighted combination of LoRA adapters
    ///
    /// The new adapter has `scaling = 1`: each input's scale and weight is
    /// folded into its `A` factor. It is registered inactive.
    pub fn add_weighted_adapter(
        &mut self,
        adapters: &[&str],
        weights: &[f32],
        adapter_name: &str,
        combination: CombinationType,
    ) -> Result<()> {
        if adapters.is_empty() || adapters.len() != weights.len() {
            return Err(PeftError::InvalidConfig(format!(
                "{} adapters given with {} weights",
                adapters.len(),
                weights.len()
            )));
        }
        if self.configs.contains_key(adapter_name) {
            return Err(PeftError::DuplicateAdapter(adapter_name.to_string()));
        }
        let mut inputs = Vec::with_capacity(adapters.len());
        for name in adapters {
            let config = self.require_adapter(name)?;
            if config.peft_type != PeftMethod::Lora {
                return Err(PeftError::MethodMismatch {
                    expected: PeftMethod::Lora.name().to_string(),
                    actual: config.peft_type.name().to_string(),
                });
            }
            inputs.push(config);
        }
        if combination == CombinationType::Linear && inputs.iter().any(|c| c.r != inputs[0].r) {
            return Err(PeftError::RankMismatch(
                "linear combination requires all adapters to have the same rank".into(),
            ));
        }

        let mut config = inputs[0].clone();
        config.r = match combination {
            CombinationType::Cat => inputs.iter().map(|c| c.r).sum(),
            CombinationType::Linear => inputs[0].r,
        };
        config.lora_alpha = config.r as f32;
        config.target_modules =
            inputs[1..].iter().fold(inputs[0].target_modules.clone(), |acc, c| acc.union(&c.target_modules));
        config.modules_to_save.clear();
        config.rank_pattern.clear();
        config.alpha_pattern.clear();
        config.bias = BiasMode::None;
        config.inference_mode = false;

        let mut combined = Vec::new();
        for path in self.tuner_paths() {
            let Some(tuner) = self.tuner(&path) else { continue };
            let parts: Vec<(&LoraWeights, f32)> = adapters
                .iter()
                .zip(weights)
                .filter_map(|(name, weight)| match tuner.adapter(name).map(|slot| &slot.weights) {
                    Some(AdapterWeights::Lora(w)) => Some((w, *weight)),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                continue;
            }
            let (fan_out, fan_in) = (tuner.base().fan_out(), tuner.base().fan_in());
            let merged = match combination {
                CombinationType::Cat => concatenate(&parts, fan_out, fan_in),
                CombinationType::Linear => weighted_sum(&parts, &path)?,
            };
            if merged.rank != config.r {
                config.rank_pattern.insert(path.clone(), merged.rank);
                config.alpha_pattern.insert(path.clone(), merged.rank as f32);
            }
            combined.push((path, merged));
        }

        for (path, merged) in combined {
            if let Some(tuner) = self.tuner_mut(&path) {
                tuner.insert_adapter(adapter_name, AdapterWeights::Lora(merged), config.lora_dropout)?;
            }
        }
        tracing::info!("Combined {adapters:?} into '{adapter_name}' ({combination:?}, r={})", config.r);
        self.configs.insert(adapter_name.to_string(), config);
        self.refresh_layers();
        Ok(())
    }
}

/// `A = [w_i·s_i·A_i]` stacked by rows, `B = [B_i]` stacked by columns
fn concatenate(parts: &[(&LoraWeights, f32)], fan_out: usize, fan_in: usize) -> LoraWeights {
    let rank: usize = parts.iter().map(|(w, _)| w.rank).sum();
    let mut lora_a = Vec::with_capacity(rank * fan_in);
    for (w, weight) in parts {
        let factor = weight * w.scaling();
        lora_a.extend(w.lora_a.data().iter().map(|v| v * factor));
    }
    let mut lora_b = Vec::with_capacity(fan_out * rank);
    for o in 0..fan_out {
        for (w, _) in parts {
            lora_b.extend_from_slice(&w.lora_b.as_slice()[o * w.rank..(o + 1) * w.rank]);
        }
    }
    LoraWeights::from_factors(lora_a, lora_b, rank, rank as f32)
}

/// `A = Σ sign(w_i)·√|w_i|·s_i·A_i`, `B = Σ √|w_i|·B_i`
fn weighted_sum(parts: &[(&LoraWeights, f32)], path: &str) -> Result<LoraWeights> {
    let rank = parts[0].0.rank;
    if parts.iter().any(|(w, _)| w.rank != rank) {
        return Err(PeftError::RankMismatch(format!(
            "adapters on '{path}' have ranks {:?}",
            parts.iter().map(|(w, _)| w.rank).collect::<Vec<_>>()
        )));
    }
    let mut lora_a = vec![0.0; parts[0].0.lora_a.len()];
    let mut lora_b = vec![0.0; parts[0].0.lora_b.len()];
    for (w, weight) in parts {
        let root = weight.abs().sqrt();
        let a_factor = weight.signum() * root * w.scaling();
        for (acc, v) in lora_a.iter_mut().zip(w.lora_a.data().iter()) {
            *acc += a_factor * v;
        }
        for (acc, v) in lora_b.iter_mut().zip(w.lora_b.data().iter()) {
            *acc += root * v;
        }
    }
    Ok(LoraWeights::from_factors(lora_a, lora_b, rank, rank as f32))
}
