//! AdaLoRA training hooks: orthogonality regularizer, rank allocation, pruning

use super::PeftModel;
use crate::autograd::{add, scale, Tensor};
use crate::error::{PeftError, Result};
use crate::nn::{Layer, Sequential};
use crate::tuners::config::PeftMethod;
use crate::tuners::method::{AdaLoraWeights, AdapterWeights};
use std::collections::BTreeMap;

fn adalora_weights<'a>(model: &'a Sequential, path: &str, name: &str) -> Option<&'a AdaLoraWeights> {
    match model.get(path) {
        Some(Layer::Tuner(tuner)) => match tuner.adapter(name).map(|slot| &slot.weights) {
            Some(AdapterWeights::AdaLora(w)) => Some(w),
            _ => None,
        },
        _ => None,
    }
}

fn adalora_weights_mut<'a>(model: &'a mut Sequential, path: &str, name: &str) -> Option<&'a mut AdaLoraWeights> {
    match model.get_mut(path) {
        Some(Layer::Tuner(tuner)) => match tuner.adapter_mut(name).map(|slot| &mut slot.weights) {
            Some(AdapterWeights::AdaLora(w)) => Some(w),
            _ => None,
        },
        _ => None,
    }
}

impl PeftModel {
    /// The AdaLoRA adapter that is not in inference mode
    pub fn trainable_adalora(&self) -> Result<String> {
        self.configs
            .iter()
            .find(|(_, c)| c.peft_type == PeftMethod::AdaLora && !c.inference_mode)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| PeftError::InvalidConfig("model has no trainable AdaLoRA adapter".into()))
    }

    fn adalora_paths(&self, name: &str) -> Vec<String> {
        self.tuner_paths().into_iter().filter(|path| adalora_weights(&self.model, path, name).is_some()).collect()
    }

    /// `orth_reg_weight` × mean of ‖AAᵀ − I‖_F and ‖BᵀB − I‖_F over all factors
    ///
    /// Add this to the task loss before calling backward.
    pub fn orth_regularization(&self) -> Result<Tensor> {
        let name = self.trainable_adalora()?;
        let weight = self.configs[&name].schedule.as_ref().map_or(0.0, |s| s.orth_reg_weight);

        let mut total: Option<Tensor> = None;
        let mut factors = 0usize;
        for path in self.adalora_paths(&name) {
            let (Some(tuner), Some(w)) = (self.tuner(&path), adalora_weights(&self.model, &path, &name)) else {
                continue;
            };
            let penalty = w.orth_penalty(tuner.base());
            total = Some(match total {
                Some(acc) => add(&acc, &penalty),
                None => penalty,
            });
            factors += 2;
        }
        Ok(match total {
            Some(total) => scale(&total, weight / factors as f32),
            None => Tensor::zeros(1, false),
        })
    }

    /// Advance the rank budget after the optimizer step at `global_step`
    ///
    /// Before `total_step - tfinal` the importance statistics are updated and
    /// triplets are masked every `delta_t` steps. At that step the final
    /// masks are fixed; afterwards they are re-applied every call.
    pub fn update_and_allocate(&mut self, global_step: usize) -> Result<()> {
        let name = self.trainable_adalora()?;
        if self.is_adapter_merged(&name) {
            return Err(PeftError::AdapterMerged(name));
        }
        let paths = self.adalora_paths(&name);
        let allocator = self
            .allocators
            .get_mut(&name)
            .ok_or_else(|| PeftError::InvalidConfig(format!("adapter '{name}' has no rank allocator")))?;
        let final_step = allocator.final_step()?;

        let masks = if global_step > final_step {
            match self.rank_masks.get(&name) {
                Some(masks) => masks.clone(),
                None => return Ok(()),
            }
        } else {
            if global_step < final_step {
                for path in &paths {
                    if let Some(w) = adalora_weights(&self.model, path, &name) {
                        allocator.update_ipt(path, w);
                    }
                }
            }
            let (budget, mask_due) = allocator.budget_schedule(global_step)?;
            let force = global_step == final_step;
            if !mask_due && !force {
                return Ok(());
            }
            let scores: BTreeMap<String, Vec<f32>> = paths
                .iter()
                .filter_map(|path| {
                    adalora_weights(&self.model, path, &name).map(|w| (path.clone(), allocator.triplet_scores(path, w.rank)))
                })
                .collect();
            let masks = allocator.allocate(&scores, budget);
            if force {
                allocator.reset_ipt();
                let kept: usize = masks.values().flatten().filter(|k| **k).count();
                tracing::info!("Final rank budget for '{name}': {kept} of {} triplets", allocator.init_budget());
            } else {
                tracing::debug!("Step {global_step}: rank budget {budget}");
            }
            masks
        };

        for (path, keep) in &masks {
            if let Some(w) = adalora_weights_mut(&mut self.model, path, &name) {
                w.mask(keep);
            }
        }
        self.rank_masks.insert(name, masks);
        Ok(())
    }

    /// Most recent keep masks of an AdaLoRA adapter, by layer path
    pub fn rank_masks(&self, adapter_name: &str) -> Option<&BTreeMap<String, Vec<bool>>> {
        self.rank_masks.get(adapter_name)
    }

    /// Physically remove masked triplets and record the new ranks
    ///
    /// The config's `rank_pattern` and `alpha_pattern` are updated so that a
    /// re-injected adapter has the pruned shapes and the same scaling. Ends
    /// rank allocation for the adapter.
    pub fn resize_by_rank_pattern(&mut self, adapter_name: &str) -> Result<()> {
        let config = self.require_adapter(adapter_name)?;
        if config.peft_type != PeftMethod::AdaLora {
            return Err(PeftError::MethodMismatch {
                expected: PeftMethod::AdaLora.name().to_string(),
                actual: config.peft_type.name().to_string(),
            });
        }
        let masks = self.rank_masks.get(adapter_name).cloned().ok_or_else(|| {
            PeftError::InvalidConfig(format!("no rank pattern has been allocated for '{adapter_name}'"))
        })?;
        if self.is_adapter_merged(adapter_name) {
            return Err(PeftError::AdapterMerged(adapter_name.to_string()));
        }

        let mut resized = Vec::with_capacity(masks.len());
        for (path, keep) in &masks {
            let Some(tuner) = self.tuner_mut(path) else { continue };
            tuner.resize_adapter(adapter_name, keep)?;
            if let Some(AdapterWeights::AdaLora(w)) = tuner.adapter(adapter_name).map(|slot| &slot.weights) {
                resized.push((path.clone(), w.rank, w.equivalent_alpha()));
            }
        }

        if let Some(config) = self.configs.get_mut(adapter_name) {
            for (path, rank, alpha) in resized {
                tracing::debug!("Resized '{adapter_name}' on {path} to rank {rank}");
                config.rank_pattern.insert(path.clone(), rank);
                config.alpha_pattern.insert(path, alpha);
            }
        }
        self.allocators.remove(adapter_name);
        self.rank_masks.remove(adapter_name);
        Ok(())
    }
}
