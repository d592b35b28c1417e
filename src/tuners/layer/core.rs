//! Tunable layer wrapper
//!
//! Wraps one base layer and any number of named adapters. The wrapper
//! tracks which adapters are active and which are folded into the base
//! weights; a merged adapter never contributes a separate branch.

use super::TunableBase;
use crate::autograd::{add, mul, Context, Tensor};
use crate::error::{PeftError, Result};
use crate::nn::{Layer, ShapedTensor};
use crate::tuners::config::{AdapterConfig, PeftMethod};
use crate::tuners::method::AdapterWeights;
use rand::rngs::StdRng;
use std::collections::BTreeMap;

/// One adapter registered on a wrapper
#[derive(Clone, Debug)]
pub struct AdapterSlot {
    pub weights: AdapterWeights,
    pub dropout: f32,
    /// Never trainable, even while active
    pub inference_mode: bool,
}

/// Adapter-bearing wrapper around a base layer
#[derive(Clone, Debug)]
pub struct TunerLayer {
    base: TunableBase,
    adapters: BTreeMap<String, AdapterSlot>,
    active: Vec<String>,
    /// Merge order, unmerged in reverse
    merged: Vec<String>,
    disabled: bool,
    /// Adapters unmerged by disabling, re-merged on enable
    merged_before_disable: Vec<String>,
}

impl TunerLayer {
    /// Wrap `layer` with no adapters
    pub fn new(layer: Layer, path: &str, method: PeftMethod) -> Result<Self> {
        Ok(Self {
            base: TunableBase::from_layer(layer, path, method.name())?,
            adapters: BTreeMap::new(),
            active: Vec::new(),
            merged: Vec::new(),
            disabled: false,
            merged_before_disable: Vec::new(),
        })
    }

    /// Register adapter `name`, sized from the base layer and `config`
    ///
    /// The new adapter is frozen until it becomes active.
    pub fn update(&mut self, path: &str, name: &str, config: &AdapterConfig, rng: &mut StdRng) -> Result<()> {
        if self.adapters.contains_key(name) {
            return Err(PeftError::DuplicateAdapter(name.to_string()));
        }
        if let Some(existing) = self.adapters.values().next() {
            if existing.weights.method() != config.peft_type {
                return Err(PeftError::MethodMismatch {
                    expected: existing.weights.method().name().to_string(),
                    actual: config.peft_type.name().to_string(),
                });
            }
        }

        let mut weights = AdapterWeights::create(&self.base, path, config, rng)?;
        weights.set_requires_grad(false);
        self.adapters.insert(
            name.to_string(),
            AdapterSlot { weights, dropout: config.lora_dropout, inference_mode: config.inference_mode },
        );
        self.refresh_requires_grad();
        Ok(())
    }

    /// Register precomputed weights, e.g. a combination of other adapters
    pub fn insert_adapter(&mut self, name: &str, mut weights: AdapterWeights, dropout: f32) -> Result<()> {
        if self.adapters.contains_key(name) {
            return Err(PeftError::DuplicateAdapter(name.to_string()));
        }
        weights.set_requires_grad(false);
        self.adapters.insert(name.to_string(), AdapterSlot { weights, dropout, inference_mode: false });
        self.refresh_requires_grad();
        Ok(())
    }

    pub fn base(&self) -> &TunableBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut TunableBase {
        &mut self.base
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn adapter(&self, name: &str) -> Option<&AdapterSlot> {
        self.adapters.get(name)
    }

    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut AdapterSlot> {
        self.adapters.get_mut(name)
    }

    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    pub fn merged_adapters(&self) -> &[String] {
        &self.merged
    }

    /// Whether adapters are folded in, or will be folded back in on enable
    pub fn is_merged(&self) -> bool {
        !self.merged.is_empty() || !self.merged_before_disable.is_empty()
    }

    /// Whether `name` is merged, counting merges suspended by disabling
    pub fn holds_merge(&self, name: &str) -> bool {
        self.merged.iter().chain(&self.merged_before_disable).any(|n| n == name)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Replace the active set
    ///
    /// Names without an adapter on this layer are kept (they may target
    /// other layers) but contribute nothing here.
    pub fn set_adapter(&mut self, names: &[String]) {
        self.active = names.to_vec();
        self.refresh_requires_grad();
    }

    /// Active, registered, not merged, in active order
    fn live_adapters(&self) -> impl Iterator<Item = (&String, &AdapterSlot)> {
        self.active
            .iter()
            .filter(|name| !self.merged.contains(*name))
            .filter_map(|name| self.adapters.get(name).map(|slot| (name, slot)))
    }

    fn refresh_requires_grad(&mut self) {
        for (name, slot) in self.adapters.iter_mut() {
            let trainable = !self.disabled && !slot.inference_mode && self.active.contains(name);
            slot.weights.set_requires_grad(trainable);
        }
    }

    pub fn forward(&self, x: &ShapedTensor, ctx: &Context) -> ShapedTensor {
        if self.disabled {
            return self.base.forward(x);
        }

        let live: Vec<(&String, &AdapterSlot)> = self.live_adapters().collect();
        if live.is_empty() {
            return self.base.forward(x);
        }

        if let AdapterWeights::Ia3(_) = live[0].1.weights {
            return self.ia3_forward(x, &live);
        }

        let mut y = self.base.forward(x);
        for (_, slot) in live {
            let branch = match &slot.weights {
                AdapterWeights::Lora(w) => w.forward(&self.base, x, slot.dropout, ctx),
                AdapterWeights::AdaLora(w) => w.forward(&self.base, x, slot.dropout, ctx),
                AdapterWeights::Ia3(_) => continue,
            };
            y = y.map(|t| add(t, &branch.tensor));
        }
        y
    }

    /// Rescaling adapters compose multiplicatively
    fn ia3_forward(&self, x: &ShapedTensor, live: &[(&String, &AdapterSlot)]) -> ShapedTensor {
        let mut input_factor: Option<Tensor> = None;
        let mut output_factor: Option<Tensor> = None;
        for (_, slot) in live {
            if let AdapterWeights::Ia3(w) = &slot.weights {
                let target = if w.feedforward { &mut input_factor } else { &mut output_factor };
                *target = Some(match target.take() {
                    Some(acc) => mul(&acc, &w.factor()),
                    None => w.factor(),
                });
            }
        }

        let x = match &input_factor {
            Some(factor) => self.base.rescale_input(x, factor),
            None => x.clone(),
        };
        let y = self.base.forward(&x);
        match &output_factor {
            Some(factor) => self.base.rescale_output(&y, factor),
            None => y,
        }
    }

    /// Fold adapters into the base weights
    ///
    /// `None` merges every active adapter not yet merged. An explicitly
    /// named adapter that is already merged is an error, as is a default
    /// merge with nothing left to merge.
    pub fn merge(&mut self, names: Option<&[String]>) -> Result<()> {
        if self.disabled {
            return Err(PeftError::AdaptersDisabled);
        }
        let to_merge: Vec<String> = match names {
            Some(names) => {
                for (i, name) in names.iter().enumerate() {
                    if !self.adapters.contains_key(name) {
                        return Err(PeftError::UnknownAdapter(name.clone()));
                    }
                    if self.merged.contains(name) || names[..i].contains(name) {
                        return Err(PeftError::AlreadyMerged(name.clone()));
                    }
                }
                names.to_vec()
            }
            None => {
                let present: Vec<String> =
                    self.active.iter().filter(|n| self.adapters.contains_key(*n)).cloned().collect();
                let pending: Vec<String> =
                    present.iter().filter(|n| !self.merged.contains(*n)).cloned().collect();
                if pending.is_empty() {
                    if let Some(first) = present.first() {
                        return Err(PeftError::AlreadyMerged(first.clone()));
                    }
                }
                pending
            }
        };

        for name in to_merge {
            self.merge_one(&name);
        }
        Ok(())
    }

    fn merge_one(&mut self, name: &str) {
        if let Some(slot) = self.adapters.get(name) {
            slot.weights.merge_into(&mut self.base);
            self.merged.push(name.to_string());
        }
    }

    /// Subtract every merged adapter, last merged first
    ///
    /// While disabled the base is already clean; the pending re-merge is
    /// dropped instead.
    pub fn unmerge(&mut self) -> Result<()> {
        if !self.is_merged() {
            return Err(PeftError::NothingMerged);
        }
        self.merged_before_disable.clear();
        while let Some(name) = self.merged.pop() {
            if let Some(slot) = self.adapters.get(&name) {
                slot.weights.unmerge_from(&mut self.base);
            }
        }
        Ok(())
    }

    /// Bypass (or restore) every adapter on this layer
    ///
    /// Disabling unmerges merged adapters so the base output is exact;
    /// enabling merges them back in the same order.
    pub fn enable_adapters(&mut self, enabled: bool) {
        if enabled == !self.disabled {
            return;
        }
        if enabled {
            self.disabled = false;
            for name in std::mem::take(&mut self.merged_before_disable) {
                self.merge_one(&name);
            }
        } else {
            self.merged_before_disable = self.merged.clone();
            while let Some(name) = self.merged.pop() {
                if let Some(slot) = self.adapters.get(&name) {
                    slot.weights.unmerge_from(&mut self.base);
                }
            }
            self.disabled = true;
        }
        self.refresh_requires_grad();
    }

    /// Remove adapter `name`; a merged adapter must be unmerged first
    pub fn delete_adapter(&mut self, name: &str) -> Result<()> {
        if !self.adapters.contains_key(name) {
            return Err(PeftError::UnknownAdapter(name.to_string()));
        }
        if self.holds_merge(name) {
            return Err(PeftError::AdapterMerged(name.to_string()));
        }
        self.adapters.remove(name);
        self.active.retain(|n| n != name);
        Ok(())
    }

    /// Effective delta of an additive adapter, logical `[fan_out, fan_in]`
    pub fn delta_weight(&self, name: &str) -> Result<Vec<f32>> {
        match self.adapters.get(name).map(|slot| &slot.weights) {
            Some(AdapterWeights::Lora(w)) => Ok(w.delta_weight(&self.base)),
            Some(AdapterWeights::AdaLora(w)) => Ok(w.delta_weight(&self.base)),
            Some(AdapterWeights::Ia3(_)) => Err(PeftError::InvalidConfig(
                "IA3 adapters rescale weights and have no additive delta".into(),
            )),
            None => Err(PeftError::UnknownAdapter(name.to_string())),
        }
    }

    /// Prune an AdaLoRA adapter to the triplets marked in `keep`
    pub fn resize_adapter(&mut self, name: &str, keep: &[bool]) -> Result<()> {
        if self.merged.iter().any(|n| n == name) {
            return Err(PeftError::AdapterMerged(name.to_string()));
        }
        let slot = self.adapters.get_mut(name).ok_or_else(|| PeftError::UnknownAdapter(name.to_string()))?;
        match &mut slot.weights {
            AdapterWeights::AdaLora(w) => {
                if keep.len() != w.rank {
                    return Err(PeftError::RankMismatch(format!(
                        "mask of length {} for adapter '{name}' of rank {}",
                        keep.len(),
                        w.rank
                    )));
                }
                w.prune(keep, &self.base);
                Ok(())
            }
            other => Err(PeftError::MethodMismatch {
                expected: PeftMethod::AdaLora.name().to_string(),
                actual: other.method().name().to_string(),
            }),
        }
    }

    /// Base parameters (`weight`, `bias`) then `<tensor>.<adapter>`
    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = self.base.parameters();
        for (name, slot) in &self.adapters {
            for (tensor_name, tensor) in slot.weights.tensors() {
                params.push((format!("{tensor_name}.{name}"), tensor));
            }
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = self.base.parameters_mut();
        for (name, slot) in self.adapters.iter_mut() {
            for (tensor_name, tensor) in slot.weights.tensors_mut() {
                params.push((format!("{tensor_name}.{name}"), tensor));
            }
        }
        params
    }

    /// Restore the base layer, undoing any merge
    pub fn unload(mut self) -> Layer {
        if self.disabled {
            self.enable_adapters(true);
        }
        if self.is_merged() {
            let _ = self.unmerge();
        }
        self.base.into_layer()
    }

    /// Merge the active adapters and return the base layer
    pub fn merge_and_unload(mut self) -> Result<Layer> {
        if self.disabled {
            self.enable_adapters(true);
        }
        let pending = self.live_adapters().count();
        if pending > 0 {
            self.merge(None)?;
        }
        Ok(self.base.into_layer())
    }
}
