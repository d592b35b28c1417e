//! Model-level adapter controller
//!
//! [`PeftModel`] owns the host model after injection and keeps every
//! wrapper in agreement about which adapters exist, which are active and
//! whether adapters are bypassed.

mod adalora;
mod combine;
mod control;
mod inject;


pub use combine::CombinationType;
pub use control::DisabledAdapters;

use super::config::AdapterConfig;
use super::layer::TunerLayer;
use super::rank_allocator::RankAllocator;
use super::shadow::ShadowLayer;
use crate::autograd::{Context, Tensor};
use crate::error::{PeftError, Result};
use crate::nn::{Layer, Sequential, ShapedTensor};
use std::collections::BTreeMap;

/// Host model with injected adapters
pub struct PeftModel {
    model: Sequential,
    configs: BTreeMap<String, AdapterConfig>,
    active: Vec<String>,
    disabled: bool,
    ctx: Context,
    allocators: BTreeMap<String, RankAllocator>,
    rank_masks: BTreeMap<String, BTreeMap<String, Vec<bool>>>,
}

impl PeftModel {
    /// Freeze `model`, inject `config` as `adapter_name` and activate it
    pub fn new(model: Sequential, config: AdapterConfig, adapter_name: &str) -> Result<Self> {
        Self::with_context(model, config, adapter_name, Context::new())
    }

    /// Like [`PeftModel::new`] with an explicit context (seeded RNG, mode)
    pub fn with_context(
        mut model: Sequential,
        config: AdapterConfig,
        adapter_name: &str,
        ctx: Context,
    ) -> Result<Self> {
        for (_, param) in model.parameters_mut() {
            param.set_requires_grad(false);
        }
        let mut peft = Self {
            model,
            configs: BTreeMap::new(),
            active: vec![adapter_name.to_string()],
            disabled: false,
            ctx,
            allocators: BTreeMap::new(),
            rank_masks: BTreeMap::new(),
        };
        peft.inject_adapter(adapter_name, config)?;
        peft.refresh_layers();
        Ok(peft)
    }

    pub fn model(&self) -> &Sequential {
        &self.model
    }

    /// Direct access for checkpoint loading; wrappers must stay in place
    pub(crate) fn model_mut(&mut self) -> &mut Sequential {
        &mut self.model
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self, adapter_name: &str) -> Option<&AdapterConfig> {
        self.configs.get(adapter_name)
    }

    /// Every registered adapter name, sorted
    pub fn adapter_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn train(&mut self) {
        self.ctx.train();
    }

    pub fn eval(&mut self) {
        self.ctx.eval();
    }

    pub fn forward(&self, x: &ShapedTensor) -> ShapedTensor {
        self.model.forward(x, &self.ctx)
    }

    /// Wrapper or plain layer at a dotted path
    pub fn get(&self, path: &str) -> Option<&Layer> {
        self.model.get(path)
    }

    pub fn tuner(&self, path: &str) -> Option<&TunerLayer> {
        match self.model.get(path) {
            Some(Layer::Tuner(tuner)) => Some(tuner),
            _ => None,
        }
    }

    pub fn shadow(&self, path: &str) -> Option<&ShadowLayer> {
        match self.model.get(path) {
            Some(Layer::Shadow(shadow)) => Some(shadow),
            _ => None,
        }
    }

    /// Dotted names of every parameter, adapter and base alike
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.model.parameters()
    }

    /// Mutable parameters, for an optimizer
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.model.parameters_mut().into_iter().map(|(_, t)| t).collect()
    }

    pub fn trainable_parameter_count(&self) -> usize {
        self.model.parameters().iter().filter(|(_, t)| t.requires_grad()).map(|(_, t)| t.len()).sum()
    }

    pub fn parameter_count(&self) -> usize {
        self.model.parameters().iter().map(|(_, t)| t.len()).sum()
    }

    /// Log trainable vs total parameter counts
    pub fn print_trainable_parameters(&self) {
        let trainable = self.trainable_parameter_count();
        let total = self.parameter_count();
        let pct = if total == 0 { 0.0 } else { 100.0 * trainable as f64 / total as f64 };
        tracing::info!("trainable params: {trainable} || all params: {total} || trainable%: {pct:.4}");
    }

    /// Paths of every adapter wrapper, parents first
    pub fn tuner_paths(&self) -> Vec<String> {
        self.model
            .named_layers()
            .into_iter()
            .filter(|(_, layer)| matches!(layer, Layer::Tuner(_)))
            .map(|(path, _)| path)
            .collect()
    }

    fn tuner_mut(&mut self, path: &str) -> Option<&mut TunerLayer> {
        match self.model.get_mut(path) {
            Some(Layer::Tuner(tuner)) => Some(tuner),
            _ => None,
        }
    }

    /// Whether any wrapper holds `name` merged, including while disabled
    pub(crate) fn is_adapter_merged(&self, name: &str) -> bool {
        self.tuner_paths().iter().filter_map(|path| self.tuner(path)).any(|t| t.holds_merge(name))
    }

    fn require_adapter(&self, name: &str) -> Result<&AdapterConfig> {
        self.configs.get(name).ok_or_else(|| PeftError::UnknownAdapter(name.to_string()))
    }

    /// Push the model-wide active set and enable flag into every wrapper
    fn refresh_layers(&mut self) {
        let active = self.active.clone();
        let enabled = !self.disabled;
        self.model.visit_mut(|_, layer| match layer {
            Layer::Tuner(tuner) => {
                tuner.set_adapter(&active);
                tuner.enable_adapters(enabled);
            }
            Layer::Shadow(shadow) => {
                shadow.set_adapter(&active);
                shadow.enable_adapters(enabled);
            }
            _ => {}
        });
        self.apply_bias_policy();
    }
}
