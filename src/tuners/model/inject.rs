//! Adapter injection: target matching and in-place layer replacement

use super::PeftModel;
use crate::error::{PeftError, Result};
use crate::nn::Layer;
use crate::tuners::config::{AdapterConfig, BiasMode, PeftMethod};
use crate::tuners::layer::TunerLayer;
use crate::tuners::method::is_supported;
use crate::tuners::rank_allocator::RankAllocator;
use crate::tuners::shadow::ShadowLayer;
use crate::tuners::targets::TargetMatcher;

/// What injection does to one matched path
enum Action {
    Wrap,
    Update,
    Shadow,
    AddCopy,
}

impl PeftModel {
    /// Register another adapter; it starts inactive and frozen
    pub fn add_adapter(&mut self, adapter_name: &str, config: AdapterConfig) -> Result<()> {
        self.inject_adapter(adapter_name, config)?;
        self.refresh_layers();
        Ok(())
    }

    /// Validate, plan, then mutate, so a rejected config leaves the model untouched
    pub(super) fn inject_adapter(&mut self, adapter_name: &str, config: AdapterConfig) -> Result<()> {
        config.validate()?;
        self.check_compatible(adapter_name, &config)?;

        let plan = self.plan_injection(&config)?;
        let targets = plan.iter().filter(|(_, action)| matches!(action, Action::Wrap | Action::Update)).count();
        if targets == 0 {
            return Err(PeftError::NoTargetMatched { patterns: config.target_modules.to_string() });
        }

        let mut rng = self.ctx.rng();
        for (path, action) in &plan {
            let Some(slot) = self.model.get_mut(path) else { continue };
            match action {
                Action::Wrap => {
                    let layer = std::mem::replace(slot, Layer::Identity);
                    let mut tuner = TunerLayer::new(layer, path, config.peft_type)?;
                    tuner.update(path, adapter_name, &config, &mut rng)?;
                    *slot = Layer::Tuner(Box::new(tuner));
                }
                Action::Update => {
                    if let Layer::Tuner(tuner) = slot {
                        tuner.update(path, adapter_name, &config, &mut rng)?;
                    }
                }
                Action::Shadow => {
                    let layer = std::mem::replace(slot, Layer::Identity);
                    let mut shadow = ShadowLayer::new(layer);
                    shadow.add_copy(adapter_name, config.inference_mode)?;
                    *slot = Layer::Shadow(Box::new(shadow));
                }
                Action::AddCopy => {
                    if let Layer::Shadow(shadow) = slot {
                        shadow.add_copy(adapter_name, config.inference_mode)?;
                    }
                }
            }
        }
        drop(rng);

        tracing::info!(
            "Injected {} adapter '{adapter_name}' into {targets} layer(s) targeting {}",
            config.peft_type.name(),
            config.target_modules
        );

        if config.peft_type == PeftMethod::AdaLora && !config.inference_mode {
            let ranks: Vec<usize> = self
                .tuner_paths()
                .iter()
                .filter_map(|path| self.tuner(path))
                .filter_map(|tuner| tuner.adapter(adapter_name))
                .map(|slot| slot.weights.rank())
                .collect();
            if let Some(schedule) = &config.schedule {
                self.allocators.insert(adapter_name.to_string(), RankAllocator::new(schedule.clone(), &ranks));
            }
        }
        self.configs.insert(adapter_name.to_string(), config);
        Ok(())
    }

    fn check_compatible(&self, adapter_name: &str, config: &AdapterConfig) -> Result<()> {
        if self.configs.contains_key(adapter_name) {
            return Err(PeftError::DuplicateAdapter(adapter_name.to_string()));
        }
        if let Some(existing) = self.configs.values().next() {
            if existing.peft_type != config.peft_type {
                return Err(PeftError::MethodMismatch {
                    expected: existing.peft_type.name().to_string(),
                    actual: config.peft_type.name().to_string(),
                });
            }
        }
        if config.bias != BiasMode::None && self.configs.values().any(|c| c.bias != BiasMode::None) {
            return Err(PeftError::InvalidConfig(
                "only one adapter per model may train biases (bias != \"none\")".into(),
            ));
        }
        let trainable_adalora = |c: &AdapterConfig| c.peft_type == PeftMethod::AdaLora && !c.inference_mode;
        if trainable_adalora(config) && self.configs.values().any(trainable_adalora) {
            return Err(PeftError::InvalidConfig(
                "AdaLoRA supports one trainable adapter; set inference_mode on the others".into(),
            ));
        }
        Ok(())
    }

    fn plan_injection(&self, config: &AdapterConfig) -> Result<Vec<(String, Action)>> {
        let matcher = TargetMatcher::new(&config.target_modules)?;
        let mut plan = Vec::new();
        for (path, layer) in self.model.named_layers() {
            if config.saves_module(&path) {
                let action = match layer {
                    Layer::Shadow(_) => Action::AddCopy,
                    Layer::Tuner(_) => {
                        return Err(PeftError::InvalidConfig(format!(
                            "'{path}' carries adapters and cannot also be fully fine-tuned"
                        )))
                    }
                    _ => Action::Shadow,
                };
                plan.push((path, action));
                continue;
            }
            if !matcher.is_match(&path) {
                continue;
            }
            let action = match layer {
                Layer::Tuner(_) => Action::Update,
                // fully fine-tuned modules are never adapted
                Layer::Shadow(_) => continue,
                other if is_supported(config.peft_type, other.kind()) => Action::Wrap,
                other => {
                    return Err(PeftError::UnsupportedLayer {
                        path,
                        kind: other.kind(),
                        method: config.peft_type.name(),
                    })
                }
            };
            plan.push((path, action));
        }
        Ok(plan)
    }
}
