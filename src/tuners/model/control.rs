//! Active-set switching, scoped disabling, merging and unloading

use super::PeftModel;
use crate::error::{PeftError, Result};
use crate::nn::{Layer, Sequential};
use crate::tuners::config::BiasMode;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

impl PeftModel {
    /// Make `adapter_name` the only active adapter
    pub fn set_adapter(&mut self, adapter_name: &str) -> Result<()> {
        self.set_active_adapters(&[adapter_name])
    }

    /// Activate several adapters at once; their outputs add up in this order
    pub fn set_active_adapters(&mut self, adapter_names: &[&str]) -> Result<()> {
        for name in adapter_names {
            self.require_adapter(name)?;
        }
        if self.is_merged() {
            tracing::warn!("Adapters are merged; unmerging before switching the active set");
            self.unmerge_adapter()?;
        }
        self.active = adapter_names.iter().map(|s| s.to_string()).collect();
        self.refresh_layers();
        Ok(())
    }

    /// Remove an adapter from every wrapper; a merged adapter must be unmerged first
    pub fn delete_adapter(&mut self, adapter_name: &str) -> Result<()> {
        self.require_adapter(adapter_name)?;
        if self.is_adapter_merged(adapter_name) {
            return Err(PeftError::AdapterMerged(adapter_name.to_string()));
        }

        self.model.try_visit_mut(&mut |_, layer| match layer {
            Layer::Tuner(tuner) if tuner.has_adapter(adapter_name) => tuner.delete_adapter(adapter_name),
            Layer::Shadow(shadow) if shadow.has_copy(adapter_name) => shadow.delete_copy(adapter_name),
            _ => Ok(()),
        })?;
        self.configs.remove(adapter_name);
        self.allocators.remove(adapter_name);
        self.rank_masks.remove(adapter_name);

        self.active.retain(|n| n != adapter_name);
        if self.active.is_empty() {
            if let Some(next) = self.configs.keys().next() {
                tracing::warn!("Deleted the active adapter '{adapter_name}'; '{next}' is now active");
                self.active.push(next.clone());
            }
        }
        self.refresh_layers();
        Ok(())
    }

    /// Whether any wrapper has adapters folded into its weights
    ///
    /// Merges suspended by [`PeftModel::disable_adapter_layers`] count.
    pub fn is_merged(&self) -> bool {
        self.tuner_paths().iter().filter_map(|path| self.tuner(path)).any(|t| t.is_merged())
    }

    /// Fold adapters into the base weights
    ///
    /// `None` merges the active adapters. Fails without touching any layer if
    /// one of the requested adapters is already merged somewhere.
    pub fn merge_adapter(&mut self, adapter_names: Option<&[&str]>) -> Result<()> {
        if self.disabled {
            return Err(PeftError::AdaptersDisabled);
        }
        let names: Vec<String> = match adapter_names {
            Some(names) => {
                for (i, name) in names.iter().enumerate() {
                    self.require_adapter(name)?;
                    if names[..i].contains(name) {
                        return Err(PeftError::AlreadyMerged(name.to_string()));
                    }
                }
                names.iter().map(|s| s.to_string()).collect()
            }
            None => self.active.clone(),
        };

        for path in self.tuner_paths() {
            if let Some(tuner) = self.tuner(&path) {
                if let Some(name) = names.iter().find(|n| tuner.merged_adapters().contains(*n)) {
                    return Err(PeftError::AlreadyMerged(name.clone()));
                }
            }
        }

        self.model.try_visit_mut(&mut |_, layer| {
            if let Layer::Tuner(tuner) = layer {
                let present: Vec<String> = names.iter().filter(|n| tuner.has_adapter(n)).cloned().collect();
                if !present.is_empty() {
                    tuner.merge(Some(&present))?;
                }
            }
            Ok(())
        })?;
        tracing::debug!("Merged adapters {names:?}");
        Ok(())
    }

    /// Undo every merge, last merged first
    ///
    /// While disabled this drops the merges that enabling would restore.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        if !self.is_merged() {
            return Err(PeftError::NothingMerged);
        }
        self.model.try_visit_mut(&mut |_, layer| match layer {
            Layer::Tuner(tuner) if tuner.is_merged() => tuner.unmerge(),
            _ => Ok(()),
        })
    }

    /// Bypass every adapter until [`PeftModel::enable_adapter_layers`]
    pub fn disable_adapter_layers(&mut self) {
        self.warn_on_trained_bias();
        self.disabled = true;
        self.refresh_layers();
    }

    pub fn enable_adapter_layers(&mut self) {
        self.disabled = false;
        self.refresh_layers();
    }

    /// Bypass adapters for the lifetime of the returned guard
    ///
    /// Dropping the guard re-enables adapters and restores every
    /// `requires_grad` flag to its value at entry. Nesting is rejected.
    pub fn disable_adapter(&mut self) -> Result<DisabledAdapters<'_>> {
        if self.disabled {
            return Err(PeftError::AdaptersAlreadyDisabled);
        }
        let saved = self
            .model
            .parameters()
            .into_iter()
            .map(|(name, t)| (name, t.requires_grad()))
            .collect();
        self.disable_adapter_layers();
        Ok(DisabledAdapters { model: self, saved })
    }

    fn warn_on_trained_bias(&self) {
        for (name, config) in &self.configs {
            if config.bias != BiasMode::None {
                tracing::warn!(
                    "Adapter '{name}' trains biases ({:?}); disabling adapters does not restore the original biases",
                    config.bias
                );
            }
        }
    }

    /// Make biases trainable per the active adapters' bias mode
    pub(super) fn apply_bias_policy(&mut self) {
        let mode = self
            .active
            .iter()
            .filter_map(|name| self.configs.get(name))
            .map(|config| config.bias)
            .find(|bias| *bias != BiasMode::None);
        let Some(mode) = mode else { return };

        self.model.visit_mut(|_, layer| {
            if let Layer::Tuner(tuner) = layer {
                tuner.base_mut().bias_requires_grad(true);
            } else if mode == BiasMode::All {
                if let Some(bias) = layer.bias_mut() {
                    bias.set_requires_grad(true);
                }
            }
        });
    }

    /// Merge the active adapters and return the plain host model
    pub fn merge_and_unload(mut self) -> Result<Sequential> {
        if self.disabled {
            self.enable_adapter_layers();
        }
        self.model.try_visit_mut(&mut |_, layer| {
            let taken = std::mem::replace(layer, Layer::Identity);
            *layer = match taken {
                Layer::Tuner(tuner) => tuner.merge_and_unload()?,
                Layer::Shadow(shadow) => shadow.into_active(),
                other => other,
            };
            Ok(())
        })?;
        tracing::info!("Merged adapters into the base model and removed the wrappers");
        Ok(self.model)
    }

    /// Remove every wrapper without merging, restoring the original layers
    pub fn unload(mut self) -> Sequential {
        self.model.visit_mut(|_, layer| {
            let taken = std::mem::replace(layer, Layer::Identity);
            *layer = match taken {
                Layer::Tuner(tuner) => tuner.unload(),
                Layer::Shadow(shadow) => shadow.into_original(),
                other => other,
            };
        });
        self.model
    }
}

/// Scope in which every adapter is bypassed
///
/// Derefs to the model, so forward passes (and training steps) run through
/// the guard.
pub struct DisabledAdapters<'a> {
    model: &'a mut PeftModel,
    saved: BTreeMap<String, bool>,
}

impl Deref for DisabledAdapters<'_> {
    type Target = PeftModel;

    fn deref(&self) -> &PeftModel {
        self.model
    }
}

impl DerefMut for DisabledAdapters<'_> {
    fn deref_mut(&mut self) -> &mut PeftModel {
        self.model
    }
}

impl Drop for DisabledAdapters<'_> {
    fn drop(&mut self) {
        self.model.enable_adapter_layers();
        for (name, param) in self.model.model.parameters_mut() {
            if let Some(flag) = self.saved.get(&name) {
                param.set_requires_grad(*flag);
            }
        }
    }
}
