//! Full fine-tuning of selected modules
//!
//! A `modules_to_save` layer keeps its frozen original next to one deep copy
//! per adapter. Exactly one of them runs at forward time.

use crate::autograd::{Context, Tensor};
use crate::error::{PeftError, Result};
use crate::nn::{Layer, ShapedTensor};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct ShadowCopy {
    pub layer: Layer,
    pub inference_mode: bool,
}

/// Frozen original plus per-adapter trainable copies
#[derive(Clone, Debug)]
pub struct ShadowLayer {
    original: Box<Layer>,
    copies: BTreeMap<String, ShadowCopy>,
    active: Vec<String>,
    disabled: bool,
}

impl ShadowLayer {
    /// Wrap `layer`; no copy exists until [`ShadowLayer::add_copy`]
    pub fn new(mut layer: Layer) -> Self {
        layer.set_requires_grad(false);
        Self { original: Box::new(layer), copies: BTreeMap::new(), active: Vec::new(), disabled: false }
    }

    /// Deep-copy the original for adapter `name`
    pub fn add_copy(&mut self, name: &str, inference_mode: bool) -> Result<()> {
        if self.copies.contains_key(name) {
            return Err(PeftError::DuplicateAdapter(name.to_string()));
        }
        let layer = self.original.deep_copy();
        self.copies.insert(name.to_string(), ShadowCopy { layer, inference_mode });
        self.refresh_requires_grad();
        Ok(())
    }

    pub fn original(&self) -> &Layer {
        &self.original
    }

    pub fn copy(&self, name: &str) -> Option<&Layer> {
        self.copies.get(name).map(|c| &c.layer)
    }

    pub fn copy_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.copies.get_mut(name).map(|c| &mut c.layer)
    }

    pub fn has_copy(&self, name: &str) -> bool {
        self.copies.contains_key(name)
    }

    pub fn copy_names(&self) -> Vec<String> {
        self.copies.keys().cloned().collect()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// The copy used at forward time: first active name that has one
    pub fn active_copy(&self) -> Option<&str> {
        if self.disabled {
            return None;
        }
        self.active.iter().find(|name| self.copies.contains_key(*name)).map(String::as_str)
    }

    pub fn set_adapter(&mut self, names: &[String]) {
        self.active = names.to_vec();
        self.refresh_requires_grad();
    }

    /// While disabled the original runs and is the trainable one
    pub fn enable_adapters(&mut self, enabled: bool) {
        self.disabled = !enabled;
        self.refresh_requires_grad();
    }

    fn refresh_requires_grad(&mut self) {
        let running = self.active_copy().map(str::to_string);
        self.original.set_requires_grad(self.disabled);
        for (name, copy) in self.copies.iter_mut() {
            let trainable = running.as_deref() == Some(name.as_str()) && !copy.inference_mode;
            copy.layer.set_requires_grad(trainable);
        }
    }

    pub fn forward(&self, x: &ShapedTensor, ctx: &Context) -> ShapedTensor {
        match self.active_copy().and_then(|name| self.copies.get(name)) {
            Some(copy) => copy.layer.forward(x, ctx),
            None => self.original.forward(x, ctx),
        }
    }

    pub fn delete_copy(&mut self, name: &str) -> Result<()> {
        self.copies.remove(name).ok_or_else(|| PeftError::UnknownAdapter(name.to_string()))?;
        self.active.retain(|n| n != name);
        self.refresh_requires_grad();
        Ok(())
    }

    /// `original_module.<p>` then `modules_to_save.<adapter>.<p>`
    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params: Vec<(String, &Tensor)> = self
            .original
            .parameters()
            .into_iter()
            .map(|(p, t)| (format!("original_module.{p}"), t))
            .collect();
        for (name, copy) in &self.copies {
            for (p, t) in copy.layer.parameters() {
                params.push((format!("modules_to_save.{name}.{p}"), t));
            }
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params: Vec<(String, &mut Tensor)> = self
            .original
            .parameters_mut()
            .into_iter()
            .map(|(p, t)| (format!("original_module.{p}"), t))
            .collect();
        for (name, copy) in self.copies.iter_mut() {
            for (p, t) in copy.layer.parameters_mut() {
                params.push((format!("modules_to_save.{name}.{p}"), t));
            }
        }
        params
    }

    /// Replace the wrapper by whichever layer currently runs
    pub fn into_active(mut self) -> Layer {
        let chosen = self.active_copy().map(str::to_string);
        match chosen.and_then(|name| self.copies.remove(&name)) {
            Some(copy) => copy.layer,
            None => *self.original,
        }
    }

    pub fn into_original(self) -> Layer {
        *self.original
    }
}
