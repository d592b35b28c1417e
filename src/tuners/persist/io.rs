//! On-disk adapter checkpoints (adapter_config.json + adapter_model.safetensors)

use super::state_dict::{NamedTensor, StateDict};
use crate::autograd::Context;
use crate::error::{PeftError, Result};
use crate::nn::Sequential;
use crate::tuners::config::AdapterConfig;
use crate::tuners::model::PeftModel;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File holding the adapter tensors
pub const WEIGHTS_NAME: &str = "adapter_model.safetensors";

const DEFAULT_ADAPTER: &str = "default";

/// Write a state dict as F32 safetensors
pub fn write_safetensors(path: impl AsRef<Path>, state: &StateDict) -> Result<()> {
    let tensor_data: Vec<(&str, &[u8], &[usize])> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), bytemuck::cast_slice(&tensor.data), tensor.shape.as_slice()))
        .collect();

    let mut views = Vec::with_capacity(tensor_data.len());
    for (name, bytes, shape) in tensor_data {
        let view = TensorView::new(Dtype::F32, shape.to_vec(), bytes)
            .map_err(|e| PeftError::SafeTensors(format!("Invalid tensor '{name}': {e}")))?;
        views.push((name, view));
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());

    let bytes = safetensors::serialize(views, Some(metadata))
        .map_err(|e| PeftError::SafeTensors(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read every tensor of an F32 safetensors file
pub fn read_safetensors(path: impl AsRef<Path>) -> Result<StateDict> {
    let bytes = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| PeftError::SafeTensors(format!("Failed to parse safetensors: {e}")))?;

    let mut state = StateDict::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(PeftError::SafeTensors(format!("Tensor '{name}' has dtype {:?}, expected F32", view.dtype())));
        }
        // pod_collect_to_vec copies, so unaligned buffers are fine
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        state.insert(name, NamedTensor { shape: view.shape().to_vec(), data });
    }
    Ok(state)
}

/// Directory an adapter is saved to under `root`
pub fn adapter_dir(root: &Path, adapter_name: &str) -> PathBuf {
    if adapter_name == DEFAULT_ADAPTER {
        root.to_path_buf()
    } else {
        root.join(adapter_name)
    }
}

impl PeftModel {
    /// Save every adapter's config and tensors
    ///
    /// The `default` adapter goes directly into `dir`, any other adapter into
    /// `dir/<name>`. Saved configs are marked `inference_mode`.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let root = dir.as_ref();
        for name in self.adapter_names() {
            self.save_adapter(&adapter_dir(root, &name), &name)?;
        }
        Ok(())
    }

    /// Save one adapter's files directly into `dir`
    pub fn save_adapter(&self, dir: impl AsRef<Path>, adapter_name: &str) -> Result<()> {
        let dir = dir.as_ref();
        let mut config = self
            .config(adapter_name)
            .cloned()
            .ok_or_else(|| PeftError::UnknownAdapter(adapter_name.to_string()))?;
        config.inference_mode = true;
        config.save(dir)?;

        let state = self.state_dict(adapter_name)?;
        write_safetensors(dir.join(WEIGHTS_NAME), &state)?;
        tracing::info!("Saved adapter '{adapter_name}' ({} tensors) to {}", state.len(), dir.display());
        Ok(())
    }

    /// Inject a saved adapter into `model` and load its weights
    ///
    /// With `is_trainable == false` the adapter is loaded frozen.
    pub fn from_pretrained(
        model: Sequential,
        dir: impl AsRef<Path>,
        adapter_name: &str,
        is_trainable: bool,
    ) -> Result<Self> {
        Self::from_pretrained_with_context(model, dir, adapter_name, is_trainable, Context::new())
    }

    pub fn from_pretrained_with_context(
        model: Sequential,
        dir: impl AsRef<Path>,
        adapter_name: &str,
        is_trainable: bool,
        ctx: Context,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let mut config = AdapterConfig::load(dir)?;
        config.inference_mode = !is_trainable;
        let state = read_safetensors(dir.join(WEIGHTS_NAME))?;

        let mut peft = Self::with_context(model, config, adapter_name, ctx)?;
        peft.load_state_dict(adapter_name, &state)?;
        tracing::info!("Loaded adapter '{adapter_name}' from {}", dir.display());
        Ok(peft)
    }

    /// Add a saved adapter next to the existing ones; it is not activated
    ///
    /// On failure the partially added adapter is removed again.
    pub fn load_adapter(&mut self, dir: impl AsRef<Path>, adapter_name: &str, is_trainable: bool) -> Result<()> {
        let dir = dir.as_ref();
        let mut config = AdapterConfig::load(dir)?;
        config.inference_mode = !is_trainable;
        let state = read_safetensors(dir.join(WEIGHTS_NAME))?;

        self.add_adapter(adapter_name, config)?;
        if let Err(e) = self.load_state_dict(adapter_name, &state) {
            if let Err(cleanup) = self.delete_adapter(adapter_name) {
                tracing::warn!("Failed to remove partially loaded adapter '{adapter_name}': {cleanup}");
            }
            return Err(e);
        }
        tracing::info!("Loaded adapter '{adapter_name}' from {}", dir.display());
        Ok(())
    }
}
