//! In-memory adapter state: named tensors restricted to one adapter

use crate::error::{PeftError, Result};
use crate::nn::Layer;
use crate::tuners::config::{BiasMode, PeftMethod};
use crate::tuners::model::PeftModel;
use std::collections::{BTreeMap, HashMap};

/// Flat tensor data with its logical shape
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Adapter tensors keyed by checkpoint name
pub type StateDict = BTreeMap<String, NamedTensor>;

/// One tensor an adapter owns
struct Entry {
    /// Checkpoint key
    key: String,
    /// Name in [`PeftModel::named_parameters`]
    param: String,
    shape: Vec<usize>,
}

fn adapter_entries(model: &PeftModel, adapter_name: &str) -> Result<Vec<Entry>> {
    let bias = model
        .config(adapter_name)
        .map(|c| c.bias)
        .ok_or_else(|| PeftError::UnknownAdapter(adapter_name.to_string()))?;
    let mut entries = Vec::new();
    let mut push_bias = |path: &str, layer_bias: Option<usize>| {
        if let Some(len) = layer_bias {
            let name = format!("{path}.bias");
            entries.push(Entry { key: name.clone(), param: name, shape: vec![len] });
        }
    };
    let mut adapter = Vec::new();

    for (path, layer) in model.model().named_layers() {
        match layer {
            Layer::Tuner(tuner) => {
                let Some(slot) = tuner.adapter(adapter_name) else { continue };
                let shapes = slot.weights.shapes(tuner.base());
                for ((tensor_name, _), shape) in slot.weights.tensors().into_iter().zip(shapes) {
                    let key = match slot.weights.method() {
                        PeftMethod::Lora => format!("{path}.{tensor_name}.weight"),
                        _ => format!("{path}.{tensor_name}"),
                    };
                    adapter.push(Entry { key, param: format!("{path}.{tensor_name}.{adapter_name}"), shape });
                }
                if bias != BiasMode::None {
                    push_bias(&path, tuner.base().bias().map(|b| b.len()));
                }
            }
            Layer::Shadow(shadow) => {
                let Some(copy) = shadow.copy(adapter_name) else { continue };
                for ((p, _), shape) in copy.parameters().into_iter().zip(copy.parameter_shapes()) {
                    adapter.push(Entry {
                        key: format!("{path}.modules_to_save.{p}"),
                        param: format!("{path}.modules_to_save.{adapter_name}.{p}"),
                        shape,
                    });
                }
            }
            Layer::Sequential(_) => {}
            plain if bias == BiasMode::All => {
                let len = plain.parameters().into_iter().find(|(p, _)| p == "bias").map(|(_, t)| t.len());
                push_bias(&path, len);
            }
            _ => {}
        }
    }
    entries.extend(adapter);
    Ok(entries)
}

impl PeftModel {
    /// Tensors of `adapter_name` (and trained biases) keyed for a checkpoint
    pub fn state_dict(&self, adapter_name: &str) -> Result<StateDict> {
        let entries = adapter_entries(self, adapter_name)?;
        let params: HashMap<String, _> = self.named_parameters().into_iter().collect();
        let mut state = StateDict::new();
        for entry in entries {
            let tensor = params.get(&entry.param).ok_or_else(|| PeftError::MissingTensor(entry.param.clone()))?;
            state.insert(entry.key, NamedTensor { shape: entry.shape, data: tensor.to_vec() });
        }
        Ok(state)
    }

    /// Copy checkpoint tensors into `adapter_name`
    ///
    /// Every tensor the adapter owns must be present with the expected
    /// shape; nothing is written unless all of them are. A merged adapter
    /// must be unmerged first.
    pub fn load_state_dict(&mut self, adapter_name: &str, state: &StateDict) -> Result<()> {
        if self.is_adapter_merged(adapter_name) {
            return Err(PeftError::AdapterMerged(adapter_name.to_string()));
        }
        let mut updates: HashMap<String, &[f32]> = HashMap::new();
        for entry in adapter_entries(self, adapter_name)? {
            let tensor = state.get(&entry.key).ok_or_else(|| PeftError::MissingTensor(entry.key.clone()))?;
            let numel: usize = entry.shape.iter().product();
            if tensor.shape != entry.shape || tensor.data.len() != numel {
                return Err(PeftError::ShapeMismatch {
                    name: entry.key,
                    expected: entry.shape,
                    actual: tensor.shape.clone(),
                });
            }
            updates.insert(entry.param, &tensor.data);
        }

        let mut loaded = 0usize;
        for (name, param) in self.model_mut().parameters_mut() {
            if let Some(data) = updates.get(&name) {
                param.as_slice_mut().copy_from_slice(data);
                loaded += 1;
            }
        }
        tracing::debug!("Loaded {loaded} tensors into adapter '{adapter_name}'");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Linear, Sequential};
    use crate::tuners::config::AdapterConfig;
    use crate::autograd::Context;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn base() -> Sequential {
        let mut rng = StdRng::seed_from_u64(1);
        Sequential::new()
            .with("lin0", Linear::new(4, 3, true, &mut rng))
            .with("relu", Layer::Relu)
            .with("lin1", Linear::new(3, 2, true, &mut rng))
    }

    fn model(config: AdapterConfig) -> PeftModel {
        PeftModel::with_context(base(), config, "default", Context::with_seed(0)).unwrap()
    }

    #[test]
    fn test_keys_drop_adapter_name() {
        let config = AdapterConfig::lora(2, 2.0).with_targets("lin0").with_modules_to_save(&["lin1"]);
        let state = model(config).state_dict("default").unwrap();
        let keys: Vec<&str> = state.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "lin0.lora_A.weight",
                "lin0.lora_B.weight",
                "lin1.modules_to_save.bias",
                "lin1.modules_to_save.weight",
            ]
        );
        assert_eq!(state["lin0.lora_A.weight"].shape, vec![2, 4]);
        assert_eq!(state["lin0.lora_B.weight"].shape, vec![3, 2]);
        assert_eq!(state["lin1.modules_to_save.weight"].shape, vec![2, 3]);
    }

    #[test]
    fn test_bias_modes_add_bias_keys() {
        let lora_only = AdapterConfig::lora(2, 2.0).with_targets("lin0").with_bias(BiasMode::LoraOnly);
        let state = model(lora_only).state_dict("default").unwrap();
        assert!(state.contains_key("lin0.bias"));
        assert!(!state.contains_key("lin1.bias"));

        let all = AdapterConfig::lora(2, 2.0).with_targets("lin0").with_bias(BiasMode::All);
        let state = model(all).state_dict("default").unwrap();
        assert!(state.contains_key("lin0.bias"));
        assert!(state.contains_key("lin1.bias"));
    }

    #[test]
    fn test_method_specific_keys() {
        let ia3 = AdapterConfig::ia3().with_targets("lin0");
        let state = model(ia3).state_dict("default").unwrap();
        assert_eq!(state["lin0.ia3_l"].shape, vec![3]);

        let adalora = AdapterConfig::adalora(3, 1).with_targets("lin0");
        let state = model(adalora).state_dict("default").unwrap();
        assert_eq!(state["lin0.lora_A"].shape, vec![3, 4]);
        assert_eq!(state["lin0.lora_E"].shape, vec![3]);
        assert_eq!(state["lin0.lora_B"].shape, vec![3, 3]);
    }

    #[test]
    fn test_load_rejects_missing_and_misshapen() {
        let config = AdapterConfig::lora(2, 2.0).with_targets("lin0");
        let mut peft = model(config);
        let mut state = peft.state_dict("default").unwrap();

        let mut wrong = state.clone();
        wrong.insert("lin0.lora_A.weight".into(), NamedTensor { shape: vec![1, 4], data: vec![0.0; 4] });
        assert!(matches!(peft.load_state_dict("default", &wrong), Err(PeftError::ShapeMismatch { .. })));

        state.remove("lin0.lora_B.weight");
        assert!(matches!(peft.load_state_dict("default", &state), Err(PeftError::MissingTensor(_))));
        assert!(matches!(peft.state_dict("nope"), Err(PeftError::UnknownAdapter(_))));
    }

    #[test]
    fn test_load_copies_values() {
        let config = AdapterConfig::lora(2, 2.0).with_targets("lin0");
        let mut peft = model(config);
        let mut state = peft.state_dict("default").unwrap();
        if let Some(b) = state.get_mut("lin0.lora_B.weight") {
            b.data = vec![0.5; 6];
        }
        peft.load_state_dict("default", &state).unwrap();
        assert_eq!(peft.state_dict("default").unwrap(), state);
        assert!(peft.tuner("lin0").unwrap().parameters().iter().any(|(n, t)| n == "lora_B.default" && t.requires_grad()));
    }

    #[test]
    fn test_load_rejected_while_merged() {
        let config = AdapterConfig::lora(2, 2.0).with_targets("lin0").with_init_weights(false);
        let mut peft = model(config);
        let base_weight = peft.tuner("lin0").unwrap().base().weight().to_vec();
        let original = peft.state_dict("default").unwrap();
        let mut state = original.clone();
        if let Some(b) = state.get_mut("lin0.lora_B.weight") {
            b.data = vec![0.5; 6];
        }

        peft.merge_adapter(None).unwrap();
        assert!(matches!(peft.load_state_dict("default", &state), Err(PeftError::AdapterMerged(_))));
        assert_eq!(peft.state_dict("default").unwrap(), original);

        peft.unmerge_adapter().unwrap();
        let restored = peft.tuner("lin0").unwrap().base().weight().to_vec();
        for (a, b) in restored.iter().zip(&base_weight) {
            assert!((a - b).abs() < 1e-5);
        }
        peft.load_state_dict("default", &state).unwrap();
        assert_eq!(peft.state_dict("default").unwrap(), state);
    }
}
