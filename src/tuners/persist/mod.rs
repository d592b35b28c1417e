//! Adapter persistence
//!
//! Each adapter is stored as `adapter_config.json` plus
//! `adapter_model.safetensors`. Tensor keys are dotted module paths without
//! the adapter name (`lin0.lora_A.weight`, `lin1.modules_to_save.weight`),
//! so a checkpoint can be loaded under any adapter name.

mod io;
mod state_dict;

pub use io::{read_safetensors, write_safetensors, WEIGHTS_NAME};
pub use state_dict::{NamedTensor, StateDict};
