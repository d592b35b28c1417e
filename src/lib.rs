//! Adaptar: parameter-efficient adapters for small host models
//!
//! Injects LoRA, IA³ or AdaLoRA adapters into a named layer tree, switches
//! between several adapters, merges them into the base weights, combines
//! LoRA adapters and saves them as safetensors checkpoints.
//!
//! - [`autograd`]: tape-based automatic differentiation
//! - [`nn`]: host layers and the [`nn::Sequential`] container
//! - [`tuners`]: adapter configs, layer wrappers and [`PeftModel`]
//! - [`optim`]: optimizers for adapter training

pub mod autograd;
pub mod error;
pub mod nn;
pub mod optim;
pub mod tuners;

pub use autograd::{backward, Context, Tensor};
pub use error::{PeftError, Result};
pub use optim::{Optimizer, SGD};
pub use tuners::{AdapterConfig, BiasMode, CombinationType, PeftMethod, PeftModel, TargetModules};
