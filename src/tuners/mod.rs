//! Adapter tuners: configuration, layer wrappers and the model-level controller
//!
//! # Example
//!
//! ```
//! use adaptar::nn::{Layer, Linear, Sequential, ShapedTensor};
//! use adaptar::tuners::{AdapterConfig, PeftModel};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let base = Sequential::new()
//!     .with("lin0", Linear::new(4, 8, true, &mut rng))
//!     .with("relu", Layer::Relu)
//!     .with("lin1", Linear::new(8, 2, true, &mut rng));
//!
//! let config = AdapterConfig::lora(2, 4.0).with_targets("lin0");
//! let model = PeftModel::new(base, config, "default").unwrap();
//! let y = model.forward(&ShapedTensor::from_vec(vec![0.5; 4], vec![1, 4]));
//! assert_eq!(y.shape, vec![1, 2]);
//! ```

pub mod config;
pub mod layer;
pub mod method;
pub mod model;
pub mod persist;
pub mod rank_allocator;
pub mod shadow;
pub mod targets;

pub use config::{AdaLoraSchedule, AdapterConfig, BiasMode, PeftMethod, CONFIG_NAME};
pub use layer::{TunableBase, TunerLayer};
pub use model::{CombinationType, DisabledAdapters, PeftModel};
pub use rank_allocator::RankAllocator;
pub use shadow::ShadowLayer;
pub use targets::TargetModules;
