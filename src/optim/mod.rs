//! Optimizers driving adapter training

mod optimizer;
mod sgd;

pub use optimizer::Optimizer;
pub use sgd::SGD;
