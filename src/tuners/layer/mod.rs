//! Tunable layer wrapper and the base layers it accepts

mod base;
mod core;

#[cfg(test)]
mod tests;

pub use self::base::TunableBase;
pub use self::core::{AdapterSlot, TunerLayer};
