//! Execution context for forward passes

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{RefCell, RefMut};

/// Training/eval mode and the random state used by dropout and initialization
pub struct Context {
    training: bool,
    rng: RefCell<StdRng>,
}

impl Context {
    /// Create a new context seeded from the OS
    pub fn new() -> Self {
        Self { training: true, rng: RefCell::new(StdRng::from_os_rng()) }
    }

    /// Create a context with a fixed seed for reproducibility
    pub fn with_seed(seed: u64) -> Self {
        Self { training: true, rng: RefCell::new(StdRng::seed_from_u64(seed)) }
    }

    /// Set training mode
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Set evaluation mode
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Check if in training mode
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Borrow the random generator
    ///
    /// Panics if already borrowed; callers hold it only for the duration of a
    /// single sampling loop.
    pub fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
