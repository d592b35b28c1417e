//! Autograd operations with backward passes
//!
//! This module provides differentiable operations for automatic differentiation.

mod activations;
mod basic;
mod index;
mod matmul;

// Re-export all public operations
pub use activations::{log_softmax, relu};
pub use basic::{add, mul, scale, sqrt, sum};
pub use index::{broadcast_rows, gather, transpose_tensor};
pub use matmul::{matmul, matmul_compute, transpose};
