//! Tape-based autograd engine
//!
//! Provides automatic differentiation using a computational graph built as
//! operations run. Parameters are leaf tensors with `requires_grad`; every op
//! result that depends on one records a [`BackwardOp`].

mod backward;
mod context;
mod ops;
mod tensor;

#[cfg(test)]
mod tests;

pub use backward::BackwardOp;
pub use context::Context;
pub use ops::*;
pub use tensor::{GradCell, Tensor};

use std::collections::HashSet;

/// Perform backward pass on a tensor
///
/// Seeds the output gradient (ones for a scalar loss when `grad_output` is
/// `None`) and runs every backward op once, outputs before inputs.
pub fn backward(tensor: &mut Tensor, grad_output: Option<ndarray::Array1<f32>>) {
    if let Some(grad) = grad_output {
        tensor.set_grad(grad);
    } else {
        let ones = ndarray::Array1::ones(tensor.data().len());
        tensor.set_grad(ones);
    }

    let mut order = Vec::new();
    let mut visited = HashSet::new();
    topological_order(tensor, &mut visited, &mut order);

    for node in order.iter().rev() {
        if let Some(op) = node.backward_op() {
            op.backward();
        }
    }
}

fn topological_order(tensor: &Tensor, visited: &mut HashSet<usize>, order: &mut Vec<Tensor>) {
    if !visited.insert(tensor.node_id()) {
        return;
    }
    if let Some(op) = tensor.backward_op() {
        for input in op.inputs() {
            if input.requires_grad() {
                topological_order(input, visited, order);
            }
        }
    }
    order.push(tensor.clone());
}
