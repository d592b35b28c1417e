//! Backward operation trait

use super::Tensor;

/// A node's local gradient rule
///
/// `backward` reads the result gradient captured at construction time and
/// accumulates into the inputs that require gradients. It must not recurse:
/// the graph walk in [`crate::autograd::backward`] visits every node once, in
/// reverse topological order.
pub trait BackwardOp {
    /// Propagate the result gradient into the inputs
    fn backward(&self);

    /// Inputs of this node (used to order the graph walk)
    fn inputs(&self) -> Vec<&Tensor>;
}
