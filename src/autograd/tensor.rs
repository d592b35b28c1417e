//! Tensor with gradient tracking
//!
//! Data is stored flat; layers carry their own logical shapes. Cloning a
//! tensor shares the gradient cell, so a clone captured by a backward op
//! accumulates into the same gradient as the parameter it was taken from.

use super::BackwardOp;
use ndarray::Array1;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared, lazily allocated gradient storage
pub type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

/// Flat `f32` tensor participating in the autograd graph
#[derive(Clone)]
pub struct Tensor {
    data: Array1<f32>,
    grad: GradCell,
    backward_op: Option<Rc<dyn BackwardOp>>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a tensor from an ndarray
    pub fn new(data: Array1<f32>, requires_grad: bool) -> Self {
        Self { data, grad: Rc::new(RefCell::new(None)), backward_op: None, requires_grad }
    }

    /// Create a tensor from a vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from(data), requires_grad)
    }

    /// Tensor of zeros
    pub fn zeros(len: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(len), requires_grad)
    }

    /// Tensor of ones
    pub fn ones(len: usize, requires_grad: bool) -> Self {
        Self::new(Array1::ones(len), requires_grad)
    }

    /// Non-differentiable tensor (never receives gradients)
    pub fn constant(data: Vec<f32>) -> Self {
        Self::from_vec(data, false)
    }

    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Contiguous view of the data
    pub fn as_slice(&self) -> &[f32] {
        self.data.as_slice().expect("tensor data is always contiguous")
    }

    /// Contiguous mutable view of the data
    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        self.data.as_slice_mut().expect("tensor data is always contiguous")
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Toggle gradient tracking; dropping tracking also drops any stale gradient
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if !requires_grad {
            self.zero_grad();
        }
    }

    /// Copy of the accumulated gradient, if any
    pub fn grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow().clone()
    }

    /// Handle to the gradient cell, used by backward ops to read the output gradient
    pub fn grad_cell(&self) -> GradCell {
        Rc::clone(&self.grad)
    }

    /// Overwrite the gradient
    pub fn set_grad(&self, grad: Array1<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Add to the gradient, allocating it on first use
    pub fn accumulate_grad(&self, grad: Array1<f32>) {
        let mut cell = self.grad.borrow_mut();
        match cell.as_mut() {
            Some(existing) => *existing += &grad,
            None => *cell = Some(grad),
        }
    }

    /// Clear the gradient
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.clone()
    }

    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        self.backward_op = Some(op);
    }

    /// Identity of this graph node (shared by clones)
    pub fn node_id(&self) -> usize {
        Rc::as_ptr(&self.grad) as *const () as usize
    }

    /// Independent copy: same values, fresh gradient cell, no graph history
    pub fn deep_copy(&self) -> Self {
        Self::new(self.data.clone(), self.requires_grad)
    }

    /// Same values cut from the graph, never tracking gradients
    pub fn detach(&self) -> Self {
        Self::new(self.data.clone(), false)
    }

    /// Elementwise closeness check with combined absolute/relative tolerance
    pub fn allclose(&self, other: &Tensor, tol: f32) -> bool {
        self.len() == other.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol + tol * b.abs())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("len", &self.len())
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}
