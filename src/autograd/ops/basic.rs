//! Basic autograd operations: add, mul, scale, sum, sqrt

use crate::autograd::{BackwardOp, GradCell, Tensor};
use ndarray::Array1;
use std::rc::Rc;

/// Add two tensors
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add operands must have the same length");
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Multiply two tensors element-wise
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "mul operands must have the same length");
    let data = a.data() * b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for MulBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * b
                self.a.accumulate_grad(grad * self.b.data());
            }
            if self.b.requires_grad() {
                // ∂L/∂b = ∂L/∂out * a
                self.b.accumulate_grad(grad * self.a.data());
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Scale tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op =
            Rc::new(ScaleBackward { a: a.clone(), factor, result_grad: result.grad_cell() });
        result.set_backward_op(backward_op);
    }

    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: GradCell,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad * self.factor);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Sum all elements
pub fn sum(a: &Tensor) -> Tensor {
    let data = Array1::from(vec![a.data().sum()]);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SumBackward { a: a.clone(), result_grad: result.grad_cell() });
        result.set_backward_op(backward_op);
    }

    result
}

struct SumBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for SumBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂sum broadcast
                self.a.accumulate_grad(Array1::from_elem(self.a.len(), grad[0]));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Element-wise square root
pub fn sqrt(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x.max(0.0).sqrt());
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SqrtBackward {
            a: a.clone(),
            output: result.data().clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SqrtBackward {
    a: Tensor,
    output: Array1<f32>,
    result_grad: GradCell,
}

impl BackwardOp for SqrtBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out / (2 sqrt(a)), finite at 0
                let denom = self.output.mapv(|s| 2.0 * s + 1e-12);
                self.a.accumulate_grad(grad / &denom);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}
