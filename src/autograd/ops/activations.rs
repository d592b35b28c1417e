//! Activation function autograd operations: relu, log_softmax

use crate::autograd::{BackwardOp, GradCell, Tensor};
use ndarray::Array1;
use std::rc::Rc;

/// ReLU activation
pub fn relu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x.max(0.0));
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ReluBackward { a: a.clone(), result_grad: result.grad_cell() });
        result.set_backward_op(backward_op);
    }

    result
}

struct ReluBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for ReluBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * (a > 0)
                let grad_a = grad * &self.a.data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                self.a.accumulate_grad(grad_a);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Row-wise log-softmax over a `rows × cols` matrix
///
/// log_softmax(x)_i = x_i - max(x) - log(Σ exp(x_j - max(x)))
pub fn log_softmax(a: &Tensor, rows: usize, cols: usize) -> Tensor {
    assert_eq!(a.len(), rows * cols, "log_softmax size mismatch");

    let input = a.as_slice();
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        let row = &input[r * cols..(r + 1) * cols];
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|x| (x - max_val).exp()).sum::<f32>().ln();
        for (c, x) in row.iter().enumerate() {
            out[r * cols + c] = x - max_val - log_sum;
        }
    }

    let requires_grad = a.requires_grad();
    let mut result = Tensor::from_vec(out, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(LogSoftmaxBackward {
            a: a.clone(),
            output: result.data().clone(),
            rows,
            cols,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct LogSoftmaxBackward {
    a: Tensor,
    output: Array1<f32>,
    rows: usize,
    cols: usize,
    result_grad: GradCell,
}

impl BackwardOp for LogSoftmaxBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂x_i = g_i - softmax_i * Σ_j g_j   (per row)
                let mut grad_a = Array1::zeros(self.rows * self.cols);
                for r in 0..self.rows {
                    let span = r * self.cols..(r + 1) * self.cols;
                    let g_sum: f32 = span.clone().map(|i| grad[i]).sum();
                    for i in span {
                        grad_a[i] = grad[i] - self.output[i].exp() * g_sum;
                    }
                }
                self.a.accumulate_grad(grad_a);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}
