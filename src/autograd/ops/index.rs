//! Index-select autograd operations: gather and the layouts built on it

use crate::autograd::{BackwardOp, GradCell, Tensor};
use ndarray::Array1;
use std::rc::Rc;

/// Select elements by index
///
/// `out[i] = a[indices[i]]`, or `0.0` where the index is `None` (padding).
/// The backward pass scatter-adds into `a`, so repeated indices accumulate.
pub fn gather(a: &Tensor, indices: &[Option<usize>]) -> Tensor {
    let src = a.as_slice();
    let data: Vec<f32> = indices.iter().map(|idx| idx.map_or(0.0, |i| src[i])).collect();

    let requires_grad = a.requires_grad();
    let mut result = Tensor::from_vec(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(GatherBackward {
            a: a.clone(),
            indices: indices.to_vec(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct GatherBackward {
    a: Tensor,
    indices: Vec<Option<usize>>,
    result_grad: GradCell,
}

impl BackwardOp for GatherBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let mut grad_a = Array1::zeros(self.a.len());
                for (out_idx, src_idx) in self.indices.iter().enumerate() {
                    if let Some(i) = src_idx {
                        grad_a[*i] += grad[out_idx];
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

/// Differentiable transpose of a row-major `rows × cols` matrix
pub fn transpose_tensor(a: &Tensor, rows: usize, cols: usize) -> Tensor {
    assert_eq!(a.len(), rows * cols, "transpose size mismatch");
    let indices: Vec<Option<usize>> =
        (0..cols).flat_map(|c| (0..rows).map(move |r| Some(r * cols + c))).collect();
    gather(a, &indices)
}

/// Repeat a length-`n` vector as every row of a `rows × n` matrix
pub fn broadcast_rows(a: &Tensor, rows: usize) -> Tensor {
    let n = a.len();
    let indices: Vec<Option<usize>> = (0..rows * n).map(|i| Some(i % n)).collect();
    gather(a, &indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;

    #[test]
    fn test_gather_with_padding() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
        let out = gather(&a, &[Some(2), None, Some(0), Some(2)]);
        assert_eq!(out.to_vec(), vec![3.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn test_gather_backward_accumulates_repeats() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
        let mut out = gather(&a, &[Some(2), None, Some(0), Some(2)]);
        backward(&mut out, None);

        let grad = a.grad().expect("gradient should be available");
        assert_eq!(grad.to_vec(), vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_transpose_tensor_matches_slice_transpose() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let a = Tensor::from_vec(data.clone(), false);
        let t = transpose_tensor(&a, 2, 3);
        assert_eq!(t.to_vec(), crate::autograd::transpose(&data, 2, 3));
    }

    #[test]
    fn test_broadcast_rows() {
        let a = Tensor::from_vec(vec![1.0, 2.0], false);
        assert_eq!(broadcast_rows(&a, 3).to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }
}
