//! Stochastic Gradient Descent optimizer

use super::Optimizer;
use crate::Tensor;
use ndarray::Array1;

/// SGD optimizer with optional momentum
pub struct SGD {
    lr: f32,
    momentum: f32,
    velocities: Vec<Option<Array1<f32>>>,
}

impl SGD {
    /// Create a new SGD optimizer
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self { lr, momentum, velocities: Vec::new() }
    }

    /// Velocities are positional; a different parameter list resets them
    fn ensure_velocities(&mut self, count: usize) {
        if self.velocities.len() != count {
            self.velocities = vec![None; count];
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [&mut Tensor]) {
        self.ensure_velocities(params.len());

        for (i, param) in params.iter_mut().enumerate() {
            if !param.requires_grad() {
                continue;
            }
            if let Some(grad) = param.grad() {
                if self.momentum > 0.0 {
                    // v = momentum * v - lr * grad
                    let velocity = match &self.velocities[i] {
                        Some(v) if v.len() == grad.len() => v * self.momentum - &grad * self.lr,
                        _ => &grad * (-self.lr),
                    };
                    *param.data_mut() += &velocity;
                    self.velocities[i] = Some(velocity);
                } else {
                    // param -= lr * grad
                    *param.data_mut() -= &(&grad * self.lr);
                }
            }
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
