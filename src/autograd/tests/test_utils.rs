//! Test utilities for gradient checking

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Finite difference gradient checker
///
/// Computes numerical gradient using central difference:
/// f'(x) ≈ (f(x + h) - f(x - h)) / (2h)
pub fn finite_difference<F>(f: F, x: &[f32], epsilon: f32) -> Vec<f32>
where
    F: Fn(&[f32]) -> f32,
{
    let mut grad = vec![0.0; x.len()];
    let mut x_plus = x.to_vec();
    let mut x_minus = x.to_vec();

    for i in 0..x.len() {
        x_plus[i] = x[i] + epsilon;
        x_minus[i] = x[i] - epsilon;

        grad[i] = (f(&x_plus) - f(&x_minus)) / (2.0 * epsilon);

        x_plus[i] = x[i];
        x_minus[i] = x[i];
    }

    grad
}

/// Deterministic values in [-2.5, 2.5) derived from a seed
pub fn seeded_values(seed: u64, len: usize) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let base = hasher.finish();
    (0..len)
        .map(|i| (base.wrapping_add(i as u64 * 2_654_435_761) % 1000) as f32 / 200.0 - 2.5)
        .collect()
}
