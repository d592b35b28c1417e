//! Random parameter initializers

use rand::Rng;
use rand_distr::StandardNormal;

/// Uniform fill in `[-1/sqrt(fan_in), 1/sqrt(fan_in))`
///
/// Matches the default init of dense and convolution layers and is the
/// variance-scaling fill used for LoRA `A` factors.
pub fn kaiming_uniform<R: Rng>(rng: &mut R, len: usize, fan_in: usize) -> Vec<f32> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    (0..len).map(|_| rng.random_range(-bound..bound)).collect()
}

/// Gaussian fill with mean 0 and the given standard deviation
pub fn normal<R: Rng>(rng: &mut R, len: usize, std: f32) -> Vec<f32> {
    (0..len)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        })
        .collect()
}

/// Uniform fill in `[low, high)`
pub fn uniform<R: Rng>(rng: &mut R, len: usize, low: f32, high: f32) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(low..high)).collect()
}
