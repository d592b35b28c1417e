//! Importance-driven rank budget for AdaLoRA
//!
//! Tracks a smoothed sensitivity `|p · ∂L/∂p|` and its uncertainty for every
//! entry of every AdaLoRA factor. Each `(A row, E value, B column)` triplet
//! gets a score, and between `tinit` and `total_step - tfinal` the total
//! rank budget decays cubically from its initial value to
//! `target_r × layers`; the lowest-scoring triplets are masked to meet it.

use crate::error::{PeftError, Result};
use crate::tuners::config::AdaLoraSchedule;
use crate::tuners::method::AdaLoraWeights;
use ndarray::Array1;
use std::collections::BTreeMap;

/// Smoothed importance statistics for one tensor
#[derive(Clone, Debug)]
struct Importance {
    exp_avg_ipt: Array1<f32>,
    exp_avg_unc: Array1<f32>,
}

impl Importance {
    fn zeros(len: usize) -> Self {
        Self { exp_avg_ipt: Array1::zeros(len), exp_avg_unc: Array1::zeros(len) }
    }

    fn update(&mut self, tensor: &crate::autograd::Tensor, beta1: f32, beta2: f32) {
        if self.exp_avg_ipt.len() != tensor.len() {
            *self = Self::zeros(tensor.len());
        }
        let grad = tensor.grad().unwrap_or_else(|| Array1::zeros(tensor.len()));
        let ipt = (tensor.data() * &grad).mapv(f32::abs);
        self.exp_avg_ipt = &self.exp_avg_ipt * beta1 + &ipt * (1.0 - beta1);
        let deviation = (&ipt - &self.exp_avg_ipt).mapv(f32::abs);
        self.exp_avg_unc = &self.exp_avg_unc * beta2 + &deviation * (1.0 - beta2);
    }

    fn score(&self) -> Array1<f32> {
        &self.exp_avg_ipt * &self.exp_avg_unc
    }
}

/// Budget scheduler for one AdaLoRA adapter
#[derive(Clone, Debug)]
pub struct RankAllocator {
    schedule: AdaLoraSchedule,
    init_bgt: usize,
    target_bgt: usize,
    stats: BTreeMap<String, Importance>,
}

impl RankAllocator {
    /// `ranks` are the initial ranks of every adapted layer
    pub fn new(schedule: AdaLoraSchedule, ranks: &[usize]) -> Self {
        let init_bgt = ranks.iter().sum();
        let target_bgt = schedule.target_r * ranks.len();
        Self { schedule, init_bgt, target_bgt, stats: BTreeMap::new() }
    }

    pub fn schedule(&self) -> &AdaLoraSchedule {
        &self.schedule
    }

    pub fn init_budget(&self) -> usize {
        self.init_bgt
    }

    pub fn target_budget(&self) -> usize {
        self.target_bgt
    }

    /// Step at which the final budget is fixed
    pub fn final_step(&self) -> Result<usize> {
        let total = self.schedule.total_step.ok_or_else(|| {
            PeftError::InvalidConfig("AdaLoRA rank allocation requires total_step".into())
        })?;
        if self.schedule.tinit + self.schedule.tfinal >= total {
            return Err(PeftError::InvalidConfig(format!(
                "tinit ({}) + tfinal ({}) must be below total_step ({total})",
                self.schedule.tinit, self.schedule.tfinal
            )));
        }
        Ok(total - self.schedule.tfinal)
    }

    /// Budget at `step`, and whether masking is due
    pub fn budget_schedule(&self, step: usize) -> Result<(usize, bool)> {
        let final_step = self.final_step()?;
        let tinit = self.schedule.tinit;
        if step <= tinit {
            return Ok((self.init_bgt, false));
        }
        if step > final_step {
            return Ok((self.target_bgt, true));
        }
        let progress = (step - tinit) as f64 / (final_step - tinit) as f64;
        let mul_coeff = 1.0 - progress;
        let span = self.init_bgt.saturating_sub(self.target_bgt) as f64;
        let budget = (span * mul_coeff.powi(3)) as usize + self.target_bgt;
        Ok((budget, step % self.schedule.delta_t.max(1) == 0))
    }

    /// Fold the current gradients of one layer's factors into the statistics
    pub fn update_ipt(&mut self, path: &str, weights: &AdaLoraWeights) {
        let (beta1, beta2) = (self.schedule.beta1, self.schedule.beta2);
        for (suffix, tensor) in [("lora_A", &weights.lora_a), ("lora_E", &weights.lora_e), ("lora_B", &weights.lora_b)]
        {
            self.stats
                .entry(format!("{path}.{suffix}"))
                .or_insert_with(|| Importance::zeros(tensor.len()))
                .update(tensor, beta1, beta2);
        }
    }

    /// Per-triplet score: E entry + mean over the A row + mean over the B column
    pub fn triplet_scores(&self, path: &str, rank: usize) -> Vec<f32> {
        let score = |suffix: &str| self.stats.get(&format!("{path}.{suffix}")).map(Importance::score);
        let mut scores = vec![0.0; rank];
        if let Some(e) = score("lora_E").filter(|s| s.len() == rank) {
            scores.iter_mut().zip(e.iter()).for_each(|(s, v)| *s += v);
        }
        if let Some(a) = score("lora_A").filter(|s| rank > 0 && s.len() % rank == 0) {
            let fan_in = a.len() / rank;
            for (k, s) in scores.iter_mut().enumerate() {
                *s += a.slice(ndarray::s![k * fan_in..(k + 1) * fan_in]).mean().unwrap_or(0.0);
            }
        }
        if let Some(b) = score("lora_B").filter(|s| rank > 0 && s.len() % rank == 0) {
            let fan_out = b.len() / rank;
            for (k, s) in scores.iter_mut().enumerate() {
                let column: f32 = (0..fan_out).map(|o| b[o * rank + k]).sum();
                *s += column / fan_out.max(1) as f32;
            }
        }
        scores
    }

    /// Largest score that is masked to bring the total rank down to `budget`
    ///
    /// `None` when nothing has to go.
    pub fn mask_threshold(&self, all_scores: &[f32], budget: usize) -> Option<f32> {
        let k = self.init_bgt.saturating_sub(budget).min(all_scores.len());
        if k == 0 {
            return None;
        }
        let mut sorted = all_scores.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted[k - 1])
    }

    /// Keep masks for every layer; scores at or below the threshold are dropped
    pub fn allocate(&self, scores: &BTreeMap<String, Vec<f32>>, budget: usize) -> BTreeMap<String, Vec<bool>> {
        let all: Vec<f32> = scores.values().flatten().copied().collect();
        let threshold = self.mask_threshold(&all, budget);
        scores
            .iter()
            .map(|(path, layer_scores)| {
                let keep = layer_scores.iter().map(|s| threshold.map_or(true, |t| *s > t)).collect();
                (path.clone(), keep)
            })
            .collect()
    }

    pub fn reset_ipt(&mut self) {
        self.stats.clear();
    }
}
