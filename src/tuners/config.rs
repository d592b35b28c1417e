//! Adapter configuration
//!
//! Serializes to `adapter_config.json` next to the adapter weights.

use super::targets::{path_matches, TargetMatcher, TargetModules};
use crate::error::{PeftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File name of a saved adapter config
pub const CONFIG_NAME: &str = "adapter_config.json";

/// Adapter method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeftMethod {
    /// Low-rank additive update `ΔW = alpha/r · B·A`
    #[serde(rename = "LORA")]
    Lora,
    /// Learned rescaling vectors (IA³)
    #[serde(rename = "IA3")]
    Ia3,
    /// Low-rank update in SVD form `B·diag(E)·A` with a rank budget
    #[serde(rename = "ADALORA")]
    AdaLora,
}

impl PeftMethod {
    pub fn name(&self) -> &'static str {
        match self {
            PeftMethod::Lora => "LoRA",
            PeftMethod::Ia3 => "IA3",
            PeftMethod::AdaLora => "AdaLoRA",
        }
    }
}

/// Which biases train alongside the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    #[default]
    None,
    /// Every bias in the model
    All,
    /// Biases of adapted layers only
    LoraOnly,
}

/// Rank budget schedule for AdaLoRA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaLoraSchedule {
    /// Average rank per layer at the end of the schedule
    pub target_r: usize,
    /// Steps of warmup before pruning starts
    pub tinit: usize,
    /// Steps of final fine-tuning at the target budget
    pub tfinal: usize,
    /// Steps between budget updates
    pub delta_t: usize,
    /// EMA factor for sensitivity
    pub beta1: f32,
    /// EMA factor for uncertainty
    pub beta2: f32,
    pub orth_reg_weight: f32,
    pub total_step: Option<usize>,
}

impl Default for AdaLoraSchedule {
    fn default() -> Self {
        Self {
            target_r: 8,
            tinit: 0,
            tfinal: 0,
            delta_t: 1,
            beta1: 0.85,
            beta2: 0.85,
            orth_reg_weight: 0.5,
            total_step: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Description of one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: PeftMethod,
    /// Rank (initial rank for AdaLoRA, unused by IA³)
    pub r: usize,
    pub lora_alpha: f32,
    pub target_modules: TargetModules,
    /// Modules fully fine-tuned through a trainable copy
    #[serde(default)]
    pub modules_to_save: Vec<String>,
    /// Per-module rank override keyed by module path or module name
    #[serde(default)]
    pub rank_pattern: BTreeMap<String, usize>,
    #[serde(default)]
    pub alpha_pattern: BTreeMap<String, f32>,
    #[serde(default)]
    pub lora_dropout: f32,
    #[serde(default)]
    pub bias: BiasMode,
    /// `false` randomizes every adapter tensor so it is not a no-op
    #[serde(default = "default_true")]
    pub init_weights: bool,
    #[serde(default)]
    pub inference_mode: bool,
    /// IA³ modules whose input (rather than output) is rescaled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedforward_modules: Option<TargetModules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<AdaLoraSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    fn base(peft_type: PeftMethod, r: usize, lora_alpha: f32) -> Self {
        Self {
            peft_type,
            r,
            lora_alpha,
            target_modules: TargetModules::List(Vec::new()),
            modules_to_save: Vec::new(),
            rank_pattern: BTreeMap::new(),
            alpha_pattern: BTreeMap::new(),
            lora_dropout: 0.0,
            bias: BiasMode::None,
            init_weights: true,
            inference_mode: false,
            feedforward_modules: None,
            schedule: None,
            base_model_name_or_path: None,
        }
    }

    /// LoRA adapter with rank `r` and scale numerator `alpha`
    pub fn lora(r: usize, alpha: f32) -> Self {
        Self::base(PeftMethod::Lora, r, alpha)
    }

    /// IA³ rescaling adapter
    pub fn ia3() -> Self {
        Self::base(PeftMethod::Ia3, 1, 1.0)
    }

    /// AdaLoRA adapter starting at `init_r`, pruned towards `target_r`
    pub fn adalora(init_r: usize, target_r: usize) -> Self {
        let mut config = Self::base(PeftMethod::AdaLora, init_r, init_r as f32);
        config.schedule = Some(AdaLoraSchedule { target_r, ..AdaLoraSchedule::default() });
        config
    }

    pub fn with_targets(mut self, targets: impl Into<TargetModules>) -> Self {
        self.target_modules = targets.into();
        self
    }

    pub fn with_target_regex(mut self, pattern: impl Into<String>) -> Self {
        self.target_modules = TargetModules::regex(pattern);
        self
    }

    pub fn with_modules_to_save(mut self, modules: &[&str]) -> Self {
        self.modules_to_save = modules.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_rank_pattern(mut self, module: impl Into<String>, r: usize) -> Self {
        self.rank_pattern.insert(module.into(), r);
        self
    }

    pub fn with_alpha_pattern(mut self, module: impl Into<String>, alpha: f32) -> Self {
        self.alpha_pattern.insert(module.into(), alpha);
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.lora_dropout = dropout;
        self
    }

    pub fn with_bias(mut self, bias: BiasMode) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_init_weights(mut self, init_weights: bool) -> Self {
        self.init_weights = init_weights;
        self
    }

    pub fn with_inference_mode(mut self, inference_mode: bool) -> Self {
        self.inference_mode = inference_mode;
        self
    }

    pub fn with_feedforward_modules(mut self, modules: impl Into<TargetModules>) -> Self {
        self.feedforward_modules = Some(modules.into());
        self
    }

    pub fn with_schedule(mut self, schedule: AdaLoraSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_base_model(mut self, name: impl Into<String>) -> Self {
        self.base_model_name_or_path = Some(name.into());
        self
    }

    /// Reject configs that cannot be injected
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PeftError::InvalidConfig("r must be at least 1".into()));
        }
        // pruned AdaLoRA layers may end at rank 0
        let zero_rank = self.rank_pattern.iter().find(|(_, r)| **r == 0);
        if let (Some((module, _)), false) = (zero_rank, self.peft_type == PeftMethod::AdaLora) {
            return Err(PeftError::InvalidConfig(format!("rank_pattern['{module}'] must be >= 1")));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(PeftError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if self.feedforward_modules.is_some() && self.peft_type != PeftMethod::Ia3 {
            return Err(PeftError::InvalidConfig(
                "feedforward_modules only applies to IA3".into(),
            ));
        }
        if self.peft_type == PeftMethod::AdaLora {
            let schedule = self.schedule.as_ref().ok_or_else(|| {
                PeftError::InvalidConfig("AdaLoRA requires a rank schedule".into())
            })?;
            if schedule.delta_t == 0 {
                return Err(PeftError::InvalidConfig("delta_t must be at least 1".into()));
            }
        }
        TargetMatcher::new(&self.target_modules)?;
        if let Some(feedforward) = &self.feedforward_modules {
            TargetMatcher::new(feedforward)?;
        }
        Ok(())
    }

    /// Rank for the module at `path`: exact path key, else exact module-name key
    pub fn rank_for(&self, path: &str) -> usize {
        lookup_pattern(&self.rank_pattern, path).copied().unwrap_or(self.r)
    }

    pub fn alpha_for(&self, path: &str) -> f32 {
        lookup_pattern(&self.alpha_pattern, path).copied().unwrap_or(self.lora_alpha)
    }

    /// Whether `path` is listed in `modules_to_save`
    pub fn saves_module(&self, path: &str) -> bool {
        self.modules_to_save.iter().any(|name| path_matches(path, name))
    }

    pub fn is_feedforward(&self, path: &str) -> Result<bool> {
        match &self.feedforward_modules {
            Some(targets) => Ok(TargetMatcher::new(targets)?.is_match(path)),
            None => Ok(false),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write `adapter_config.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CONFIG_NAME), self.to_json()?)?;
        Ok(())
    }

    /// Read `adapter_config.json` from `dir`
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(dir.as_ref().join(CONFIG_NAME))?;
        Self::from_json(&json)
    }
}

fn lookup_pattern<'a, V>(pattern: &'a BTreeMap<String, V>, path: &str) -> Option<&'a V> {
    pattern.get(path).or_else(|| {
        let name = path.rsplit('.').next().unwrap_or(path);
        pattern.get(name)
    })
}
