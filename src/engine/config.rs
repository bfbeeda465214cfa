use serde::{Deserialize, Serialize};

use crate::engine::types::TrainingMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return (self.min + self.max) / 2.0;
        }
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterBounds {
    pub discrimination: Bounds,
    pub difficulty: Bounds,
    pub time_intensity: Bounds,
    pub theta: Bounds,
    pub tau: Bounds,
    pub sigma: Bounds,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            discrimination: Bounds::new(0.5, 3.0),
            difficulty: Bounds::new(-3.0, 3.0),
            time_intensity: Bounds::new(2.0, 6.0),
            theta: Bounds::new(-3.0, 3.0),
            tau: Bounds::new(0.0, 4.0),
            sigma: Bounds::new(0.1, 3.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerParams {
    pub em_rounds: usize,
    pub max_iterations: usize,
    pub min_training_samples: usize,
    /// L2 strength on parameter deltas, scaled by `l2_pivot / (l2_pivot + n)`.
    pub l2_strength: f64,
    pub l2_pivot: f64,
    /// EMA weight on the fresh estimate is `n / (n + ema_pivot)` clamped to `[ema_min, ema_max]`.
    pub ema_pivot: f64,
    pub ema_min: f64,
    pub ema_max: f64,
    pub correctness_bias_threshold: f64,
    pub time_bias_threshold: f64,
    pub correctness_nudge: f64,
    pub time_nudge: f64,
    pub fallback_blend: f64,
    pub direction_penalty: f64,
    pub min_error_aware_samples: usize,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            em_rounds: 5,
            max_iterations: 50,
            min_training_samples: 10,
            l2_strength: 0.5,
            l2_pivot: 20.0,
            ema_pivot: 10.0,
            ema_min: 0.3,
            ema_max: 0.9,
            correctness_bias_threshold: 0.15,
            time_bias_threshold: 0.25,
            correctness_nudge: 0.5,
            time_nudge: 0.3,
            fallback_blend: 0.7,
            direction_penalty: 2.0,
            min_error_aware_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingParams {
    pub enabled: bool,
    pub user_dim: usize,
    pub topic_dim: usize,
    pub difficulty_dim: usize,
    pub hidden_dim: usize,
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub validation_fraction: f64,
    pub patience: usize,
    pub min_samples: usize,
    pub time_loss_weight: f64,
    pub recent_window: usize,
    pub improvement_window: usize,
    pub seed: u64,
    /// Weight of a retrained model's output when it replaces a previously served one.
    pub anchor_blend: f64,
    /// Largest probability move, per retrain and per lookup, away from the anchored output.
    pub max_probability_shift: f64,
    /// Largest relative time move, per retrain and per lookup, away from the anchored output.
    pub max_time_shift: f64,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            enabled: true,
            user_dim: 8,
            topic_dim: 4,
            difficulty_dim: 2,
            hidden_dim: 16,
            learning_rate: 0.05,
            max_epochs: 60,
            batch_size: 8,
            validation_fraction: 0.2,
            patience: 5,
            min_samples: 30,
            time_loss_weight: 0.5,
            recent_window: 5,
            improvement_window: 10,
            seed: 42,
            anchor_blend: 0.5,
            max_probability_shift: 0.05,
            max_time_shift: 0.10,
        }
    }
}

/// Success-rate to probability mapping used while a slice is still young.
/// Steps are checked top-down; the first `min_success` that the recent rate reaches wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderStep {
    pub min_success: f64,
    pub probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTier {
    pub recent: f64,
    pub improvement: f64,
    pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionParams {
    pub min_history: usize,
    pub mature_history: usize,
    pub recent_window: usize,
    pub early_ladder: Vec<LadderStep>,
    pub early_time_factor: f64,
    /// Boost tiers, strongest first. Applied when both recent and improvement are at or above the tier.
    pub boost_tiers: Vec<RuleTier>,
    /// Reduction tiers, strongest first. Applied when both are at or below the tier.
    pub reduction_tiers: Vec<RuleTier>,
    pub boost_cap: f64,
    pub reduction_floor: f64,
    pub time_tiers: Vec<(f64, f64)>,
    pub consistency_history: usize,
    pub consistency_margin: f64,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        Self {
            min_history: 3,
            mature_history: 10,
            recent_window: 5,
            early_ladder: vec![
                LadderStep { min_success: 1.0, probability: 0.85 },
                LadderStep { min_success: 0.8, probability: 0.75 },
                LadderStep { min_success: 0.6, probability: 0.65 },
                LadderStep { min_success: 0.4, probability: 0.50 },
                LadderStep { min_success: 0.2, probability: 0.35 },
                LadderStep { min_success: 0.0, probability: 0.15 },
            ],
            early_time_factor: 1.05,
            boost_tiers: vec![
                RuleTier { recent: 0.8, improvement: 0.2, factor: 1.15 },
                RuleTier { recent: 0.8, improvement: 0.0, factor: 1.08 },
                RuleTier { recent: 0.6, improvement: 0.1, factor: 1.05 },
            ],
            reduction_tiers: vec![
                RuleTier { recent: 0.3, improvement: -0.2, factor: 0.85 },
                RuleTier { recent: 0.3, improvement: 0.0, factor: 0.92 },
                RuleTier { recent: 0.4, improvement: -0.1, factor: 0.95 },
            ],
            boost_cap: 0.95,
            reduction_floor: 0.05,
            // (relative time improvement, multiplier); positive improvement means faster.
            time_tiers: vec![(0.2, 0.90), (0.1, 0.95), (-0.2, 1.10), (-0.1, 1.05)],
            consistency_history: 10,
            consistency_margin: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub threshold: i64,
    pub mode: TrainingMode,
    pub force_min_samples: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            mode: TrainingMode::Async,
            force_min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBounds {
    pub probability: Bounds,
    pub seconds: Bounds,
    pub neutral_probability: f64,
    pub neutral_seconds: f64,
}

impl Default for OutputBounds {
    fn default() -> Self {
        Self {
            probability: Bounds::new(0.01, 0.99),
            seconds: Bounds::new(5.0, 600.0),
            neutral_probability: 0.5,
            neutral_seconds: 60.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bounds: ParameterBounds,
    pub trainer: TrainerParams,
    pub embedding: EmbeddingParams,
    pub correction: CorrectionParams,
    pub trigger: TriggerConfig,
    pub output: OutputBounds,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ENGINE_TRAINING_THRESHOLD") {
            config.trigger.threshold = val.parse().unwrap_or(config.trigger.threshold);
        }
        if let Ok(val) = std::env::var("ENGINE_TRAINING_MODE") {
            config.trigger.mode = TrainingMode::parse(&val).unwrap_or(config.trigger.mode);
        }
        if let Ok(val) = std::env::var("ENGINE_EMBEDDING_ENABLED") {
            config.embedding.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("ENGINE_MIN_TRAINING_SAMPLES") {
            config.trainer.min_training_samples =
                val.parse().unwrap_or(config.trainer.min_training_samples);
        }
        if let Ok(val) = std::env::var("ENGINE_EM_ROUNDS") {
            config.trainer.em_rounds = val.parse().unwrap_or(config.trainer.em_rounds);
        }

        config
    }
}
