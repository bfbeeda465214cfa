use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::config::OutputBounds;

/// Offset applied before taking `ln` of a response time so near-zero times stay finite.
pub const LOG_TIME_OFFSET: f64 = 0.1;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    /// Ordinal level, 1 (easy) to 3 (hard).
    pub fn level(&self) -> u8 {
        match self {
            Self::Easy => 1,
            Self::Medium => 2,
            Self::Hard => 3,
        }
    }

    pub fn index(&self) -> usize {
        self.level() as usize - 1
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Self::Easy),
            2 => Some(Self::Medium),
            3 => Some(Self::Hard),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" | "1" => Some(Self::Easy),
            "medium" | "mid" | "2" => Some(Self::Medium),
            "hard" | "3" => Some(Self::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub user_id: String,
    pub topic: String,
    pub difficulty: Difficulty,
    pub correct: bool,
    pub response_time: f64,
    pub predicted_correct: Option<f64>,
    pub predicted_time: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn new(
        user_id: impl Into<String>,
        topic: impl Into<String>,
        difficulty: Difficulty,
        correct: bool,
        response_time: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            topic: topic.into(),
            difficulty,
            correct,
            response_time,
            predicted_correct: None,
            predicted_time: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_prediction(mut self, predicted_correct: f64, predicted_time: f64) -> Self {
        self.predicted_correct = Some(predicted_correct);
        self.predicted_time = Some(predicted_time);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn correct_value(&self) -> f64 {
        if self.correct {
            1.0
        } else {
            0.0
        }
    }

    pub fn log_time(&self) -> f64 {
        (self.response_time.max(0.0) + LOG_TIME_OFFSET).ln()
    }

    pub fn has_prediction(&self) -> bool {
        self.predicted_correct.is_some() && self.predicted_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub probability: f64,
    pub seconds: f64,
}

impl Prediction {
    pub fn new(probability: f64, seconds: f64) -> Self {
        Self { probability, seconds }
    }

    pub fn neutral(bounds: &OutputBounds) -> Self {
        Self::new(bounds.neutral_probability, bounds.neutral_seconds)
    }

    pub fn clamped(self, bounds: &OutputBounds) -> Self {
        let probability = if self.probability.is_finite() {
            bounds.probability.clamp(self.probability)
        } else {
            bounds.neutral_probability
        };
        let seconds = if self.seconds.is_finite() {
            bounds.seconds.clamp(self.seconds)
        } else {
            bounds.neutral_seconds
        };
        Self { probability, seconds }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    UnknownUser,
    UnknownTopic,
    UnknownDifficulty,
    NotTrained,
    NoTopicModel,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownUser => "unknown_user",
            Self::UnknownTopic => "unknown_topic",
            Self::UnknownDifficulty => "unknown_difficulty",
            Self::NotTrained => "not_trained",
            Self::NoTopicModel => "no_topic_model",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictorOutcome {
    Available(Prediction),
    Unavailable(UnavailableReason),
}

impl PredictorOutcome {
    pub fn prediction(self) -> Option<Prediction> {
        match self {
            Self::Available(prediction) => Some(prediction),
            Self::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMode {
    Sync,
    Async,
}

impl TrainingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "inline" => Some(Self::Sync),
            "async" | "background" => Some(Self::Async),
            _ => None,
        }
    }
}

/// Persisted retraining counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    pub last_trained_at: Option<DateTime<Utc>>,
    pub n_samples_at_last_training: i64,
    pub n_samples_since_training: i64,
    pub threshold: i64,
}

impl TrackerState {
    pub fn new(threshold: i64) -> Self {
        Self {
            last_trained_at: None,
            n_samples_at_last_training: 0,
            n_samples_since_training: 0,
            threshold,
        }
    }

    pub fn phase(&self) -> TriggerPhase {
        if self.n_samples_since_training >= self.threshold {
            TriggerPhase::ThresholdReached
        } else {
            TriggerPhase::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    Idle,
    ThresholdReached,
    Training,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingReport {
    Completed {
        run_id: String,
        topics_trained: Vec<String>,
        n_samples: usize,
        repaired_taus: usize,
        embedding_trained: bool,
        duration_ms: u64,
    },
    InsufficientData {
        available: usize,
        required: usize,
    },
    AlreadyRunning,
}

impl TrainingReport {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserParameters {
    pub theta: f64,
    pub tau: f64,
    pub is_personalized: bool,
}
