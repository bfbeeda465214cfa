use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::config::{CorrectionParams, OutputBounds, RuleTier};
use crate::engine::features::{tail, SliceStats};
use crate::engine::types::{Difficulty, OutcomeRecord, Prediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionRegime {
    NoHistory,
    EarlyLearning,
    RuleAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedPrediction {
    pub prediction: Prediction,
    pub regime: CorrectionRegime,
}

/// Adjusts raw model output so it follows the direction of recent observed performance.
pub struct AdaptiveCorrector<'a> {
    params: &'a CorrectionParams,
    bounds: &'a OutputBounds,
}

impl<'a> AdaptiveCorrector<'a> {
    pub fn new(params: &'a CorrectionParams, bounds: &'a OutputBounds) -> Self {
        Self { params, bounds }
    }

    /// `topic_history` is the user's chronological history on the target topic.
    pub fn regime(&self, topic_history: &[&OutcomeRecord], slice_len: usize) -> CorrectionRegime {
        if topic_history.len() < self.params.min_history || slice_len == 0 {
            CorrectionRegime::NoHistory
        } else if slice_len < self.params.mature_history {
            CorrectionRegime::EarlyLearning
        } else {
            CorrectionRegime::RuleAdjustment
        }
    }

    pub fn apply(
        &self,
        raw: Prediction,
        topic_history: &[&OutcomeRecord],
        difficulty: Difficulty,
    ) -> CorrectedPrediction {
        let slice: Vec<&OutcomeRecord> = topic_history
            .iter()
            .copied()
            .filter(|r| r.difficulty == difficulty)
            .collect();
        let regime = self.regime(topic_history, slice.len());

        let adjusted = match regime {
            CorrectionRegime::NoHistory => raw,
            CorrectionRegime::EarlyLearning => self.early_learning(&slice),
            CorrectionRegime::RuleAdjustment => self.rule_adjustment(raw, &slice),
        };

        debug!(
            regime = ?regime,
            difficulty = difficulty.as_str(),
            slice_len = slice.len(),
            raw_p = raw.probability,
            adjusted_p = adjusted.probability,
            "correction applied"
        );

        CorrectedPrediction {
            prediction: adjusted.clamped(self.bounds),
            regime,
        }
    }

    fn early_learning(&self, slice: &[&OutcomeRecord]) -> Prediction {
        let recent = SliceStats::from_records(tail(slice, self.params.recent_window).iter().copied());
        let probability = self
            .params
            .early_ladder
            .iter()
            .find(|step| recent.success_rate >= step.min_success - 1e-9)
            .map(|step| step.probability)
            .unwrap_or(self.bounds.neutral_probability);
        Prediction::new(probability, recent.avg_time * self.params.early_time_factor)
    }

    fn rule_adjustment(&self, raw: Prediction, slice: &[&OutcomeRecord]) -> Prediction {
        let overall = SliceStats::from_records(slice.iter().copied());
        let recent = SliceStats::from_records(tail(slice, self.params.recent_window).iter().copied());
        let improvement = recent.success_rate - overall.success_rate;

        let mut probability = raw.probability;
        if let Some(tier) = first_tier(&self.params.boost_tiers, |t| {
            recent.success_rate >= t.recent && improvement >= t.improvement
        }) {
            if probability < self.params.boost_cap {
                probability = (probability * tier.factor).min(self.params.boost_cap);
            }
        } else if let Some(tier) = first_tier(&self.params.reduction_tiers, |t| {
            recent.success_rate <= t.recent && improvement <= t.improvement
        }) {
            if probability > self.params.reduction_floor {
                probability = (probability * tier.factor).max(self.params.reduction_floor);
            }
        }

        if slice.len() >= self.params.consistency_history {
            let margin = self.params.consistency_margin;
            if overall.success_rate > 0.5 {
                probability = probability.max(overall.success_rate - margin);
            } else if overall.success_rate < 0.5 {
                probability = probability.min(overall.success_rate + margin);
            }
        }

        let mut seconds = raw.seconds;
        if overall.avg_time > 0.0 {
            let time_improvement = (overall.avg_time - recent.avg_time) / overall.avg_time;
            let multiplier = self
                .params
                .time_tiers
                .iter()
                .find(|(threshold, _)| {
                    (*threshold > 0.0 && time_improvement >= *threshold)
                        || (*threshold < 0.0 && time_improvement <= *threshold)
                })
                .map(|(_, m)| *m)
                .unwrap_or(1.0);
            seconds *= multiplier;
        }

        Prediction::new(probability, seconds)
    }
}

fn first_tier<F>(tiers: &[RuleTier], matches: F) -> Option<&RuleTier>
where
    F: Fn(&RuleTier) -> bool,
{
    tiers.iter().find(|t| matches(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(difficulty: Difficulty, correct: bool, seconds: f64) -> OutcomeRecord {
        OutcomeRecord::new("u1", "algebra", difficulty, correct, seconds)
    }

    fn corrector_apply(records: &[OutcomeRecord], raw: Prediction, difficulty: Difficulty) -> CorrectedPrediction {
        let params = CorrectionParams::default();
        let bounds = OutputBounds::default();
        let refs: Vec<&OutcomeRecord> = records.iter().collect();
        AdaptiveCorrector::new(&params, &bounds).apply(raw, &refs, difficulty)
    }

    #[test]
    fn test_short_history_passes_raw_through() {
        let records = vec![rec(Difficulty::Easy, true, 30.0), rec(Difficulty::Easy, true, 30.0)];
        let out = corrector_apply(&records, Prediction::new(0.42, 77.0), Difficulty::Easy);
        assert_eq!(out.regime, CorrectionRegime::NoHistory);
        assert_eq!(out.prediction, Prediction::new(0.42, 77.0));
    }

    #[test]
    fn test_single_failure_lands_low_on_ladder() {
        let records = vec![
            rec(Difficulty::Easy, true, 30.0),
            rec(Difficulty::Easy, true, 30.0),
            rec(Difficulty::Medium, false, 45.0),
        ];
        let out = corrector_apply(&records, Prediction::new(0.5, 60.0), Difficulty::Medium);
        assert_eq!(out.regime, CorrectionRegime::EarlyLearning);
        assert!((out.prediction.probability - 0.15).abs() < 1e-12);
        assert!((out.prediction.seconds - 47.25).abs() < 1e-9);

        let easy = corrector_apply(&records, Prediction::new(0.5, 60.0), Difficulty::Easy);
        assert!((easy.prediction.probability - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_empty_slice_is_no_history() {
        let records = vec![rec(Difficulty::Easy, true, 30.0); 4];
        let out = corrector_apply(&records, Prediction::new(0.3, 90.0), Difficulty::Hard);
        assert_eq!(out.regime, CorrectionRegime::NoHistory);
    }

    #[test]
    fn test_ladder_steps() {
        let mut records = vec![rec(Difficulty::Easy, false, 20.0); 2];
        records.extend(vec![rec(Difficulty::Easy, true, 20.0); 3]);
        let out = corrector_apply(&records, Prediction::new(0.5, 60.0), Difficulty::Easy);
        assert!((out.prediction.probability - 0.65).abs() < 1e-12);
    }

    #[test]
    fn test_improving_mature_history_boosts() {
        let mut records = vec![rec(Difficulty::Medium, false, 60.0); 10];
        records.extend(vec![rec(Difficulty::Medium, true, 40.0); 5]);
        let out = corrector_apply(&records, Prediction::new(0.5, 60.0), Difficulty::Medium);
        assert_eq!(out.regime, CorrectionRegime::RuleAdjustment);
        assert!((out.prediction.probability - 0.575).abs() < 1e-12);
        // recent is faster than overall by more than 20%
        assert!((out.prediction.seconds - 54.0).abs() < 1e-9);
    }

    #[test]
    fn test_declining_mature_history_reduces() {
        let mut records = vec![rec(Difficulty::Hard, true, 30.0); 10];
        records.extend(vec![rec(Difficulty::Hard, false, 60.0); 5]);
        let out = corrector_apply(&records, Prediction::new(0.9, 30.0), Difficulty::Hard);
        // 0.9 * 0.85 = 0.765, then the consistency guard keeps it at or above 0.667 - 0.25
        assert!((out.prediction.probability - 0.765).abs() < 1e-12);
        assert!(out.prediction.seconds > 30.0);
    }

    #[test]
    fn test_consistency_guard_pulls_back_extremes() {
        let records: Vec<OutcomeRecord> = (0..20)
            .map(|i| rec(Difficulty::Easy, i % 5 != 0, 30.0))
            .collect();
        let out = corrector_apply(&records, Prediction::new(0.05, 30.0), Difficulty::Easy);
        assert!((out.prediction.probability - 0.55).abs() < 1e-12);
    }

    #[test]
    fn test_output_is_clamped() {
        let records = vec![rec(Difficulty::Easy, true, 1.0); 4];
        let out = corrector_apply(&records, Prediction::new(0.5, 60.0), Difficulty::Easy);
        assert_eq!(out.prediction.seconds, 5.0);
    }
}
