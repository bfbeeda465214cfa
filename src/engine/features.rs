use serde::{Deserialize, Serialize};

use crate::engine::types::{Difficulty, OutcomeRecord};

pub const FEATURE_COUNT: usize = 13;

/// Normalized values are clipped to this many standard deviations.
pub const NORMALIZED_LIMIT: f64 = 5.0;
/// Below this variance a column is treated as constant and only centered.
const MIN_VARIANCE: f64 = 1e-4;

const DEFAULT_SUCCESS: f64 = 0.5;
const DEFAULT_SECONDS: f64 = 60.0;

/// Success rate and timing of a slice of history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceStats {
    pub n: usize,
    pub success_rate: f64,
    pub avg_time: f64,
}

impl SliceStats {
    pub fn from_records<'r, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'r OutcomeRecord>,
    {
        let mut n = 0usize;
        let mut correct = 0.0;
        let mut time = 0.0;
        for record in records {
            n += 1;
            correct += record.correct_value();
            time += record.response_time;
        }
        if n == 0 {
            return Self::empty();
        }
        Self {
            n,
            success_rate: correct / n as f64,
            avg_time: time / n as f64,
        }
    }

    pub fn empty() -> Self {
        Self {
            n: 0,
            success_rate: DEFAULT_SUCCESS,
            avg_time: DEFAULT_SECONDS,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn log_time(&self) -> f64 {
        (self.avg_time + 1.0).ln()
    }

    fn log_count(&self) -> f64 {
        (1.0 + self.n as f64).ln()
    }
}

/// The last `window` records of a chronological slice.
pub fn tail<'a, T>(records: &'a [T], window: usize) -> &'a [T] {
    &records[records.len().saturating_sub(window)..]
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureBuilder {
    pub recent_window: usize,
    pub improvement_window: usize,
}

impl FeatureBuilder {
    pub fn new(recent_window: usize, improvement_window: usize) -> Self {
        Self {
            recent_window,
            improvement_window,
        }
    }

    /// Features for predicting the next task at `(topic, difficulty)` given a user's
    /// chronological history.
    pub fn build(
        &self,
        history: &[&OutcomeRecord],
        topic: &str,
        difficulty: Difficulty,
    ) -> [f64; FEATURE_COUNT] {
        let overall = SliceStats::from_records(history.iter().copied());
        let by_topic = SliceStats::from_records(history.iter().copied().filter(|r| r.topic == topic));
        let by_difficulty =
            SliceStats::from_records(history.iter().copied().filter(|r| r.difficulty == difficulty));
        let recent = SliceStats::from_records(tail(history, self.recent_window).iter().copied());

        let (success_improvement, time_improvement) = if history.len() >= self.improvement_window {
            let end = history.len().saturating_sub(self.recent_window);
            let start = history.len().saturating_sub(self.improvement_window).min(end);
            let previous = SliceStats::from_records(history[start..end].iter().copied());
            (
                recent.success_rate - previous.success_rate,
                previous.log_time() - recent.log_time(),
            )
        } else {
            (0.0, 0.0)
        };

        [
            overall.success_rate,
            overall.log_time(),
            overall.log_count(),
            by_topic.success_rate,
            by_topic.log_time(),
            by_topic.log_count(),
            by_difficulty.success_rate,
            by_difficulty.log_time(),
            by_difficulty.log_count(),
            recent.success_rate,
            recent.log_time(),
            success_improvement,
            time_improvement,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStat {
    pub mean: f64,
    pub std_dev: f64,
}

impl Default for NormalizationStat {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std_dev: 1.0,
        }
    }
}

impl NormalizationStat {
    pub fn fit(values: impl Iterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.collect();
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = if var.is_finite() && var >= MIN_VARIANCE {
            var.sqrt()
        } else {
            1.0
        };
        Self { mean, std_dev }
    }

    pub fn is_valid(&self) -> bool {
        self.mean.is_finite() && self.std_dev.is_finite() && self.std_dev > 0.0
    }

    /// Standardizes and clips to `±NORMALIZED_LIMIT`.
    pub fn apply(&self, value: f64) -> f64 {
        ((value - self.mean) / self.std_dev).clamp(-NORMALIZED_LIMIT, NORMALIZED_LIMIT)
    }

    pub fn invert(&self, value: f64) -> f64 {
        value * self.std_dev + self.mean
    }
}

pub fn fit_normalizers(rows: &[[f64; FEATURE_COUNT]]) -> Vec<NormalizationStat> {
    (0..FEATURE_COUNT)
        .map(|j| NormalizationStat::fit(rows.iter().map(|row| row[j])))
        .collect()
}

pub fn normalize(row: &[f64; FEATURE_COUNT], stats: &[NormalizationStat]) -> Vec<f64> {
    row.iter()
        .zip(stats)
        .map(|(value, stat)| stat.apply(*value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(topic: &str, difficulty: Difficulty, correct: bool, seconds: f64) -> OutcomeRecord {
        OutcomeRecord::new("u1", topic, difficulty, correct, seconds)
    }

    #[test]
    fn test_empty_history_uses_defaults() {
        let builder = FeatureBuilder::new(5, 10);
        let features = builder.build(&[], "algebra", Difficulty::Easy);
        assert_eq!(features[0], 0.5);
        assert_eq!(features[2], 0.0);
        assert_eq!(features[11], 0.0);
        assert_eq!(features[12], 0.0);
    }

    #[test]
    fn test_topic_and_difficulty_filters() {
        let records = vec![
            rec("algebra", Difficulty::Easy, true, 10.0),
            rec("algebra", Difficulty::Hard, false, 50.0),
            rec("geometry", Difficulty::Easy, false, 30.0),
        ];
        let refs: Vec<&OutcomeRecord> = records.iter().collect();
        let features = FeatureBuilder::new(5, 10).build(&refs, "algebra", Difficulty::Easy);
        assert!((features[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((features[3] - 0.5).abs() < 1e-12);
        assert!((features[6] - 0.5).abs() < 1e-12);
        assert!((features[5] - 3.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_improvement_needs_ten_records() {
        let mut records: Vec<OutcomeRecord> =
            (0..5).map(|_| rec("algebra", Difficulty::Easy, false, 60.0)).collect();
        records.extend((0..4).map(|_| rec("algebra", Difficulty::Easy, true, 20.0)));
        let refs: Vec<&OutcomeRecord> = records.iter().collect();
        let builder = FeatureBuilder::new(5, 10);
        assert_eq!(builder.build(&refs, "algebra", Difficulty::Easy)[11], 0.0);

        records.push(rec("algebra", Difficulty::Easy, true, 20.0));
        let refs: Vec<&OutcomeRecord> = records.iter().collect();
        let features = builder.build(&refs, "algebra", Difficulty::Easy);
        assert!((features[11] - 1.0).abs() < 1e-12);
        assert!(features[12] > 0.0);
    }

    #[test]
    fn test_normalization_stat() {
        let stat = NormalizationStat::fit([1.0, 3.0].into_iter());
        assert_eq!(stat.mean, 2.0);
        assert!((stat.std_dev - 1.0).abs() < 1e-12);
        assert!((stat.invert(stat.apply(3.5)) - 3.5).abs() < 1e-12);
        assert_eq!(stat.apply(40.0), NORMALIZED_LIMIT);
        assert_eq!(stat.apply(-40.0), -NORMALIZED_LIMIT);
    }

    #[test]
    fn test_constant_column_keeps_unit_scale() {
        let log_sixty = 61.0f64.ln();
        let stat = NormalizationStat::fit(std::iter::repeat(log_sixty).take(50));
        assert_eq!(stat.std_dev, 1.0);
        assert!(stat.is_valid());

        // A 5s recent time against a constant 60s column stays a modest input.
        let shifted = stat.apply(6.0f64.ln());
        assert!(shifted > -3.0 && shifted < 0.0, "got {shifted}");

        let nearly_constant = NormalizationStat::fit([2.0, 2.0 + 1e-4].into_iter());
        assert_eq!(nearly_constant.std_dev, 1.0);
    }

    #[test]
    fn test_tail() {
        let values = [1, 2, 3, 4, 5, 6, 7];
        assert_eq!(tail(&values, 5), &[3, 4, 5, 6, 7]);
        assert_eq!(tail(&values, 10), &values);
    }
}
