use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::config::EngineConfig;
use crate::engine::embedding::EmbeddingModel;
use crate::engine::likelihood::{expected_seconds, p_correct};
use crate::engine::parameters::ParameterStore;
use crate::engine::types::{
    Difficulty, OutcomeRecord, Prediction, PredictorOutcome, UnavailableReason,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorSource {
    Embedding,
    Psychometric,
    Default,
}

impl PredictorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Psychometric => "psychometric",
            Self::Default => "default",
        }
    }
}

pub struct PredictionContext<'a> {
    pub user_id: &'a str,
    pub topic: &'a str,
    pub difficulty: Difficulty,
    /// The user's full chronological history across topics.
    pub history: &'a [&'a OutcomeRecord],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcedPrediction {
    pub prediction: Prediction,
    pub source: PredictorSource,
}

/// 2PL correctness with the log-normal median time, from the topic's stored parameters.
/// Users without personal parameters get the topic's population mean.
pub fn psychometric_lookup(
    store: &ParameterStore,
    config: &EngineConfig,
    ctx: &PredictionContext<'_>,
) -> PredictorOutcome {
    let Some(model) = store.get(ctx.topic) else {
        return PredictorOutcome::Unavailable(UnavailableReason::NoTopicModel);
    };
    let user = model.user_parameters(ctx.user_id);
    let item = model.items.get(ctx.difficulty);
    let probability = p_correct(user.theta, item.a, item.b);
    let seconds = expected_seconds(user.tau, item.beta);
    PredictorOutcome::Available(Prediction::new(probability, seconds).clamped(&config.output))
}

/// Ordered predictors, tried until one is available.
pub struct PredictorChain<'a> {
    sources: Vec<PredictorSource>,
    store: &'a ParameterStore,
    embedding: Option<&'a EmbeddingModel>,
    config: &'a EngineConfig,
}

impl<'a> PredictorChain<'a> {
    pub fn new(
        store: &'a ParameterStore,
        embedding: Option<&'a EmbeddingModel>,
        config: &'a EngineConfig,
    ) -> Self {
        let mut sources = Vec::with_capacity(2);
        if config.embedding.enabled {
            sources.push(PredictorSource::Embedding);
        }
        sources.push(PredictorSource::Psychometric);
        Self {
            sources,
            store,
            embedding,
            config,
        }
    }

    pub fn sources(&self) -> &[PredictorSource] {
        &self.sources
    }

    fn lookup(&self, source: PredictorSource, ctx: &PredictionContext<'_>) -> PredictorOutcome {
        match source {
            PredictorSource::Embedding => match self.embedding {
                Some(model) if model.n_samples >= self.config.embedding.min_samples => model.lookup(
                    &self.config.embedding,
                    &self.config.output,
                    ctx.user_id,
                    ctx.topic,
                    ctx.difficulty,
                    ctx.history,
                ),
                _ => PredictorOutcome::Unavailable(UnavailableReason::NotTrained),
            },
            PredictorSource::Psychometric => psychometric_lookup(self.store, self.config, ctx),
            PredictorSource::Default => {
                PredictorOutcome::Available(Prediction::neutral(&self.config.output))
            }
        }
    }

    pub fn predict(&self, ctx: &PredictionContext<'_>) -> SourcedPrediction {
        for &source in &self.sources {
            match self.lookup(source, ctx) {
                PredictorOutcome::Available(prediction) => {
                    return SourcedPrediction { prediction, source };
                }
                PredictorOutcome::Unavailable(reason) => {
                    debug!(
                        user_id = %ctx.user_id,
                        topic = %ctx.topic,
                        source = source.as_str(),
                        reason = reason.as_str(),
                        "predictor unavailable, falling through"
                    );
                }
            }
        }
        SourcedPrediction {
            prediction: Prediction::neutral(&self.config.output),
            source: PredictorSource::Default,
        }
    }
}

/// Weight of a level the user has no history on, relative to one observed outcome.
pub const UNOBSERVED_LEVEL_WEIGHT: f64 = 0.01;

/// Pooling weight per difficulty level: the number of the user's outcomes on that level.
pub fn level_weights(slice_lens: [usize; 3]) -> [f64; 3] {
    slice_lens.map(|n| if n == 0 { UNOBSERVED_LEVEL_WEIGHT } else { n as f64 })
}

/// Pools adjacent violators so probabilities are non-increasing from easy to hard.
/// A pooled block takes the weighted mean of its members. Times are left as they are.
pub fn enforce_difficulty_order(predictions: &mut [Prediction; 3], weights: [f64; 3]) {
    // (weighted sum, total weight, members) blocks
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(3);
    for (p, &w) in predictions.iter().zip(&weights) {
        let w = if w.is_finite() && w > 0.0 { w } else { UNOBSERVED_LEVEL_WEIGHT };
        blocks.push((p.probability * w, w, 1));
        while blocks.len() >= 2 {
            let (s_last, w_last, n_last) = blocks[blocks.len() - 1];
            let (s_prev, w_prev, n_prev) = blocks[blocks.len() - 2];
            if s_prev / w_prev >= s_last / w_last {
                break;
            }
            blocks.pop();
            let merged = blocks.len() - 1;
            blocks[merged] = (s_prev + s_last, w_prev + w_last, n_prev + n_last);
        }
    }

    let mut i = 0;
    for (sum, weight, members) in blocks {
        let mean = sum / weight;
        for _ in 0..members {
            predictions[i].probability = mean;
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parameters::{TopicModel, UserAbilitySpeed};

    fn ctx<'a>(user_id: &'a str, topic: &'a str, difficulty: Difficulty) -> PredictionContext<'a> {
        PredictionContext {
            user_id,
            topic,
            difficulty,
            history: &[],
        }
    }

    #[test]
    fn test_empty_chain_falls_back_to_neutral() {
        let store = ParameterStore::new();
        let config = EngineConfig::default();
        let chain = PredictorChain::new(&store, None, &config);
        let out = chain.predict(&ctx("u1", "Calculus", Difficulty::Medium));
        assert_eq!(out.source, PredictorSource::Default);
        assert_eq!(out.prediction, Prediction::new(0.5, 60.0));
    }

    #[test]
    fn test_psychometric_uses_population_mean_for_unknown_user() {
        let store = ParameterStore::new();
        let mut model = TopicModel::new("algebra");
        model.users.insert("u1".into(), UserAbilitySpeed::new(1.0, 0.5, 20));
        model.users.insert("u2".into(), UserAbilitySpeed::new(-1.0, 0.5, 20));
        store.insert(model);
        let config = EngineConfig::default();
        let chain = PredictorChain::new(&store, None, &config);

        let out = chain.predict(&ctx("stranger", "algebra", Difficulty::Medium));
        assert_eq!(out.source, PredictorSource::Psychometric);
        assert!((out.prediction.probability - 0.5).abs() < 1e-12);
        let expected = (4.0f64 - 0.5).exp() - 0.1;
        assert!((out.prediction.seconds - expected).abs() < 1e-9);

        let known = chain.predict(&ctx("u1", "algebra", Difficulty::Easy));
        assert!(known.prediction.probability > 0.85);
    }

    #[test]
    fn test_disabled_embedding_is_skipped() {
        let store = ParameterStore::new();
        let mut config = EngineConfig::default();
        config.embedding.enabled = false;
        let chain = PredictorChain::new(&store, None, &config);
        assert_eq!(chain.sources(), &[PredictorSource::Psychometric]);
    }

    #[test]
    fn test_difficulty_order_pools_violators() {
        let mut preds = [
            Prediction::new(0.4, 30.0),
            Prediction::new(0.6, 40.0),
            Prediction::new(0.2, 50.0),
        ];
        enforce_difficulty_order(&mut preds, [1.0; 3]);
        assert!((preds[0].probability - 0.5).abs() < 1e-12);
        assert!((preds[1].probability - 0.5).abs() < 1e-12);
        assert_eq!(preds[2].probability, 0.2);
        assert_eq!(preds[1].seconds, 40.0);

        let mut increasing = [
            Prediction::new(0.1, 1.0),
            Prediction::new(0.2, 1.0),
            Prediction::new(0.6, 1.0),
        ];
        enforce_difficulty_order(&mut increasing, [1.0; 3]);
        for p in &increasing {
            assert!((p.probability - 0.3).abs() < 1e-12);
        }

        let mut ordered = [
            Prediction::new(0.9, 1.0),
            Prediction::new(0.5, 1.0),
            Prediction::new(0.1, 1.0),
        ];
        enforce_difficulty_order(&mut ordered, [1.0; 3]);
        assert_eq!(ordered[1].probability, 0.5);
    }

    #[test]
    fn test_observed_levels_dominate_pooling() {
        // Three correct answers on hard only: the ladder value survives pooling.
        let mut preds = [
            Prediction::new(0.5, 60.0),
            Prediction::new(0.5, 60.0),
            Prediction::new(0.85, 40.0),
        ];
        enforce_difficulty_order(&mut preds, level_weights([0, 0, 3]));
        for p in &preds {
            assert!(p.probability > 0.84, "got {}", p.probability);
        }
        assert!(preds[0].probability >= preds[1].probability);
        assert!(preds[1].probability >= preds[2].probability);

        let mut medium_only = [
            Prediction::new(0.5, 60.0),
            Prediction::new(0.85, 40.0),
            Prediction::new(0.5, 60.0),
        ];
        enforce_difficulty_order(&mut medium_only, level_weights([0, 3, 0]));
        assert!(medium_only[1].probability > 0.84);
        assert_eq!(medium_only[2].probability, 0.5);
    }

    #[test]
    fn test_level_weights() {
        assert_eq!(level_weights([0, 4, 12]), [UNOBSERVED_LEVEL_WEIGHT, 4.0, 12.0]);
    }
}
