//! History-feature embedding predictor.
//!
//! User, topic and difficulty embeddings are concatenated with normalized history
//! features and fed through one hidden ReLU layer into two heads: a sigmoid
//! correctness head and a log-time regression head.
//!
//! Every trained model anchors its output for the (user, topic, difficulty) keys it
//! was trained on. Lookups stay within a band around the anchor, and a retrained
//! model's anchors start from what the previous model served, so one new outcome
//! cannot swing a prediction far between two training runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::config::{EmbeddingParams, OutputBounds};
use crate::engine::features::{
    fit_normalizers, normalize, FeatureBuilder, NormalizationStat, FEATURE_COUNT,
    NORMALIZED_LIMIT,
};
use crate::engine::likelihood::sigmoid;
use crate::engine::types::{
    Difficulty, OutcomeRecord, Prediction, PredictorOutcome, UnavailableReason,
};

const PROB_EPSILON: f64 = 1e-7;
const GRAD_CLIP: f64 = 5.0;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("dimension mismatch in {0}")]
    Dimension(&'static str),
    #[error("non-finite values in {0}")]
    NonFinite(&'static str),
    #[error("duplicate vocabulary entry: {0}")]
    DuplicateEntry(String),
}

/// Append-only bijection between names and dense indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct VocabIndex {
    names: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl From<Vec<String>> for VocabIndex {
    fn from(names: Vec<String>) -> Self {
        let lookup = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, lookup }
    }
}

impl From<VocabIndex> for Vec<String> {
    fn from(index: VocabIndex) -> Self {
        index.names
    }
}

impl VocabIndex {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn get_or_insert(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.lookup.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), idx);
        idx
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn validate(&self) -> Result<(), ArtifactError> {
        if self.lookup.len() != self.names.len() {
            let mut seen = HashMap::new();
            for name in &self.names {
                if seen.insert(name, ()).is_some() {
                    return Err(ArtifactError::DuplicateEntry(name.clone()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVocabulary {
    pub users: VocabIndex,
    pub topics: VocabIndex,
    pub difficulties: VocabIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn random(rows: usize, cols: usize, limit: f64, rng: &mut StdRng) -> Self {
        Self {
            rows,
            cols,
            data: (0..rows * cols).map(|_| rng.random_range(-limit..limit)).collect(),
        }
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Grows to `rows`, keeping existing rows and initializing the new ones randomly.
    fn grow_rows(&mut self, rows: usize, limit: f64, rng: &mut StdRng) {
        while self.rows < rows {
            for _ in 0..self.cols {
                self.data.push(rng.random_range(-limit..limit));
            }
            self.rows += 1;
        }
    }

    fn is_consistent(&self) -> bool {
        self.data.len() == self.rows * self.cols
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingNetwork {
    pub user_embeddings: Matrix,
    pub topic_embeddings: Matrix,
    pub difficulty_embeddings: Matrix,
    pub hidden_weights: Matrix,
    pub hidden_bias: Vec<f64>,
    pub correct_weights: Vec<f64>,
    pub correct_bias: f64,
    pub time_weights: Vec<f64>,
    pub time_bias: f64,
}

struct ForwardPass {
    input: Vec<f64>,
    hidden_pre: Vec<f64>,
    hidden: Vec<f64>,
    correct_logit: f64,
    time_out: f64,
}

#[derive(Default)]
struct Gradients {
    user: BTreeMap<usize, Vec<f64>>,
    topic: BTreeMap<usize, Vec<f64>>,
    difficulty: BTreeMap<usize, Vec<f64>>,
    hidden_weights: Vec<f64>,
    hidden_bias: Vec<f64>,
    correct_weights: Vec<f64>,
    correct_bias: f64,
    time_weights: Vec<f64>,
    time_bias: f64,
}

impl EmbeddingNetwork {
    fn new(vocab: &EmbeddingVocabulary, params: &EmbeddingParams, rng: &mut StdRng) -> Self {
        let input_dim = Self::input_dim(params);
        let hidden = params.hidden_dim;
        let xavier = (6.0 / (input_dim + hidden) as f64).sqrt();
        let head = (6.0 / (hidden + 1) as f64).sqrt();
        Self {
            user_embeddings: Matrix::random(vocab.users.len(), params.user_dim, 0.1, rng),
            topic_embeddings: Matrix::random(vocab.topics.len(), params.topic_dim, 0.1, rng),
            difficulty_embeddings: Matrix::random(
                vocab.difficulties.len(),
                params.difficulty_dim,
                0.1,
                rng,
            ),
            hidden_weights: Matrix::random(hidden, input_dim, xavier, rng),
            hidden_bias: vec![0.0; hidden],
            correct_weights: (0..hidden).map(|_| rng.random_range(-head..head)).collect(),
            correct_bias: 0.0,
            time_weights: (0..hidden).map(|_| rng.random_range(-head..head)).collect(),
            time_bias: 0.0,
        }
    }

    fn input_dim(params: &EmbeddingParams) -> usize {
        params.user_dim + params.topic_dim + params.difficulty_dim + FEATURE_COUNT
    }

    fn matches(&self, params: &EmbeddingParams) -> bool {
        self.user_embeddings.cols == params.user_dim
            && self.topic_embeddings.cols == params.topic_dim
            && self.difficulty_embeddings.cols == params.difficulty_dim
            && self.hidden_weights.rows == params.hidden_dim
            && self.hidden_weights.cols == Self::input_dim(params)
    }

    fn resize(&mut self, vocab: &EmbeddingVocabulary, rng: &mut StdRng) {
        self.user_embeddings.grow_rows(vocab.users.len(), 0.1, rng);
        self.topic_embeddings.grow_rows(vocab.topics.len(), 0.1, rng);
        self.difficulty_embeddings.grow_rows(vocab.difficulties.len(), 0.1, rng);
    }

    fn forward(&self, user: usize, topic: usize, difficulty: usize, features: &[f64]) -> ForwardPass {
        let mut input = Vec::with_capacity(self.hidden_weights.cols);
        input.extend_from_slice(self.user_embeddings.row(user));
        input.extend_from_slice(self.topic_embeddings.row(topic));
        input.extend_from_slice(self.difficulty_embeddings.row(difficulty));
        input.extend_from_slice(features);

        let hidden_pre: Vec<f64> = (0..self.hidden_weights.rows)
            .map(|h| {
                self.hidden_weights
                    .row(h)
                    .iter()
                    .zip(&input)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + self.hidden_bias[h]
            })
            .collect();
        let hidden: Vec<f64> = hidden_pre.iter().map(|v| v.max(0.0)).collect();
        let correct_logit = dot(&self.correct_weights, &hidden) + self.correct_bias;
        let time_out = dot(&self.time_weights, &hidden) + self.time_bias;

        ForwardPass {
            input,
            hidden_pre,
            hidden,
            correct_logit,
            time_out,
        }
    }

    fn gradients_zeroed(&self) -> Gradients {
        Gradients {
            hidden_weights: vec![0.0; self.hidden_weights.data.len()],
            hidden_bias: vec![0.0; self.hidden_bias.len()],
            correct_weights: vec![0.0; self.correct_weights.len()],
            time_weights: vec![0.0; self.time_weights.len()],
            ..Gradients::default()
        }
    }

    fn backward(&self, example: &Example, time_weight: f64, grads: &mut Gradients) -> f64 {
        let pass = self.forward(example.user, example.topic, example.difficulty, &example.features);
        let p = sigmoid(pass.correct_logit).clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
        let time_err = pass.time_out - example.log_time;
        let loss = -(example.correct * p.ln() + (1.0 - example.correct) * (1.0 - p).ln())
            + time_weight * 0.5 * time_err * time_err;

        let d_correct = (p - example.correct).clamp(-GRAD_CLIP, GRAD_CLIP);
        let d_time = (time_weight * time_err).clamp(-GRAD_CLIP, GRAD_CLIP);

        grads.correct_bias += d_correct;
        grads.time_bias += d_time;
        let cols = self.hidden_weights.cols;
        let mut d_input = vec![0.0; cols];

        for h in 0..self.hidden_weights.rows {
            grads.correct_weights[h] += d_correct * pass.hidden[h];
            grads.time_weights[h] += d_time * pass.hidden[h];
            if pass.hidden_pre[h] <= 0.0 {
                continue;
            }
            let d_hidden = d_correct * self.correct_weights[h] + d_time * self.time_weights[h];
            grads.hidden_bias[h] += d_hidden;
            let row = self.hidden_weights.row(h);
            for j in 0..cols {
                grads.hidden_weights[h * cols + j] += d_hidden * pass.input[j];
                d_input[j] += d_hidden * row[j];
            }
        }

        let du = self.user_embeddings.cols;
        let dt = self.topic_embeddings.cols;
        let dd = self.difficulty_embeddings.cols;
        accumulate(&mut grads.user, example.user, &d_input[..du]);
        accumulate(&mut grads.topic, example.topic, &d_input[du..du + dt]);
        accumulate(&mut grads.difficulty, example.difficulty, &d_input[du + dt..du + dt + dd]);

        loss
    }

    fn apply(&mut self, grads: &Gradients, step: f64) {
        for (w, g) in self.hidden_weights.data.iter_mut().zip(&grads.hidden_weights) {
            *w -= step * g;
        }
        for (w, g) in self.hidden_bias.iter_mut().zip(&grads.hidden_bias) {
            *w -= step * g;
        }
        for (w, g) in self.correct_weights.iter_mut().zip(&grads.correct_weights) {
            *w -= step * g;
        }
        for (w, g) in self.time_weights.iter_mut().zip(&grads.time_weights) {
            *w -= step * g;
        }
        self.correct_bias -= step * grads.correct_bias;
        self.time_bias -= step * grads.time_bias;
        apply_rows(&mut self.user_embeddings, &grads.user, step);
        apply_rows(&mut self.topic_embeddings, &grads.topic, step);
        apply_rows(&mut self.difficulty_embeddings, &grads.difficulty, step);
    }

    fn loss(&self, example: &Example, time_weight: f64) -> f64 {
        let pass = self.forward(example.user, example.topic, example.difficulty, &example.features);
        let p = sigmoid(pass.correct_logit).clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
        let time_err = pass.time_out - example.log_time;
        -(example.correct * p.ln() + (1.0 - example.correct) * (1.0 - p).ln())
            + time_weight * 0.5 * time_err * time_err
    }

    fn all_finite(&self) -> bool {
        [
            &self.user_embeddings.data,
            &self.topic_embeddings.data,
            &self.difficulty_embeddings.data,
            &self.hidden_weights.data,
            &self.hidden_bias,
            &self.correct_weights,
            &self.time_weights,
        ]
        .iter()
        .all(|values| values.iter().all(|v| v.is_finite()))
            && self.correct_bias.is_finite()
            && self.time_bias.is_finite()
    }
}

fn accumulate(map: &mut BTreeMap<usize, Vec<f64>>, row: usize, grad: &[f64]) {
    let entry = map.entry(row).or_insert_with(|| vec![0.0; grad.len()]);
    for (acc, g) in entry.iter_mut().zip(grad) {
        *acc += g;
    }
}

fn apply_rows(matrix: &mut Matrix, grads: &BTreeMap<usize, Vec<f64>>, step: f64) {
    for (row, grad) in grads {
        for (w, g) in matrix.row_mut(*row).iter_mut().zip(grad) {
            *w -= step * g;
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn anchor_key(user: usize, topic: usize, difficulty: usize) -> String {
    format!("{user}:{topic}:{difficulty}")
}

/// Keeps `value` within the configured band around `anchor`.
fn hold_near(value: Prediction, anchor: &Prediction, params: &EmbeddingParams) -> Prediction {
    let dp = params.max_probability_shift.max(0.0);
    let dt = 1.0 + params.max_time_shift.max(0.0);
    Prediction::new(
        value.probability.clamp(anchor.probability - dp, anchor.probability + dp),
        value.seconds.clamp(anchor.seconds / dt, anchor.seconds * dt),
    )
}

/// EMA step from `reference` toward `value` (time in log space), then held to the band.
fn blend_toward(reference: Prediction, value: Prediction, params: &EmbeddingParams) -> Prediction {
    let w = params.anchor_blend.clamp(0.0, 1.0);
    let probability = reference.probability + w * (value.probability - reference.probability);
    let log_seconds = reference.seconds.ln() + w * (value.seconds.ln() - reference.seconds.ln());
    hold_near(Prediction::new(probability, log_seconds.exp()), &reference, params)
}

struct Example {
    user: usize,
    topic: usize,
    difficulty: usize,
    features: Vec<f64>,
    correct: f64,
    log_time: f64,
}

/// Trained predictor plus everything needed to reproduce its inputs. This is the
/// persisted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub vocabulary: EmbeddingVocabulary,
    pub network: EmbeddingNetwork,
    pub feature_stats: Vec<NormalizationStat>,
    pub time_stat: NormalizationStat,
    pub n_samples: usize,
    pub trained_at: DateTime<Utc>,
    /// Output served right after training, keyed by vocabulary indices.
    #[serde(default)]
    pub anchors: BTreeMap<String, Prediction>,
    /// Per user index, how many of the user's records this model was trained with.
    #[serde(default)]
    pub trained_counts: Vec<usize>,
}

impl EmbeddingModel {
    pub fn validate(&self) -> Result<(), ArtifactError> {
        self.vocabulary.users.validate()?;
        self.vocabulary.topics.validate()?;
        self.vocabulary.difficulties.validate()?;

        let net = &self.network;
        if !net.user_embeddings.is_consistent()
            || net.user_embeddings.rows != self.vocabulary.users.len()
        {
            return Err(ArtifactError::Dimension("user embeddings"));
        }
        if !net.topic_embeddings.is_consistent()
            || net.topic_embeddings.rows != self.vocabulary.topics.len()
        {
            return Err(ArtifactError::Dimension("topic embeddings"));
        }
        if !net.difficulty_embeddings.is_consistent()
            || net.difficulty_embeddings.rows != self.vocabulary.difficulties.len()
        {
            return Err(ArtifactError::Dimension("difficulty embeddings"));
        }
        let input_dim = net.user_embeddings.cols
            + net.topic_embeddings.cols
            + net.difficulty_embeddings.cols
            + FEATURE_COUNT;
        let hidden = net.hidden_weights.rows;
        if !net.hidden_weights.is_consistent()
            || net.hidden_weights.cols != input_dim
            || net.hidden_bias.len() != hidden
            || net.correct_weights.len() != hidden
            || net.time_weights.len() != hidden
        {
            return Err(ArtifactError::Dimension("hidden layer"));
        }
        if self.feature_stats.len() != FEATURE_COUNT {
            return Err(ArtifactError::Dimension("feature statistics"));
        }
        if self.trained_counts.len() > self.vocabulary.users.len() {
            return Err(ArtifactError::Dimension("trained counts"));
        }
        if !net.all_finite() {
            return Err(ArtifactError::NonFinite("network weights"));
        }
        if !self.time_stat.is_valid() || !self.feature_stats.iter().all(|s| s.is_valid()) {
            return Err(ArtifactError::NonFinite("normalization statistics"));
        }
        if self
            .anchors
            .values()
            .any(|a| !a.probability.is_finite() || !a.seconds.is_finite() || a.seconds <= 0.0)
        {
            return Err(ArtifactError::NonFinite("anchors"));
        }
        Ok(())
    }

    fn raw_prediction(
        &self,
        params: &EmbeddingParams,
        bounds: &OutputBounds,
        indices: (usize, usize, usize),
        topic: &str,
        difficulty: Difficulty,
        history: &[&OutcomeRecord],
    ) -> Prediction {
        let (user, topic_idx, difficulty_idx) = indices;
        let builder = FeatureBuilder::new(params.recent_window, params.improvement_window);
        let raw = builder.build(history, topic, difficulty);
        let features = normalize(&raw, &self.feature_stats);
        let pass = self.network.forward(user, topic_idx, difficulty_idx, &features);

        let probability = sigmoid(pass.correct_logit);
        let time_out = pass.time_out.clamp(-NORMALIZED_LIMIT, NORMALIZED_LIMIT);
        let seconds = self.time_stat.invert(time_out).exp() - 1.0;
        Prediction::new(probability, seconds).clamped(bounds)
    }

    /// Prediction, or the reason this model cannot answer.
    pub fn lookup(
        &self,
        params: &EmbeddingParams,
        bounds: &OutputBounds,
        user_id: &str,
        topic: &str,
        difficulty: Difficulty,
        history: &[&OutcomeRecord],
    ) -> PredictorOutcome {
        let Some(user) = self.vocabulary.users.get(user_id) else {
            return PredictorOutcome::Unavailable(UnavailableReason::UnknownUser);
        };
        let Some(topic_idx) = self.vocabulary.topics.get(topic) else {
            return PredictorOutcome::Unavailable(UnavailableReason::UnknownTopic);
        };
        let Some(difficulty_idx) = self.vocabulary.difficulties.get(difficulty.as_str()) else {
            return PredictorOutcome::Unavailable(UnavailableReason::UnknownDifficulty);
        };

        let indices = (user, topic_idx, difficulty_idx);
        let raw = self.raw_prediction(params, bounds, indices, topic, difficulty, history);
        let prediction = match self.anchors.get(&anchor_key(user, topic_idx, difficulty_idx)) {
            Some(anchor) => hold_near(raw, anchor, params),
            None => raw,
        };
        PredictorOutcome::Available(prediction.clamped(bounds))
    }

    /// What this model served for an anchored key, given the part of `history` it was
    /// trained with.
    fn served_before_retrain(
        &self,
        params: &EmbeddingParams,
        bounds: &OutputBounds,
        user_id: &str,
        topic: &str,
        difficulty: Difficulty,
        history: &[&OutcomeRecord],
    ) -> Option<Prediction> {
        let user = self.vocabulary.users.get(user_id)?;
        let topic_idx = self.vocabulary.topics.get(topic)?;
        let difficulty_idx = self.vocabulary.difficulties.get(difficulty.as_str())?;
        if !self.anchors.contains_key(&anchor_key(user, topic_idx, difficulty_idx)) {
            return None;
        }
        let seen = match self.trained_counts.get(user) {
            Some(&n) if n > 0 => n.min(history.len()),
            _ => history.len(),
        };
        self.lookup(params, bounds, user_id, topic, difficulty, &history[..seen])
            .prediction()
    }

    /// Anchors for every key in the training corpus. Keys the previous model anchored
    /// start from what it served.
    fn anchor_outputs(
        &self,
        params: &EmbeddingParams,
        bounds: &OutputBounds,
        previous: Option<&EmbeddingModel>,
        by_user: &BTreeMap<&str, Vec<&OutcomeRecord>>,
    ) -> BTreeMap<String, Prediction> {
        let mut anchors = BTreeMap::new();
        let mut carried = 0usize;
        for (user_id, records) in by_user {
            let Some(user) = self.vocabulary.users.get(user_id) else {
                continue;
            };
            let keys: BTreeSet<(&str, Difficulty)> = records
                .iter()
                .map(|r| (r.topic.as_str(), r.difficulty))
                .collect();
            for (topic, difficulty) in keys {
                let (Some(topic_idx), Some(difficulty_idx)) = (
                    self.vocabulary.topics.get(topic),
                    self.vocabulary.difficulties.get(difficulty.as_str()),
                ) else {
                    continue;
                };
                let indices = (user, topic_idx, difficulty_idx);
                let value = self.raw_prediction(params, bounds, indices, topic, difficulty, records);
                let reference = previous.and_then(|prev| {
                    prev.served_before_retrain(params, bounds, user_id, topic, difficulty, records)
                });
                let anchor = match reference {
                    Some(reference) => {
                        carried += 1;
                        blend_toward(reference, value, params)
                    }
                    None => value,
                };
                anchors.insert(anchor_key(user, topic_idx, difficulty_idx), anchor);
            }
        }
        debug!(anchors = anchors.len(), carried, "embedding outputs anchored");
        anchors
    }

    /// Like [`lookup`](Self::lookup) but falls back to the neutral prediction.
    pub fn predict(
        &self,
        params: &EmbeddingParams,
        bounds: &OutputBounds,
        user_id: &str,
        topic: &str,
        difficulty: Difficulty,
        history: &[&OutcomeRecord],
    ) -> Prediction {
        self.lookup(params, bounds, user_id, topic, difficulty, history)
            .prediction()
            .unwrap_or_else(|| Prediction::neutral(bounds))
    }

    /// Trains on every eligible (history -> next outcome) pair in `outcomes`. Returns `None`
    /// when there are fewer than `min_samples` pairs.
    pub fn train(
        params: &EmbeddingParams,
        bounds: &OutputBounds,
        previous: Option<&EmbeddingModel>,
        outcomes: &[OutcomeRecord],
    ) -> Option<EmbeddingModel> {
        let mut by_user: BTreeMap<&str, Vec<&OutcomeRecord>> = BTreeMap::new();
        for record in outcomes {
            by_user.entry(record.user_id.as_str()).or_default().push(record);
        }

        let builder = FeatureBuilder::new(params.recent_window, params.improvement_window);
        let mut vocabulary = previous
            .map(|m| m.vocabulary.clone())
            .unwrap_or_default();
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        let mut keys = Vec::new();

        for (user_id, records) in by_user.iter_mut() {
            records.sort_by_key(|r| r.created_at);
            let user = vocabulary.users.get_or_insert(user_id);
            for i in 1..records.len() {
                let target = records[i];
                let topic = vocabulary.topics.get_or_insert(&target.topic);
                let difficulty = vocabulary.difficulties.get_or_insert(target.difficulty.as_str());
                rows.push(builder.build(&records[..i], &target.topic, target.difficulty));
                targets.push((target.correct_value(), (target.response_time.max(0.0) + 1.0).ln()));
                keys.push((user, topic, difficulty));
            }
        }

        if rows.len() < params.min_samples {
            debug!(
                available = rows.len(),
                required = params.min_samples,
                "skipping embedding training: insufficient data"
            );
            return None;
        }
        if rows.len() < 2 {
            debug!(available = rows.len(), "skipping embedding training: no validation split possible");
            return None;
        }

        let feature_stats = fit_normalizers(&rows);
        let time_stat = NormalizationStat::fit(targets.iter().map(|(_, t)| *t));
        let examples: Vec<Example> = rows
            .iter()
            .zip(&targets)
            .zip(&keys)
            .map(|((row, (correct, log_time)), (user, topic, difficulty))| Example {
                user: *user,
                topic: *topic,
                difficulty: *difficulty,
                features: normalize(row, &feature_stats),
                correct: *correct,
                log_time: time_stat.apply(*log_time),
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut network = match previous {
            Some(model) if model.network.matches(params) => {
                let mut network = model.network.clone();
                network.resize(&vocabulary, &mut rng);
                network
            }
            _ => EmbeddingNetwork::new(&vocabulary, params, &mut rng),
        };

        let mut order: Vec<usize> = (0..examples.len()).collect();
        order.shuffle(&mut rng);
        let n_val = ((examples.len() as f64 * params.validation_fraction).round() as usize)
            .clamp(1, examples.len() - 1);
        let (val_idx, train_idx) = order.split_at(n_val);
        let mut train_idx = train_idx.to_vec();

        let mut best = network.clone();
        let mut best_val = f64::INFINITY;
        let mut stale_epochs = 0usize;
        let mut epochs_run = 0usize;
        let batch_size = params.batch_size.max(1);

        for _ in 0..params.max_epochs {
            epochs_run += 1;
            train_idx.shuffle(&mut rng);
            for batch in train_idx.chunks(batch_size) {
                let mut grads = network.gradients_zeroed();
                for &i in batch {
                    network.backward(&examples[i], params.time_loss_weight, &mut grads);
                }
                network.apply(&grads, params.learning_rate / batch.len() as f64);
            }

            let val_loss = val_idx
                .iter()
                .map(|&i| network.loss(&examples[i], params.time_loss_weight))
                .sum::<f64>()
                / val_idx.len() as f64;

            if val_loss.is_finite() && val_loss < best_val {
                best_val = val_loss;
                best = network.clone();
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
                if stale_epochs >= params.patience {
                    break;
                }
            }
        }

        info!(
            n_samples = examples.len(),
            n_users = vocabulary.users.len(),
            n_topics = vocabulary.topics.len(),
            epochs = epochs_run,
            val_loss = best_val,
            "embedding predictor trained"
        );

        let mut trained_counts = vec![0; vocabulary.users.len()];
        for (user_id, records) in &by_user {
            if let Some(user) = vocabulary.users.get(user_id) {
                trained_counts[user] = records.len();
            }
        }

        let mut model = EmbeddingModel {
            vocabulary,
            network: best,
            feature_stats,
            time_stat,
            n_samples: examples.len(),
            trained_at: Utc::now(),
            anchors: BTreeMap::new(),
            trained_counts,
        };
        model.anchors = model.anchor_outputs(params, bounds, previous, &by_user);
        Some(model)
    }
}
