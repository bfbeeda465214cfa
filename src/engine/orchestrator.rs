//! Entry point for the surrounding application: predictions, outcome counting and
//! retraining.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::db::operations::{
    fetch_completed_outcomes, fetch_user_outcomes, increment_counter, insert_outcome,
    load_all_topic_models, load_embedding_artifacts, read_tracker_state,
};
use crate::db::{Store, StoreError, TrainingCommit};
use crate::engine::config::EngineConfig;
use crate::engine::correction::{AdaptiveCorrector, CorrectionRegime};
use crate::engine::embedding::EmbeddingModel;
use crate::engine::parameters::{ModelStats, ParameterStore, TopicModel};
use crate::engine::predictor::{
    enforce_difficulty_order, level_weights, PredictionContext, PredictorChain, PredictorSource,
};
use crate::engine::trainer::{AlternatingTrainer, TopicTraining};
use crate::engine::types::{
    Difficulty, OutcomeRecord, Prediction, TrackerState, TrainingMode, TrainingReport,
    TriggerPhase, UserParameters,
};
use crate::workers::training::{spawn_training, TrainingHandle};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("training task failed: {0}")]
    TrainingTask(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionDetail {
    pub prediction: Prediction,
    pub source: PredictorSource,
    pub regime: CorrectionRegime,
}

#[derive(Debug)]
pub struct TaskCompletion {
    pub training_triggered: bool,
    pub training_scheduled: bool,
    pub counter: i64,
    /// Set when training was dispatched to the background.
    pub training: Option<TrainingHandle>,
}

struct TrainingOutput {
    models: Vec<TopicModel>,
    topics_trained: Vec<String>,
    repaired_taus: usize,
    embedding: Option<EmbeddingModel>,
}

#[derive(Clone)]
pub struct PredictionEngine {
    store: Store,
    config: Arc<EngineConfig>,
    parameters: ParameterStore,
    embedding: Arc<RwLock<Option<Arc<EmbeddingModel>>>>,
    training_lock: Arc<Mutex<()>>,
}

impl PredictionEngine {
    /// Restores persisted models. Malformed entries are repaired or dropped on the way in.
    pub async fn load(store: Store, config: EngineConfig) -> Result<Self, EngineError> {
        let parameters = ParameterStore::new();
        let mut models = load_all_topic_models(&store).await?;
        for model in models.iter_mut() {
            let repaired = model.validate(&config.bounds);
            if repaired > 0 {
                warn!(topic = %model.topic, repaired, "repaired stored topic parameters on load");
            }
        }
        let n_topics = models.len();
        parameters.replace_all(models);

        let embedding = load_embedding_artifacts(&store).await?;
        let tracker = read_tracker_state(&store, config.trigger.threshold).await?;

        info!(
            topics = n_topics,
            embedding_loaded = embedding.is_some(),
            counter = tracker.n_samples_since_training,
            "prediction engine loaded"
        );

        Ok(Self {
            store,
            config: Arc::new(config),
            parameters,
            embedding: Arc::new(RwLock::new(embedding.map(Arc::new))),
            training_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    pub fn is_training(&self) -> bool {
        self.training_lock.try_lock().is_err()
    }

    pub async fn predict(&self, user_id: &str, topic: &str, difficulty: Difficulty) -> Prediction {
        self.predict_detailed(user_id, topic, difficulty).await.prediction
    }

    /// Never fails: history that cannot be read is treated as empty.
    pub async fn predict_detailed(
        &self,
        user_id: &str,
        topic: &str,
        difficulty: Difficulty,
    ) -> PredictionDetail {
        let history = match fetch_user_outcomes(&self.store, user_id, None).await {
            Ok(history) => history,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to read user history, predicting without it");
                Vec::new()
            }
        };
        let levels = self.predict_levels(user_id, topic, &history);
        levels[difficulty.index()]
    }

    fn predict_levels(
        &self,
        user_id: &str,
        topic: &str,
        history: &[OutcomeRecord],
    ) -> [PredictionDetail; 3] {
        let embedding = self.embedding.read().clone();
        let chain = PredictorChain::new(&self.parameters, embedding.as_deref(), &self.config);
        let corrector = AdaptiveCorrector::new(&self.config.correction, &self.config.output);

        let all: Vec<&OutcomeRecord> = history.iter().collect();
        let on_topic: Vec<&OutcomeRecord> = all.iter().copied().filter(|r| r.topic == topic).collect();

        let details = Difficulty::ALL.map(|difficulty| {
            let ctx = PredictionContext {
                user_id,
                topic,
                difficulty,
                history: &all,
            };
            let raw = chain.predict(&ctx);
            let corrected = corrector.apply(raw.prediction, &on_topic, difficulty);
            PredictionDetail {
                prediction: corrected.prediction,
                source: raw.source,
                regime: corrected.regime,
            }
        });

        let slice_lens = Difficulty::ALL
            .map(|difficulty| on_topic.iter().filter(|r| r.difficulty == difficulty).count());
        let mut predictions = details.map(|d| d.prediction);
        enforce_difficulty_order(&mut predictions, level_weights(slice_lens));
        let mut ordered = details;
        for (detail, prediction) in ordered.iter_mut().zip(predictions) {
            detail.prediction = prediction.clamped(&self.config.output);
        }
        ordered
    }

    pub async fn on_task_completed(
        &self,
        user_id: &str,
        topic: &str,
    ) -> Result<TaskCompletion, EngineError> {
        self.on_task_completed_with(user_id, topic, self.config.trigger.mode)
            .await
    }

    /// Counts one outcome and, when the threshold is reached, trains inline (`Sync`) or in
    /// the background (`Async`). A trigger while a run is in progress is a no-op.
    pub async fn on_task_completed_with(
        &self,
        user_id: &str,
        topic: &str,
        mode: TrainingMode,
    ) -> Result<TaskCompletion, EngineError> {
        let state = increment_counter(&self.store, self.config.trigger.threshold).await?;
        debug!(
            user_id = %user_id,
            topic = %topic,
            counter = state.n_samples_since_training,
            threshold = state.threshold,
            "outcome counted"
        );

        if state.phase() != TriggerPhase::ThresholdReached {
            return Ok(TaskCompletion {
                training_triggered: false,
                training_scheduled: false,
                counter: state.n_samples_since_training,
                training: None,
            });
        }

        let Ok(guard) = Arc::clone(&self.training_lock).try_lock_owned() else {
            debug!(counter = state.n_samples_since_training, "training already running, trigger ignored");
            return Ok(TaskCompletion {
                training_triggered: false,
                training_scheduled: false,
                counter: state.n_samples_since_training,
                training: None,
            });
        };

        match mode {
            TrainingMode::Sync => {
                let report = self.train_with_guard(guard).await?;
                let counter = read_tracker_state(&self.store, self.config.trigger.threshold)
                    .await?
                    .n_samples_since_training;
                Ok(TaskCompletion {
                    training_triggered: report.is_completed(),
                    training_scheduled: false,
                    counter,
                    training: None,
                })
            }
            TrainingMode::Async => {
                let handle = spawn_training(self.clone(), guard);
                Ok(TaskCompletion {
                    training_triggered: true,
                    training_scheduled: true,
                    counter: state.n_samples_since_training,
                    training: Some(handle),
                })
            }
        }
    }

    /// Inserts an outcome and counts it.
    pub async fn record_outcome(&self, record: &OutcomeRecord) -> Result<TaskCompletion, EngineError> {
        insert_outcome(&self.store, record).await?;
        self.on_task_completed(&record.user_id, &record.topic).await
    }

    /// Trains now regardless of the counter.
    pub async fn force_train(&self) -> Result<TrainingReport, EngineError> {
        let Ok(guard) = Arc::clone(&self.training_lock).try_lock_owned() else {
            return Ok(TrainingReport::AlreadyRunning);
        };
        self.train_with_guard(guard).await
    }

    pub async fn tracker_state(&self) -> Result<TrackerState, EngineError> {
        Ok(read_tracker_state(&self.store, self.config.trigger.threshold).await?)
    }

    pub async fn trigger_phase(&self) -> Result<TriggerPhase, EngineError> {
        if self.is_training() {
            return Ok(TriggerPhase::Training);
        }
        Ok(self.tracker_state().await?.phase())
    }

    /// Population mean with `is_personalized = false` when the user has no record on the topic.
    pub fn get_user_parameters(&self, user_id: &str, topic: &str) -> UserParameters {
        match self.parameters.get(topic) {
            Some(model) => model.user_parameters(user_id),
            None => UserParameters {
                theta: 0.0,
                tau: 0.0,
                is_personalized: false,
            },
        }
    }

    pub fn get_model_stats(&self, topic: &str) -> Option<ModelStats> {
        self.parameters.get(topic).map(|model| model.stats())
    }

    /// Full training run. The caller holds the training lock for the duration.
    pub(crate) async fn train_with_guard(
        &self,
        _guard: OwnedMutexGuard<()>,
    ) -> Result<TrainingReport, EngineError> {
        let started = Instant::now();
        let tracker = read_tracker_state(&self.store, self.config.trigger.threshold).await?;
        let outcomes = fetch_completed_outcomes(&self.store, None).await?;

        let required = self.config.trigger.force_min_samples;
        if outcomes.len() < required {
            info!(available = outcomes.len(), required, "training skipped: insufficient data");
            return Ok(TrainingReport::InsufficientData {
                available: outcomes.len(),
                required,
            });
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, n_samples = outcomes.len(), "training run started");

        let config = Arc::clone(&self.config);
        let previous = self.parameters.snapshot();
        let previous_embedding = self.embedding.read().clone();
        let n_samples = outcomes.len();

        let output = tokio::task::spawn_blocking(move || {
            train_all(&config, &previous, previous_embedding.as_deref(), &outcomes)
        })
        .await
        .map_err(|e| EngineError::TrainingTask(e.to_string()))?;

        self.store
            .commit_training(TrainingCommit {
                models: &output.models,
                embedding: output.embedding.as_ref(),
                consumed: tracker.n_samples_since_training,
                total_samples: n_samples as i64,
                trained_at: Utc::now(),
            })
            .await?;

        let embedding_trained = output.embedding.is_some();
        self.parameters.replace_all(output.models);
        if let Some(model) = output.embedding {
            *self.embedding.write() = Some(Arc::new(model));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            topics = output.topics_trained.len(),
            n_samples,
            repaired_taus = output.repaired_taus,
            embedding_trained,
            duration_ms,
            "training run completed"
        );

        Ok(TrainingReport::Completed {
            run_id,
            topics_trained: output.topics_trained,
            n_samples,
            repaired_taus: output.repaired_taus,
            embedding_trained,
            duration_ms,
        })
    }
}

fn train_all(
    config: &EngineConfig,
    previous: &HashMap<String, Arc<TopicModel>>,
    previous_embedding: Option<&EmbeddingModel>,
    outcomes: &[OutcomeRecord],
) -> TrainingOutput {
    let trainer = AlternatingTrainer::new(&config.bounds, &config.trainer);
    let topics: BTreeSet<&str> = outcomes.iter().map(|r| r.topic.as_str()).collect();

    let mut output = TrainingOutput {
        models: Vec::new(),
        topics_trained: Vec::new(),
        repaired_taus: 0,
        embedding: None,
    };

    for topic in topics {
        let prior = previous.get(topic).map(|m| m.as_ref());
        match trainer.train_topic(topic, prior, outcomes) {
            TopicTraining::Trained(result) => {
                output.repaired_taus += result.repaired_taus;
                output.topics_trained.push(topic.to_string());
                output.models.push(result.model);
            }
            TopicTraining::InsufficientData { .. } => {}
        }
    }

    if config.embedding.enabled {
        output.embedding = EmbeddingModel::train(
            &config.embedding,
            &config.output,
            previous_embedding,
            outcomes,
        );
    }

    output
}
