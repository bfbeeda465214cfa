mod common;

use adaptive_practice_engine::db::operations::{
    fetch_completed_outcomes, insert_outcome, load_topic_model, read_tracker_state,
};
use adaptive_practice_engine::engine::correction::CorrectionRegime;
use adaptive_practice_engine::engine::predictor::PredictorSource;
use adaptive_practice_engine::engine::{
    Difficulty, EngineConfig, EngineError, OutcomeRecord, PredictionDetail, PredictionEngine,
    TrainingMode, TrainingReport, TriggerPhase,
};

use common::{outcome, seed, sync_config, test_env};

fn mixed_history(user_id: &str, topic: &str, n: i64) -> Vec<OutcomeRecord> {
    (0..n)
        .map(|i| {
            let difficulty = Difficulty::ALL[(i % 3) as usize];
            let correct = match difficulty {
                Difficulty::Easy => i % 4 != 0,
                Difficulty::Medium => i % 2 == 0,
                Difficulty::Hard => i % 4 == 0,
            };
            outcome(user_id, topic, difficulty, correct, 30.0 + 20.0 * difficulty.index() as f64, i)
        })
        .collect()
}

#[tokio::test]
async fn test_new_user_new_topic_gets_neutral_prediction() {
    let env = test_env(sync_config()).await;
    let prediction = env.engine.predict("newcomer", "Calculus", Difficulty::Medium).await;
    assert_eq!(prediction.probability, 0.5);
    assert_eq!(prediction.seconds, 60.0);

    let params = env.engine.get_user_parameters("newcomer", "Calculus");
    assert!(!params.is_personalized);
    assert!(env.engine.get_model_stats("Calculus").is_none());
}

#[tokio::test]
async fn test_single_failure_moves_early_prediction_down() {
    let env = test_env(sync_config()).await;
    let records = [
        OutcomeRecord::new("u1", "Calculus", Difficulty::Easy, true, 30.0),
        OutcomeRecord::new("u1", "Calculus", Difficulty::Easy, true, 30.0),
        OutcomeRecord::new("u1", "Calculus", Difficulty::Medium, false, 45.0),
    ];
    for record in &records {
        env.engine.record_outcome(record).await.expect("record");
    }

    let detail = env
        .engine
        .predict_detailed("u1", "Calculus", Difficulty::Medium)
        .await;
    assert_eq!(detail.regime, CorrectionRegime::EarlyLearning);
    assert!(
        (0.15..=0.35).contains(&detail.prediction.probability),
        "got {}",
        detail.prediction.probability
    );
    let easy = env.engine.predict("u1", "Calculus", Difficulty::Easy).await;
    assert!(easy.probability > detail.prediction.probability);
}

#[tokio::test]
async fn test_consecutive_successes_never_lower_prediction() {
    let env = test_env(sync_config()).await;
    let mut previous = 0.0;
    for i in 0..10 {
        let prediction = env.engine.predict("u1", "Geometry", Difficulty::Easy).await;
        assert!(
            prediction.probability >= previous,
            "step {i}: {} < {previous}",
            prediction.probability
        );
        previous = prediction.probability;

        let record = OutcomeRecord::new("u1", "Geometry", Difficulty::Easy, true, 12.0);
        env.engine.record_outcome(&record).await.expect("record");
    }
    assert!(previous > 0.5);
}

#[tokio::test]
async fn test_five_sync_triggers_train_once_and_reset_counter() {
    let env = test_env(sync_config()).await;
    let mut records = mixed_history("u1", "algebra", 8);
    records.extend(mixed_history("u2", "algebra", 6));
    seed(&env.store, &records).await;

    let mut trained_at = Vec::new();
    for call in 1..=5 {
        let completion = env
            .engine
            .on_task_completed_with("u1", "algebra", TrainingMode::Sync)
            .await
            .expect("trigger");
        let tracker = env.engine.tracker_state().await.expect("tracker");
        trained_at.push(tracker.last_trained_at);
        if call < 5 {
            assert!(!completion.training_triggered);
            assert_eq!(completion.counter, call);
        } else {
            assert!(completion.training_triggered);
            assert!(!completion.training_scheduled);
            assert_eq!(completion.counter, 0);
            assert_eq!(tracker.n_samples_since_training, 0);
            assert_eq!(tracker.n_samples_at_last_training, 14);
        }
    }
    assert!(trained_at[..4].iter().all(Option::is_none));
    assert!(trained_at[4].is_some());

    let stats = env.engine.get_model_stats("algebra").expect("model trained");
    assert_eq!(stats.n_users, 2);
    assert_eq!(stats.n_training_samples, 14);
}

#[tokio::test]
async fn test_force_train_requires_minimum_samples() {
    let env = test_env(sync_config()).await;
    seed(&env.store, &mixed_history("u1", "algebra", 5)).await;
    assert_eq!(env.engine.trigger_phase().await.expect("phase"), TriggerPhase::Idle);
    let before = env.engine.tracker_state().await.expect("tracker");

    let report = env.engine.force_train().await.expect("force train");
    assert_eq!(
        report,
        TrainingReport::InsufficientData {
            available: 5,
            required: 10
        }
    );

    let after = env.engine.tracker_state().await.expect("tracker");
    assert_eq!(before, after);
    assert!(load_topic_model(&env.store, "algebra").await.expect("load").is_none());
}

#[tokio::test]
async fn test_async_trigger_reports_through_handle() {
    let mut config = EngineConfig::default();
    config.trigger.mode = TrainingMode::Async;
    let env = test_env(config).await;
    seed(&env.store, &mixed_history("u1", "algebra", 12)).await;

    let mut handle = None;
    for _ in 0..5 {
        let completion = env.engine.on_task_completed("u1", "algebra").await.expect("trigger");
        if completion.training_scheduled {
            assert!(completion.training_triggered);
            assert_eq!(completion.counter, 5);
            handle = completion.training;
        }
    }

    let report = handle.expect("training scheduled").wait().await.expect("training");
    assert_eq!(env.engine.trigger_phase().await.expect("phase"), TriggerPhase::Idle);
    assert!(report.is_completed());
    assert_eq!(env.engine.tracker_state().await.expect("tracker").n_samples_since_training, 0);
    assert!(env.engine.get_model_stats("algebra").is_some());
    assert!(!env.engine.is_training());
}

#[tokio::test]
async fn test_predict_is_idempotent_and_bounded() {
    let env = test_env(sync_config()).await;
    let mut records = mixed_history("u1", "algebra", 40);
    records.extend(mixed_history("u2", "algebra", 30));
    records.push(outcome("u3", "algebra", Difficulty::Hard, false, 0.01, 100));
    records.push(outcome("u3", "algebra", Difficulty::Hard, true, 5000.0, 101));
    records.push(outcome("u3", "algebra", Difficulty::Easy, false, 2000.0, 102));
    seed(&env.store, &records).await;
    assert!(env.engine.force_train().await.expect("train").is_completed());

    for user in ["u1", "u2", "u3", "nobody"] {
        for difficulty in Difficulty::ALL {
            let first = env.engine.predict(user, "algebra", difficulty).await;
            let second = env.engine.predict(user, "algebra", difficulty).await;
            assert_eq!(first, second);
            assert!((0.01..=0.99).contains(&first.probability));
            assert!((5.0..=600.0).contains(&first.seconds));
        }
    }
}

#[tokio::test]
async fn test_difficulty_ordering_holds() {
    let env = test_env(sync_config()).await;
    let mut records = mixed_history("u1", "algebra", 45);
    records.extend(mixed_history("u2", "algebra", 24));
    seed(&env.store, &records).await;
    env.engine.force_train().await.expect("train");

    for user in ["u1", "u2", "u9"] {
        let easy = env.engine.predict(user, "algebra", Difficulty::Easy).await;
        let medium = env.engine.predict(user, "algebra", Difficulty::Medium).await;
        let hard = env.engine.predict(user, "algebra", Difficulty::Hard).await;
        assert!(easy.probability >= medium.probability, "{user}: easy < medium");
        assert!(medium.probability >= hard.probability, "{user}: medium < hard");
    }
}

/// 50 medium outcomes at ~53% success, all answered in exactly 60s, so every time
/// feature is constant in the training data.
fn steady_history() -> Vec<OutcomeRecord> {
    (0..50)
        .map(|i| outcome("steady", "algebra", Difficulty::Medium, i % 15 < 8, 60.0, i))
        .collect()
}

async fn outlier_swing(config: EngineConfig) -> (PredictionDetail, PredictionDetail) {
    let env = test_env(config).await;
    seed(&env.store, &steady_history()).await;
    env.engine.force_train().await.expect("train");
    let before = env
        .engine
        .predict_detailed("steady", "algebra", Difficulty::Medium)
        .await;

    let outlier = outcome("steady", "algebra", Difficulty::Medium, false, 5.0, 60);
    insert_outcome(&env.store, &outlier).await.expect("insert");
    env.engine.force_train().await.expect("retrain");
    let after = env
        .engine
        .predict_detailed("steady", "algebra", Difficulty::Medium)
        .await;

    let params = env.engine.get_user_parameters("steady", "algebra");
    assert!(params.is_personalized);
    assert!(params.tau >= 0.0);
    (before, after)
}

fn assert_bounded_swing(before: &PredictionDetail, after: &PredictionDetail) {
    let (before, after) = (before.prediction, after.prediction);
    assert!(
        (after.probability - before.probability).abs() <= 0.15,
        "probability moved {} -> {}",
        before.probability,
        after.probability
    );
    assert!(
        ((after.seconds - before.seconds) / before.seconds).abs() <= 0.30,
        "time moved {} -> {}",
        before.seconds,
        after.seconds
    );
}

#[tokio::test]
async fn test_single_outlier_does_not_swing_served_prediction() {
    let (before, after) = outlier_swing(sync_config()).await;
    assert_eq!(before.source, PredictorSource::Embedding);
    assert_eq!(after.source, PredictorSource::Embedding);
    assert_eq!(after.regime, CorrectionRegime::RuleAdjustment);
    assert_bounded_swing(&before, &after);
}

#[tokio::test]
async fn test_single_outlier_does_not_swing_psychometric_prediction() {
    let mut config = sync_config();
    config.embedding.enabled = false;
    let (before, after) = outlier_swing(config).await;
    assert_eq!(before.source, PredictorSource::Psychometric);
    assert_bounded_swing(&before, &after);
}

#[tokio::test]
async fn test_failed_training_leaves_counter_and_parameters() {
    let env = test_env(sync_config()).await;
    seed(&env.store, &mixed_history("u1", "algebra", 12)).await;
    assert!(env.engine.force_train().await.expect("train").is_completed());
    let tracker_before = env.engine.tracker_state().await.expect("tracker");
    let stats_before = env.engine.get_model_stats("algebra").expect("model");
    let params_before = env.engine.get_user_parameters("u1", "algebra");

    seed(&env.store, &mixed_history("u2", "algebra", 6)).await;
    sqlx::query("DROP TABLE user_parameters")
        .execute(env.store.pool())
        .await
        .expect("drop table");

    for call in 1..=4 {
        let completion = env
            .engine
            .on_task_completed_with("u2", "algebra", TrainingMode::Sync)
            .await
            .expect("count");
        assert_eq!(completion.counter, call);
    }
    let failed = env
        .engine
        .on_task_completed_with("u2", "algebra", TrainingMode::Sync)
        .await;
    assert!(matches!(failed, Err(EngineError::Store(_))));

    let tracker = env.engine.tracker_state().await.expect("tracker");
    assert_eq!(tracker.n_samples_since_training, 5);
    assert_eq!(tracker.last_trained_at, tracker_before.last_trained_at);
    assert_eq!(tracker.n_samples_at_last_training, 12);
    assert_eq!(env.engine.get_model_stats("algebra"), Some(stats_before.clone()));
    assert_eq!(env.engine.get_user_parameters("u1", "algebra"), params_before);
    assert!(!env.engine.is_training());

    let stored: i64 = sqlx::query_scalar("SELECT n_training_samples FROM topic_models WHERE topic = 'algebra'")
        .fetch_one(env.store.pool())
        .await
        .expect("stored model");
    assert_eq!(stored, 12);

    // The background path reports the failure through its handle.
    let completion = env
        .engine
        .on_task_completed_with("u2", "algebra", TrainingMode::Async)
        .await
        .expect("count");
    assert!(completion.training_scheduled);
    let result = completion.training.expect("handle").wait().await;
    assert!(result.is_err());
    let tracker = env.engine.tracker_state().await.expect("tracker");
    assert_eq!(tracker.n_samples_since_training, 6);
    assert_eq!(tracker.last_trained_at, tracker_before.last_trained_at);
    assert_eq!(env.engine.get_model_stats("algebra"), Some(stats_before));
}

#[tokio::test]
async fn test_trained_state_survives_reload() {
    let env = test_env(sync_config()).await;
    let mut records = mixed_history("u1", "algebra", 30);
    records.extend(mixed_history("u2", "algebra", 30));
    seed(&env.store, &records).await;
    let report = env.engine.force_train().await.expect("train");
    match report {
        TrainingReport::Completed {
            topics_trained,
            n_samples,
            embedding_trained,
            ..
        } => {
            assert_eq!(topics_trained, vec!["algebra".to_string()]);
            assert_eq!(n_samples, 60);
            assert!(embedding_trained);
        }
        other => panic!("unexpected report {other:?}"),
    }

    let reloaded = PredictionEngine::load(env.store.clone(), sync_config())
        .await
        .expect("reload");
    assert_eq!(
        reloaded.get_model_stats("algebra").map(|s| s.n_training_samples),
        env.engine.get_model_stats("algebra").map(|s| s.n_training_samples)
    );
    let original = env.engine.predict_detailed("u1", "algebra", Difficulty::Medium).await;
    let restored = reloaded.predict_detailed("u1", "algebra", Difficulty::Medium).await;
    assert_eq!(original.source, PredictorSource::Embedding);
    assert_eq!(restored.source, PredictorSource::Embedding);
    assert!((original.prediction.probability - restored.prediction.probability).abs() < 1e-9);

    // Second run accumulates the sample count.
    env.engine.force_train().await.expect("retrain");
    assert_eq!(
        env.engine.get_model_stats("algebra").map(|s| s.n_training_samples),
        Some(120)
    );
    assert_eq!(fetch_completed_outcomes(&env.store, None).await.expect("fetch").len(), 60);
}

#[tokio::test]
async fn test_malformed_embedding_artifacts_are_ignored() {
    let env = test_env(sync_config()).await;
    sqlx::query(
        "INSERT INTO embedding_artifacts (id, payload, n_samples, trained_at) VALUES (1, '{\"broken\": true}', 99, '2024-01-01T00:00:00Z')",
    )
    .execute(env.store.pool())
    .await
    .expect("write garbage");

    let engine = PredictionEngine::load(env.store.clone(), sync_config())
        .await
        .expect("load survives bad artifacts");
    let prediction = engine.predict("u1", "algebra", Difficulty::Easy).await;
    assert_eq!((prediction.probability, prediction.seconds), (0.5, 60.0));
}

#[tokio::test]
async fn test_negative_tau_repaired_on_load() {
    let env = test_env(sync_config()).await;
    seed(&env.store, &mixed_history("u1", "algebra", 12)).await;
    env.engine.force_train().await.expect("train");
    sqlx::query("UPDATE user_parameters SET tau = -1.5 WHERE user_id = 'u1'")
        .execute(env.store.pool())
        .await
        .expect("corrupt tau");

    let reloaded = PredictionEngine::load(env.store.clone(), sync_config())
        .await
        .expect("reload");
    let params = reloaded.get_user_parameters("u1", "algebra");
    assert!((params.tau - 1.5).abs() < 1e-12);

    let tracker = read_tracker_state(&env.store, 5).await.expect("tracker");
    assert!(tracker.last_trained_at.is_some());
}
