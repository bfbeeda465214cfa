#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use adaptive_practice_engine::db::operations::insert_outcome;
use adaptive_practice_engine::db::Store;
use adaptive_practice_engine::engine::{
    Difficulty, EngineConfig, OutcomeRecord, PredictionEngine, TrainingMode,
};

pub struct TestEnv {
    pub engine: PredictionEngine,
    pub store: Store,
    pub dir: TempDir,
}

pub async fn open_store(dir: &TempDir) -> Store {
    let db_path = dir.path().join("engine.db");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    Store::connect(&db_url).await.expect("open sqlite store")
}

pub fn sync_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.trigger.mode = TrainingMode::Sync;
    config
}

pub async fn test_env(config: EngineConfig) -> TestEnv {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    let engine = PredictionEngine::load(store.clone(), config)
        .await
        .expect("load engine");
    TestEnv { engine, store, dir }
}

pub fn base_time() -> DateTime<Utc> {
    Utc::now() - Duration::days(7)
}

pub fn outcome(
    user_id: &str,
    topic: &str,
    difficulty: Difficulty,
    correct: bool,
    seconds: f64,
    minute: i64,
) -> OutcomeRecord {
    OutcomeRecord::new(user_id, topic, difficulty, correct, seconds)
        .with_created_at(base_time() + Duration::minutes(minute))
}

/// Inserts records without touching the training counter.
pub async fn seed(store: &Store, records: &[OutcomeRecord]) {
    for record in records {
        insert_outcome(store, record).await.expect("insert outcome");
    }
}
