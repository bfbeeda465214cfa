pub mod operations;
pub mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::engine::embedding::EmbeddingModel;
use crate::engine::parameters::TopicModel;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Handle on the SQLite database shared with the surrounding application.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

/// Everything a finished training run writes, committed in one transaction.
pub struct TrainingCommit<'a> {
    pub models: &'a [TopicModel],
    pub embedding: Option<&'a EmbeddingModel>,
    /// Counter value consumed by this run; outcomes recorded while training stay counted.
    pub consumed: i64,
    pub total_samples: i64,
    pub trained_at: DateTime<Utc>,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = schema::split_sql_statements(schema::SCHEMA_SQL);
        for stmt in &statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        info!(statements = statements.len(), "database schema ready");
        Ok(())
    }

    /// Writes new parameters and resets the counter atomically; either all of it lands or none.
    pub async fn commit_training(&self, commit: TrainingCommit<'_>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for model in commit.models {
            operations::models::upsert_topic_model(&mut tx, model).await?;
        }
        if let Some(embedding) = commit.embedding {
            operations::embeddings::save_embedding_artifacts(&mut tx, embedding).await?;
        }
        operations::tracker::complete_training(
            &mut tx,
            commit.consumed,
            commit.total_samples,
            commit.trained_at,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
