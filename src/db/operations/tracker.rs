use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::db::{Store, StoreError};
use crate::engine::types::TrackerState;

fn tracker_from_row(row: &SqliteRow) -> Result<TrackerState, StoreError> {
    Ok(TrackerState {
        last_trained_at: row.try_get("last_trained_at")?,
        n_samples_at_last_training: row.try_get("n_samples_at_last_training")?,
        n_samples_since_training: row.try_get("n_samples_since_training")?,
        threshold: row.try_get("threshold")?,
    })
}

async fn ensure_tracker_row(store: &Store, threshold: i64) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO training_tracker (id, threshold) VALUES (1, ?)")
        .bind(threshold)
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Reads the persisted tracker, creating a zeroed row with `threshold` on first use.
pub async fn read_tracker_state(store: &Store, threshold: i64) -> Result<TrackerState, StoreError> {
    ensure_tracker_row(store, threshold).await?;
    let row = sqlx::query(
        "SELECT last_trained_at, n_samples_at_last_training, n_samples_since_training, threshold \
         FROM training_tracker WHERE id = 1",
    )
    .fetch_one(store.pool())
    .await?;
    tracker_from_row(&row)
}

pub async fn write_tracker_state(store: &Store, state: &TrackerState) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO training_tracker
            (id, last_trained_at, n_samples_at_last_training, n_samples_since_training, threshold)
        VALUES (1, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            last_trained_at = excluded.last_trained_at,
            n_samples_at_last_training = excluded.n_samples_at_last_training,
            n_samples_since_training = excluded.n_samples_since_training,
            threshold = excluded.threshold
        "#,
    )
    .bind(state.last_trained_at)
    .bind(state.n_samples_at_last_training)
    .bind(state.n_samples_since_training)
    .bind(state.threshold)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Adds one outcome to the global counter and returns the new state.
pub async fn increment_counter(store: &Store, threshold: i64) -> Result<TrackerState, StoreError> {
    ensure_tracker_row(store, threshold).await?;
    let row = sqlx::query(
        r#"
        UPDATE training_tracker
        SET n_samples_since_training = n_samples_since_training + 1,
            threshold = ?
        WHERE id = 1
        RETURNING last_trained_at, n_samples_at_last_training, n_samples_since_training, threshold
        "#,
    )
    .bind(threshold)
    .fetch_one(store.pool())
    .await?;
    tracker_from_row(&row)
}

pub async fn complete_training(
    conn: &mut SqliteConnection,
    consumed: i64,
    total_samples: i64,
    trained_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE training_tracker
        SET n_samples_since_training = MAX(n_samples_since_training - ?, 0),
            n_samples_at_last_training = ?,
            last_trained_at = ?
        WHERE id = 1
        "#,
    )
    .bind(consumed)
    .bind(total_samples)
    .bind(trained_at)
    .execute(conn)
    .await?;
    Ok(())
}
