use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::{Store, StoreError};
use crate::engine::types::{Difficulty, OutcomeRecord};

const OUTCOME_COLUMNS: &str = "user_id, topic, difficulty, correct, response_time, \
     predicted_correct, predicted_time, created_at";

fn outcome_from_row(row: &SqliteRow) -> Result<OutcomeRecord, StoreError> {
    let level: i64 = row.try_get("difficulty")?;
    let difficulty = Difficulty::from_level(level)
        .ok_or_else(|| StoreError::Malformed(format!("difficulty level {level}")))?;
    Ok(OutcomeRecord {
        user_id: row.try_get("user_id")?,
        topic: row.try_get("topic")?,
        difficulty,
        correct: row.try_get("correct")?,
        response_time: row.try_get("response_time")?,
        predicted_correct: row.try_get("predicted_correct")?,
        predicted_time: row.try_get("predicted_time")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert_outcome(store: &Store, record: &OutcomeRecord) -> Result<i64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO outcome_records
            (user_id, topic, difficulty, correct, response_time, predicted_correct, predicted_time, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.user_id)
    .bind(&record.topic)
    .bind(record.difficulty.level() as i64)
    .bind(record.correct)
    .bind(record.response_time)
    .bind(record.predicted_correct)
    .bind(record.predicted_time)
    .bind(record.created_at)
    .execute(store.pool())
    .await?;
    Ok(result.last_insert_rowid())
}

/// All completed outcomes in chronological order, optionally for one topic.
pub async fn fetch_completed_outcomes(
    store: &Store,
    topic: Option<&str>,
) -> Result<Vec<OutcomeRecord>, StoreError> {
    let rows = match topic {
        Some(topic) => {
            sqlx::query(&format!(
                "SELECT {OUTCOME_COLUMNS} FROM outcome_records WHERE topic = ? ORDER BY created_at, id"
            ))
            .bind(topic)
            .fetch_all(store.pool())
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {OUTCOME_COLUMNS} FROM outcome_records ORDER BY created_at, id"
            ))
            .fetch_all(store.pool())
            .await?
        }
    };
    rows.iter().map(outcome_from_row).collect()
}

pub async fn fetch_user_outcomes(
    store: &Store,
    user_id: &str,
    topic: Option<&str>,
) -> Result<Vec<OutcomeRecord>, StoreError> {
    let rows = match topic {
        Some(topic) => {
            sqlx::query(&format!(
                "SELECT {OUTCOME_COLUMNS} FROM outcome_records \
                 WHERE user_id = ? AND topic = ? ORDER BY created_at, id"
            ))
            .bind(user_id)
            .bind(topic)
            .fetch_all(store.pool())
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {OUTCOME_COLUMNS} FROM outcome_records WHERE user_id = ? ORDER BY created_at, id"
            ))
            .bind(user_id)
            .fetch_all(store.pool())
            .await?
        }
    };
    rows.iter().map(outcome_from_row).collect()
}

pub async fn count_outcomes(store: &Store) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outcome_records")
        .fetch_one(store.pool())
        .await?;
    Ok(count)
}
