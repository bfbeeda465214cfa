use sqlx::{Row, SqliteConnection};
use tracing::warn;

use crate::db::{Store, StoreError};
use crate::engine::embedding::EmbeddingModel;

/// Loads the saved embedding predictor. A payload that does not parse or fails validation
/// is reported and treated as absent.
pub async fn load_embedding_artifacts(store: &Store) -> Result<Option<EmbeddingModel>, StoreError> {
    let row = sqlx::query("SELECT payload FROM embedding_artifacts WHERE id = 1")
        .fetch_optional(store.pool())
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let payload: String = row.try_get("payload")?;
    let model: EmbeddingModel = match serde_json::from_str(&payload) {
        Ok(model) => model,
        Err(e) => {
            warn!(error = %e, "discarding unreadable embedding artifacts");
            return Ok(None);
        }
    };
    if let Err(e) = model.validate() {
        warn!(error = %e, "discarding invalid embedding artifacts");
        return Ok(None);
    }
    Ok(Some(model))
}

pub async fn save_embedding_artifacts(
    conn: &mut SqliteConnection,
    model: &EmbeddingModel,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(model)?;
    sqlx::query(
        r#"
        INSERT INTO embedding_artifacts (id, payload, n_samples, trained_at)
        VALUES (1, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            payload = excluded.payload,
            n_samples = excluded.n_samples,
            trained_at = excluded.trained_at
        "#,
    )
    .bind(payload)
    .bind(model.n_samples as i64)
    .bind(model.trained_at)
    .execute(conn)
    .await?;
    Ok(())
}
