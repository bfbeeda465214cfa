use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use crate::db::{Store, StoreError};
use crate::engine::parameters::{ItemParams, TopicItemParameters, TopicModel, UserAbilitySpeed};
use crate::engine::types::Difficulty;

/// Persisted shape of the item parameters: `{difficulty: {a, b, beta}}`.
type StoredItems = BTreeMap<Difficulty, ItemParams>;

fn items_to_json(items: &TopicItemParameters) -> Result<String, StoreError> {
    let stored: StoredItems = Difficulty::ALL
        .iter()
        .map(|d| (*d, *items.get(*d)))
        .collect();
    Ok(serde_json::to_string(&stored)?)
}

fn items_from_row(row: &SqliteRow, topic: &str) -> Result<TopicItemParameters, StoreError> {
    let raw: String = row.try_get("item_parameters")?;
    let stored: StoredItems = serde_json::from_str(&raw)?;
    let mut items = TopicItemParameters {
        sigma: row.try_get("sigma")?,
        ..TopicItemParameters::default()
    };
    for difficulty in Difficulty::ALL {
        match stored.get(&difficulty) {
            Some(params) => *items.get_mut(difficulty) = *params,
            None => warn!(
                topic = %topic,
                difficulty = difficulty.as_str(),
                "stored topic model has no parameters for difficulty, using defaults"
            ),
        }
    }
    Ok(items)
}

async fn load_users(
    store: &Store,
    topic: &str,
) -> Result<HashMap<String, UserAbilitySpeed>, StoreError> {
    let rows = sqlx::query("SELECT user_id, theta, tau, n_samples FROM user_parameters WHERE topic = ?")
        .bind(topic)
        .fetch_all(store.pool())
        .await?;

    let mut users = HashMap::with_capacity(rows.len());
    for row in rows {
        let user_id: String = row.try_get("user_id")?;
        let n_samples: i64 = row.try_get("n_samples")?;
        users.insert(
            user_id,
            UserAbilitySpeed::new(
                row.try_get("theta")?,
                row.try_get("tau")?,
                n_samples.max(0) as usize,
            ),
        );
    }
    Ok(users)
}

async fn model_from_row(store: &Store, row: &SqliteRow) -> Result<TopicModel, StoreError> {
    let topic: String = row.try_get("topic")?;
    let items = items_from_row(row, &topic)?;
    let n_training_samples: i64 = row.try_get("n_training_samples")?;
    let users = load_users(store, &topic).await?;
    Ok(TopicModel {
        items,
        users,
        n_training_samples: n_training_samples.max(0) as u64,
        last_trained_at: row.try_get("last_trained_at")?,
        topic,
    })
}

/// Raw persisted model; callers validate against their bounds.
pub async fn load_topic_model(store: &Store, topic: &str) -> Result<Option<TopicModel>, StoreError> {
    let row = sqlx::query(
        "SELECT topic, item_parameters, sigma, n_training_samples, last_trained_at \
         FROM topic_models WHERE topic = ?",
    )
    .bind(topic)
    .fetch_optional(store.pool())
    .await?;

    match row {
        Some(row) => Ok(Some(model_from_row(store, &row).await?)),
        None => Ok(None),
    }
}

pub async fn load_all_topic_models(store: &Store) -> Result<Vec<TopicModel>, StoreError> {
    let rows = sqlx::query(
        "SELECT topic, item_parameters, sigma, n_training_samples, last_trained_at \
         FROM topic_models ORDER BY topic",
    )
    .fetch_all(store.pool())
    .await?;

    let mut models = Vec::with_capacity(rows.len());
    for row in &rows {
        match model_from_row(store, row).await {
            Ok(model) => models.push(model),
            Err(StoreError::Serialization(e)) => {
                let topic: String = row.try_get("topic").unwrap_or_default();
                warn!(topic = %topic, error = %e, "discarding malformed topic model");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(models)
}

/// Upserts a topic and its users. `n_training_samples` is written as accumulated on the model.
pub async fn upsert_topic_model(
    conn: &mut SqliteConnection,
    model: &TopicModel,
) -> Result<(), StoreError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO topic_models (topic, item_parameters, sigma, n_training_samples, last_trained_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (topic) DO UPDATE SET
            item_parameters = excluded.item_parameters,
            sigma = excluded.sigma,
            n_training_samples = excluded.n_training_samples,
            last_trained_at = excluded.last_trained_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&model.topic)
    .bind(items_to_json(&model.items)?)
    .bind(model.items.sigma)
    .bind(model.n_training_samples as i64)
    .bind(model.last_trained_at)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    for (user_id, user) in &model.users {
        sqlx::query(
            r#"
            INSERT INTO user_parameters (topic, user_id, theta, tau, n_samples, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (topic, user_id) DO UPDATE SET
                theta = excluded.theta,
                tau = excluded.tau,
                n_samples = excluded.n_samples,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&model.topic)
        .bind(user_id)
        .bind(user.theta)
        .bind(user.tau)
        .bind(user.n_samples as i64)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Standalone save outside a training run.
pub async fn save_topic_model(store: &Store, model: &TopicModel) -> Result<(), StoreError> {
    let mut tx = store.pool().begin().await?;
    upsert_topic_model(&mut tx, model).await?;
    tx.commit().await?;
    Ok(())
}
