use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::config::ParameterBounds;
use crate::engine::types::{Difficulty, UserParameters};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Discrimination.
    pub a: f64,
    /// Difficulty.
    pub b: f64,
    /// Time intensity.
    pub beta: f64,
}

/// Shared item parameters for one topic, one entry per difficulty level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicItemParameters {
    pub easy: ItemParams,
    pub medium: ItemParams,
    pub hard: ItemParams,
    pub sigma: f64,
}

impl Default for TopicItemParameters {
    fn default() -> Self {
        Self {
            easy: ItemParams { a: 1.0, b: -1.0, beta: 3.5 },
            medium: ItemParams { a: 1.0, b: 0.0, beta: 4.0 },
            hard: ItemParams { a: 1.0, b: 1.0, beta: 4.5 },
            sigma: 0.6,
        }
    }
}

impl TopicItemParameters {
    pub fn get(&self, difficulty: Difficulty) -> &ItemParams {
        match difficulty {
            Difficulty::Easy => &self.easy,
            Difficulty::Medium => &self.medium,
            Difficulty::Hard => &self.hard,
        }
    }

    pub fn get_mut(&mut self, difficulty: Difficulty) -> &mut ItemParams {
        match difficulty {
            Difficulty::Easy => &mut self.easy,
            Difficulty::Medium => &mut self.medium,
            Difficulty::Hard => &mut self.hard,
        }
    }

    pub fn mean_beta(&self) -> f64 {
        (self.easy.beta + self.medium.beta + self.hard.beta) / 3.0
    }

    /// Clamps every value into `bounds`; non-finite values fall back to the defaults.
    /// Returns the number of values that had to change.
    pub fn sanitize(&mut self, bounds: &ParameterBounds) -> usize {
        let defaults = Self::default();
        let mut repaired = 0;
        for difficulty in Difficulty::ALL {
            let fallback = *defaults.get(difficulty);
            let item = self.get_mut(difficulty);
            repaired += repair(&mut item.a, fallback.a, |v| bounds.discrimination.clamp(v));
            repaired += repair(&mut item.b, fallback.b, |v| bounds.difficulty.clamp(v));
            repaired += repair(&mut item.beta, fallback.beta, |v| bounds.time_intensity.clamp(v));
        }
        repaired += repair(&mut self.sigma, defaults.sigma, |v| bounds.sigma.clamp(v));
        repaired
    }
}

fn repair(value: &mut f64, fallback: f64, clamp: impl Fn(f64) -> f64) -> usize {
    let fixed = if value.is_finite() { clamp(*value) } else { fallback };
    if fixed != *value {
        *value = fixed;
        1
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserAbilitySpeed {
    pub theta: f64,
    pub tau: f64,
    pub n_samples: usize,
}

impl UserAbilitySpeed {
    pub fn new(theta: f64, tau: f64, n_samples: usize) -> Self {
        Self { theta, tau, n_samples }
    }

    /// Negative speed is a modeling defect: flip the sign and report whether a repair happened.
    pub fn repair_tau(&mut self) -> bool {
        if self.tau < 0.0 {
            self.tau = self.tau.abs();
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicModel {
    pub topic: String,
    pub items: TopicItemParameters,
    pub users: HashMap<String, UserAbilitySpeed>,
    pub n_training_samples: u64,
    pub last_trained_at: Option<DateTime<Utc>>,
}

impl TopicModel {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            items: TopicItemParameters::default(),
            users: HashMap::new(),
            n_training_samples: 0,
            last_trained_at: None,
        }
    }

    pub fn population_mean(&self) -> (f64, f64) {
        if self.users.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.users.len() as f64;
        let theta = self.users.values().map(|u| u.theta).sum::<f64>() / n;
        let tau = self.users.values().map(|u| u.tau).sum::<f64>() / n;
        (theta, tau)
    }

    pub fn user_parameters(&self, user_id: &str) -> UserParameters {
        match self.users.get(user_id) {
            Some(user) => UserParameters {
                theta: user.theta,
                tau: user.tau,
                is_personalized: true,
            },
            None => {
                let (theta, tau) = self.population_mean();
                UserParameters {
                    theta,
                    tau,
                    is_personalized: false,
                }
            }
        }
    }

    /// Load-boundary validation: clamps item values, repairs negative or non-finite user values.
    pub fn validate(&mut self, bounds: &ParameterBounds) -> usize {
        let mut repaired = self.items.sanitize(bounds);
        self.users.retain(|user_id, user| {
            let keep = user.theta.is_finite() && user.tau.is_finite();
            if !keep {
                tracing::warn!(user_id = %user_id, "dropping non-finite user parameters");
            }
            keep
        });
        for (user_id, user) in self.users.iter_mut() {
            if user.repair_tau() {
                tracing::warn!(user_id = %user_id, tau = user.tau, "repaired negative tau on load");
                repaired += 1;
            }
            let theta = bounds.theta.clamp(user.theta);
            let tau = bounds.tau.clamp(user.tau);
            if theta != user.theta || tau != user.tau {
                repaired += 1;
            }
            user.theta = theta;
            user.tau = tau;
        }
        repaired
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            topic: self.topic.clone(),
            n_users: self.users.len(),
            n_training_samples: self.n_training_samples,
            last_trained_at: self.last_trained_at,
            item_parameters: self.items.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub topic: String,
    pub n_users: usize,
    pub n_training_samples: u64,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub item_parameters: TopicItemParameters,
}

/// Keyed store of per-topic models. Readers clone snapshots; the trainer swaps whole models.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    models: Arc<RwLock<HashMap<String, Arc<TopicModel>>>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str) -> Option<Arc<TopicModel>> {
        self.models.read().get(topic).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.models.read().contains_key(topic)
    }

    pub fn insert(&self, model: TopicModel) {
        let mut guard = self.models.write();
        guard.insert(model.topic.clone(), Arc::new(model));
    }

    pub fn replace_all(&self, models: impl IntoIterator<Item = TopicModel>) {
        let mut guard = self.models.write();
        for model in models {
            guard.insert(model.topic.clone(), Arc::new(model));
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<TopicModel>> {
        self.models.read().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.models.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_population_mean_defaults_to_zero() {
        let model = TopicModel::new("algebra");
        assert_eq!(model.population_mean(), (0.0, 0.0));
        let params = model.user_parameters("u1");
        assert!(!params.is_personalized);
    }

    #[test]
    fn test_user_parameters_personalized() {
        let mut model = TopicModel::new("algebra");
        model.users.insert("u1".into(), UserAbilitySpeed::new(1.2, 0.4, 12));
        model.users.insert("u2".into(), UserAbilitySpeed::new(-0.2, 0.2, 8));
        let params = model.user_parameters("u1");
        assert!(params.is_personalized);
        assert_eq!(params.theta, 1.2);

        let fallback = model.user_parameters("u3");
        assert!(!fallback.is_personalized);
        assert!((fallback.theta - 0.5).abs() < 1e-12);
        assert!((fallback.tau - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_validate_repairs_negative_tau_and_bounds() {
        let mut model = TopicModel::new("algebra");
        model.items.medium.a = 9.0;
        model.items.hard.beta = f64::NAN;
        model.users.insert("u1".into(), UserAbilitySpeed::new(0.1, -0.8, 5));
        model.users.insert("u2".into(), UserAbilitySpeed::new(f64::INFINITY, 0.1, 5));

        let repaired = model.validate(&ParameterBounds::default());

        assert!(repaired >= 3);
        assert_eq!(model.items.medium.a, 3.0);
        assert_eq!(model.items.hard.beta, TopicItemParameters::default().hard.beta);
        assert!((model.users["u1"].tau - 0.8).abs() < 1e-12);
        assert!(!model.users.contains_key("u2"));
    }

    #[test]
    fn test_store_swaps_models() {
        let store = ParameterStore::new();
        assert!(store.is_empty());
        store.insert(TopicModel::new("geometry"));
        let mut updated = TopicModel::new("geometry");
        updated.n_training_samples = 42;
        store.replace_all(vec![updated, TopicModel::new("algebra")]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("geometry").map(|m| m.n_training_samples), Some(42));
        assert_eq!(store.topics(), vec!["algebra".to_string(), "geometry".to_string()]);
    }
}
