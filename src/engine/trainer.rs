//! Alternating maximum-likelihood estimation of item and person parameters.
//!
//! Each round optimizes the shared item parameters of every difficulty level with
//! person parameters held fixed, refreshes the shared time noise, then optimizes each
//! person's `(theta, tau)` with item parameters held fixed. Updates are damped three
//! ways: L2 pull toward the previous run, EMA blending with the previous run, and
//! training on the full history every time.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::config::{Bounds, ParameterBounds, TrainerParams};
use crate::engine::likelihood::{joint_neg_log_likelihood, logit, Observation};
use crate::engine::optimizer::{minimize_bounded, OptimizeOptions};
use crate::engine::parameters::{ItemParams, TopicItemParameters, TopicModel, UserAbilitySpeed};
use crate::engine::types::{Difficulty, OutcomeRecord, LOG_TIME_OFFSET};

#[derive(Debug, Clone)]
pub enum TopicTraining {
    Trained(TopicTrainingResult),
    InsufficientData { available: usize, required: usize },
}

#[derive(Debug, Clone)]
pub struct TopicTrainingResult {
    pub model: TopicModel,
    pub n_samples: usize,
    pub repaired_taus: usize,
    pub fallbacks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserFit {
    pub theta: f64,
    pub tau: f64,
    pub used_fallback: bool,
}

/// Aggregate prediction error of a user's answered tasks.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PredictionBias {
    /// Mean of `actual_correct - predicted_correct`.
    pub correctness: f64,
    /// Mean of `ln(actual + 0.1) - ln(predicted + 0.1)`.
    pub time_log: f64,
    pub n: usize,
}

impl PredictionBias {
    pub fn from_records(records: &[&OutcomeRecord]) -> Self {
        let mut correctness = 0.0;
        let mut time_log = 0.0;
        let mut n = 0usize;
        for record in records {
            let (Some(pc), Some(pt)) = (record.predicted_correct, record.predicted_time) else {
                continue;
            };
            correctness += record.correct_value() - pc;
            time_log += record.log_time() - (pt.max(0.0) + LOG_TIME_OFFSET).ln();
            n += 1;
        }
        if n == 0 {
            return Self::default();
        }
        Self {
            correctness: correctness / n as f64,
            time_log: time_log / n as f64,
            n,
        }
    }
}

struct UserData<'r> {
    records: Vec<&'r OutcomeRecord>,
    by_difficulty: [Vec<Observation>; 3],
}

impl<'r> UserData<'r> {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            by_difficulty: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    fn push(&mut self, record: &'r OutcomeRecord) {
        self.by_difficulty[record.difficulty.index()].push(Observation::from(record));
        self.records.push(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn accuracy(&self) -> f64 {
        self.records.iter().map(|r| r.correct_value()).sum::<f64>() / self.len().max(1) as f64
    }

    fn mean_time(&self) -> f64 {
        self.records.iter().map(|r| r.response_time).sum::<f64>() / self.len().max(1) as f64
    }

    fn prediction_records(&self) -> usize {
        self.records.iter().filter(|r| r.has_prediction()).count()
    }
}

pub struct AlternatingTrainer<'a> {
    bounds: &'a ParameterBounds,
    params: &'a TrainerParams,
}

impl<'a> AlternatingTrainer<'a> {
    pub fn new(bounds: &'a ParameterBounds, params: &'a TrainerParams) -> Self {
        Self { bounds, params }
    }

    fn options(&self) -> OptimizeOptions {
        OptimizeOptions::with_max_iterations(self.params.max_iterations)
    }

    fn l2_weight(&self, n: usize) -> f64 {
        self.params.l2_strength * self.params.l2_pivot / (self.params.l2_pivot + n as f64)
    }

    fn ema_weight(&self, n: usize) -> f64 {
        let n = n as f64;
        (n / (n + self.params.ema_pivot)).clamp(self.params.ema_min, self.params.ema_max)
    }

    /// Trains one topic on its full history. `outcomes` may contain other topics; they are ignored.
    pub fn train_topic(
        &self,
        topic: &str,
        previous: Option<&TopicModel>,
        outcomes: &[OutcomeRecord],
    ) -> TopicTraining {
        let mut users: BTreeMap<&str, UserData> = BTreeMap::new();
        let mut level_counts = [0usize; 3];
        for record in outcomes.iter().filter(|r| r.topic == topic) {
            level_counts[record.difficulty.index()] += 1;
            users
                .entry(record.user_id.as_str())
                .or_insert_with(UserData::new)
                .push(record);
        }

        let n_samples: usize = level_counts.iter().sum();
        if n_samples < self.params.min_training_samples {
            debug!(
                topic = %topic,
                available = n_samples,
                required = self.params.min_training_samples,
                "skipping topic training: insufficient data"
            );
            return TopicTraining::InsufficientData {
                available: n_samples,
                required: self.params.min_training_samples,
            };
        }

        let (prior_theta, prior_tau) = previous
            .map(|m| m.population_mean())
            .unwrap_or((0.0, 0.0));

        let anchor_items = match previous {
            Some(model) => model.items.clone(),
            None => self.initial_items(&users),
        };
        let mut items = anchor_items.clone();

        let anchors: BTreeMap<&str, (f64, f64)> = users
            .iter()
            .map(|(user_id, data)| {
                let anchor = previous
                    .and_then(|m| m.users.get(*user_id))
                    .map(|u| (u.theta, u.tau))
                    .unwrap_or_else(|| self.moment_start(data, &items, (prior_theta, prior_tau)));
                (*user_id, anchor)
            })
            .collect();
        let mut estimates = anchors.clone();
        let mut fallbacks = 0usize;

        for round in 0..self.params.em_rounds {
            for difficulty in Difficulty::ALL {
                let n_level = level_counts[difficulty.index()];
                if n_level == 0 {
                    continue;
                }
                let fitted = self.fit_item(
                    difficulty,
                    &items,
                    anchor_items.get(difficulty),
                    &users,
                    &estimates,
                    n_level,
                );
                *items.get_mut(difficulty) = fitted;
            }

            items.sigma = self.residual_sigma(&items, &users, &estimates);

            let last_round = round + 1 == self.params.em_rounds;
            for (user_id, data) in users.iter() {
                let anchor = anchors[user_id];
                let start = estimates[user_id];
                let error_aware = last_round
                    && data.prediction_records() >= self.params.min_error_aware_samples;
                let fit = if error_aware {
                    self.train_user_error_aware(anchor, start, &items, &data.records)
                } else {
                    self.fit_user(anchor, start, &items, data)
                };
                if fit.used_fallback {
                    fallbacks += 1;
                }
                estimates.insert(*user_id, (fit.theta, fit.tau));
            }
        }

        let mut model = previous
            .cloned()
            .unwrap_or_else(|| TopicModel::new(topic));

        if previous.is_some() {
            for difficulty in Difficulty::ALL {
                let w = self.ema_weight(level_counts[difficulty.index()]);
                let old = *anchor_items.get(difficulty);
                let fresh = *items.get(difficulty);
                *model.items.get_mut(difficulty) = ItemParams {
                    a: blend(fresh.a, old.a, w),
                    b: blend(fresh.b, old.b, w),
                    beta: blend(fresh.beta, old.beta, w),
                };
            }
            let w = self.ema_weight(n_samples);
            model.items.sigma = blend(items.sigma, anchor_items.sigma, w);
        } else {
            model.items = items;
        }
        model.items.sanitize(self.bounds);

        let mut repaired_taus = 0usize;
        for (user_id, data) in users.iter() {
            let (theta, tau) = estimates[user_id];
            let previous_user = previous.and_then(|m| m.users.get(*user_id));
            let (theta, tau) = match previous_user {
                Some(old) => {
                    let w = self.ema_weight(data.len());
                    (blend(theta, old.theta, w), blend(tau, old.tau, w))
                }
                None => (theta, tau),
            };
            let mut user = UserAbilitySpeed::new(theta, tau, data.len());
            if user.repair_tau() {
                warn!(topic = %topic, user_id = %user_id, tau = user.tau, "anomaly: negative tau repaired after training");
                repaired_taus += 1;
            }
            user.theta = self.bounds.theta.clamp(user.theta);
            user.tau = self.bounds.tau.clamp(user.tau);
            model.users.insert((*user_id).to_string(), user);
        }

        model.topic = topic.to_string();
        model.n_training_samples += n_samples as u64;
        model.last_trained_at = Some(Utc::now());

        info!(
            topic = %topic,
            n_samples,
            n_users = users.len(),
            repaired_taus,
            fallbacks,
            sigma = model.items.sigma,
            "topic model trained"
        );

        TopicTraining::Trained(TopicTrainingResult {
            model,
            n_samples,
            repaired_taus,
            fallbacks,
        })
    }

    /// Error-aware person update: the plain likelihood plus a penalty on moves that go against
    /// the observed prediction bias, followed by an explicit bias nudge.
    pub fn train_user_error_aware(
        &self,
        anchor: (f64, f64),
        start: (f64, f64),
        items: &TopicItemParameters,
        records: &[&OutcomeRecord],
    ) -> UserFit {
        let bias = PredictionBias::from_records(records);
        let observations = split_by_difficulty(records);
        let n = records.len().max(1);
        let lambda = self.l2_weight(n);
        let penalty = self.params.direction_penalty;
        let (theta0, tau0) = anchor;

        let objective = |x: &[f64]| {
            let (theta, tau) = (x[0], x[1]);
            let mut value = person_nll(theta, tau, items, &observations) / n as f64
                + lambda * ((theta - theta0).powi(2) + (tau - tau0).powi(2));

            let wrong_theta = if bias.correctness > 0.0 {
                (theta0 - theta).max(0.0)
            } else {
                (theta - theta0).max(0.0)
            };
            // Slower than predicted means speed should drop, and vice versa.
            let wrong_tau = if bias.time_log > 0.0 {
                (tau - tau0).max(0.0)
            } else {
                (tau0 - tau).max(0.0)
            };
            value += penalty * bias.correctness.abs() * wrong_theta;
            value += penalty * bias.time_log.abs() * wrong_tau;
            value
        };

        let result = minimize_bounded(
            objective,
            &[start.0, start.1],
            &[self.bounds.theta, self.bounds.tau],
            &self.options(),
        );

        let (mut theta, mut tau, used_fallback) = if result.is_usable() {
            (result.x[0], result.x[1], false)
        } else {
            let accuracy = records.iter().map(|r| r.correct_value()).sum::<f64>() / n as f64;
            let avg_time = records.iter().map(|r| r.response_time).sum::<f64>() / n as f64;
            let (theta_m, tau_m) = self.closed_form(accuracy, avg_time, items);
            let w = self.params.fallback_blend;
            warn!(
                iterations = result.iterations,
                "error-aware optimization did not converge, using closed-form estimate"
            );
            (blend(theta_m, theta0, w), blend(tau_m, tau0, w), true)
        };

        if bias.correctness.abs() > self.params.correctness_bias_threshold {
            theta += self.params.correctness_nudge * bias.correctness;
        }
        if bias.time_log.abs() > self.params.time_bias_threshold {
            tau -= self.params.time_nudge * bias.time_log;
        }
        if tau < 0.0 {
            warn!(tau, "anomaly: negative tau after error-aware update");
            tau = tau.abs();
        }

        UserFit {
            theta: self.bounds.theta.clamp(theta),
            tau: self.bounds.tau.clamp(tau),
            used_fallback,
        }
    }

    fn fit_user(
        &self,
        anchor: (f64, f64),
        start: (f64, f64),
        items: &TopicItemParameters,
        data: &UserData,
    ) -> UserFit {
        let n = data.len().max(1);
        let lambda = self.l2_weight(n);
        let (theta0, tau0) = anchor;
        let objective = |x: &[f64]| {
            person_nll(x[0], x[1], items, &data.by_difficulty) / n as f64
                + lambda * ((x[0] - theta0).powi(2) + (x[1] - tau0).powi(2))
        };
        let result = minimize_bounded(
            objective,
            &[start.0, start.1],
            &[self.bounds.theta, self.bounds.tau],
            &self.options(),
        );

        if result.value.is_finite() && result.x.iter().all(|v| v.is_finite()) {
            if !result.converged {
                debug!(iterations = result.iterations, "person step hit iteration budget");
            }
            return UserFit {
                theta: result.x[0],
                tau: result.x[1],
                used_fallback: false,
            };
        }

        let (theta_m, tau_m) = self.closed_form(data.accuracy(), data.mean_time(), items);
        let w = self.params.fallback_blend;
        warn!("person optimization produced non-finite values, using closed-form estimate");
        UserFit {
            theta: self.bounds.theta.clamp(blend(theta_m, theta0, w)),
            tau: self.bounds.tau.clamp(blend(tau_m, tau0, w)),
            used_fallback: true,
        }
    }

    fn fit_item(
        &self,
        difficulty: Difficulty,
        items: &TopicItemParameters,
        anchor: &ItemParams,
        users: &BTreeMap<&str, UserData>,
        estimates: &BTreeMap<&str, (f64, f64)>,
        n_level: usize,
    ) -> ItemParams {
        let sigma = items.sigma;
        let idx = difficulty.index();
        let lambda = self.l2_weight(n_level);
        let current = *items.get(difficulty);

        let objective = |x: &[f64]| {
            let nll: f64 = users
                .iter()
                .map(|(user_id, data)| {
                    let (theta, tau) = estimates[user_id];
                    joint_neg_log_likelihood(theta, tau, x[0], x[1], x[2], sigma, &data.by_difficulty[idx])
                })
                .sum();
            nll / n_level as f64
                + lambda
                    * ((x[0] - anchor.a).powi(2)
                        + (x[1] - anchor.b).powi(2)
                        + (x[2] - anchor.beta).powi(2))
        };

        let bounds: [Bounds; 3] = [
            self.bounds.discrimination,
            self.bounds.difficulty,
            self.bounds.time_intensity,
        ];
        let result = minimize_bounded(
            objective,
            &[current.a, current.b, current.beta],
            &bounds,
            &self.options(),
        );

        if !(result.value.is_finite() && result.x.iter().all(|v| v.is_finite())) {
            warn!(difficulty = difficulty.as_str(), "item optimization failed, keeping previous values");
            return current;
        }
        if !result.converged {
            debug!(difficulty = difficulty.as_str(), iterations = result.iterations, "item step hit iteration budget");
        }
        ItemParams {
            a: result.x[0],
            b: result.x[1],
            beta: result.x[2],
        }
    }

    fn residual_sigma(
        &self,
        items: &TopicItemParameters,
        users: &BTreeMap<&str, UserData>,
        estimates: &BTreeMap<&str, (f64, f64)>,
    ) -> f64 {
        let mut sum_sq = 0.0;
        let mut n = 0usize;
        for (user_id, data) in users.iter() {
            let (_, tau) = estimates[user_id];
            for difficulty in Difficulty::ALL {
                let beta = items.get(difficulty).beta;
                for obs in &data.by_difficulty[difficulty.index()] {
                    sum_sq += (obs.log_rt - (beta - tau)).powi(2);
                    n += 1;
                }
            }
        }
        if n == 0 {
            return items.sigma;
        }
        self.bounds.sigma.clamp((sum_sq / n as f64).sqrt())
    }

    /// Data-driven starting point for a topic seen for the first time.
    fn initial_items(&self, users: &BTreeMap<&str, UserData>) -> TopicItemParameters {
        let mut items = TopicItemParameters::default();
        for difficulty in Difficulty::ALL {
            let (sum, n) = users
                .values()
                .flat_map(|d| d.by_difficulty[difficulty.index()].iter())
                .fold((0.0, 0usize), |(s, n), obs| (s + obs.log_rt, n + 1));
            if n > 0 {
                let mean_log_rt = sum / n as f64;
                items.get_mut(difficulty).beta =
                    self.bounds.time_intensity.clamp(mean_log_rt + 0.5);
            }
        }
        items
    }

    fn moment_start(
        &self,
        data: &UserData,
        items: &TopicItemParameters,
        prior: (f64, f64),
    ) -> (f64, f64) {
        if data.len() == 0 {
            return prior;
        }
        let (theta, tau) = self.closed_form(data.accuracy(), data.mean_time(), items);
        (
            self.bounds.theta.clamp(blend(theta, prior.0, 0.5)),
            self.bounds.tau.clamp(blend(tau, prior.1, 0.5)),
        )
    }

    /// Moment estimates: `theta = logit(accuracy)`, `tau = beta_ref - ln(avg_time + 1)`.
    fn closed_form(&self, accuracy: f64, avg_time: f64, items: &TopicItemParameters) -> (f64, f64) {
        let theta = logit(accuracy.clamp(0.05, 0.95));
        let tau = items.mean_beta() - (avg_time.max(0.0) + 1.0).ln();
        (self.bounds.theta.clamp(theta), self.bounds.tau.clamp(tau.abs()))
    }
}

fn split_by_difficulty(records: &[&OutcomeRecord]) -> [Vec<Observation>; 3] {
    let mut split = [Vec::new(), Vec::new(), Vec::new()];
    for record in records {
        split[record.difficulty.index()].push(Observation::from(*record));
    }
    split
}

fn person_nll(
    theta: f64,
    tau: f64,
    items: &TopicItemParameters,
    observations: &[Vec<Observation>; 3],
) -> f64 {
    Difficulty::ALL
        .iter()
        .map(|d| {
            let item = items.get(*d);
            joint_neg_log_likelihood(theta, tau, item.a, item.b, item.beta, items.sigma, &observations[d.index()])
        })
        .sum()
}

#[inline]
fn blend(fresh: f64, old: f64, weight: f64) -> f64 {
    weight * fresh + (1.0 - weight) * old
}
