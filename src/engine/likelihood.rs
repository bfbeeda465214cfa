//! Joint correctness / response-time likelihood.
//!
//! Correctness follows a two-parameter logistic model, response time a log-normal
//! model with person speed `tau` and item time intensity `beta`. Nothing here
//! mutates state or fails; callers pass finite inputs.

use crate::engine::types::OutcomeRecord;

const PROB_EPSILON: f64 = 1e-10;

/// A single observation reduced to what the likelihood needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub correct: f64,
    pub log_rt: f64,
}

impl From<&OutcomeRecord> for Observation {
    fn from(record: &OutcomeRecord) -> Self {
        Self {
            correct: record.correct_value(),
            log_rt: record.log_time(),
        }
    }
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

#[inline]
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
    (p / (1.0 - p)).ln()
}

/// Probability of a correct answer under 2PL.
#[inline]
pub fn p_correct(theta: f64, a: f64, b: f64) -> f64 {
    sigmoid(a * (theta - b))
}

/// Log density of a log response time: `log_rt ~ N(beta - tau, sigma^2)`.
#[inline]
pub fn log_likelihood_rt(log_rt: f64, tau: f64, beta: f64, sigma: f64) -> f64 {
    let z = (log_rt - (beta - tau)) / sigma;
    -0.5 * (2.0 * std::f64::consts::PI * sigma * sigma).ln() - 0.5 * z * z
}

/// Median response time in seconds implied by the log-normal model.
#[inline]
pub fn expected_seconds(tau: f64, beta: f64) -> f64 {
    ((beta - tau).exp() - crate::engine::types::LOG_TIME_OFFSET).max(0.0)
}

#[inline]
pub fn observation_log_likelihood(
    obs: &Observation,
    theta: f64,
    tau: f64,
    a: f64,
    b: f64,
    beta: f64,
    sigma: f64,
) -> f64 {
    let p = p_correct(theta, a, b).clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
    let ll_correct = if obs.correct >= 0.5 { p.ln() } else { (1.0 - p).ln() };
    ll_correct + log_likelihood_rt(obs.log_rt, tau, beta, sigma)
}

/// Negated joint log-likelihood over `observations`, ready for a minimizer.
#[allow(clippy::too_many_arguments)]
pub fn joint_neg_log_likelihood(
    theta: f64,
    tau: f64,
    a: f64,
    b: f64,
    beta: f64,
    sigma: f64,
    observations: &[Observation],
) -> f64 {
    -observations
        .iter()
        .map(|obs| observation_log_likelihood(obs, theta, tau, a, b, beta, sigma))
        .sum::<f64>()
}
