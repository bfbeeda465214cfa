//! Box-constrained quasi-Newton minimization.
//!
//! Projected BFGS with central-difference gradients and Armijo backtracking.
//! Intended for the 2-3 dimensional problems of the trainer; dense matrices are fine.

use crate::engine::config::Bounds;

#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    pub value_tolerance: f64,
    pub diff_step: f64,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            gradient_tolerance: 1e-5,
            value_tolerance: 1e-10,
            diff_step: 1e-6,
        }
    }
}

impl OptimizeOptions {
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl OptimizeResult {
    pub fn is_usable(&self) -> bool {
        self.converged && self.value.is_finite() && self.x.iter().all(|v| v.is_finite())
    }
}

const ARMIJO_C: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 30;

pub fn minimize_bounded<F>(
    objective: F,
    x0: &[f64],
    bounds: &[Bounds],
    options: &OptimizeOptions,
) -> OptimizeResult
where
    F: Fn(&[f64]) -> f64,
{
    debug_assert_eq!(x0.len(), bounds.len());
    let n = x0.len();
    let mut x = project(x0, bounds);
    let mut fx = objective(&x);

    if !fx.is_finite() {
        return OptimizeResult {
            x,
            value: fx,
            iterations: 0,
            converged: false,
        };
    }

    let mut h_inv = identity(n);
    let mut grad = gradient(&objective, &x, bounds, options.diff_step);
    let mut converged = false;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;

        let pg = projected_gradient(&x, &grad, bounds);
        if inf_norm(&pg) < options.gradient_tolerance {
            converged = true;
            break;
        }

        let mut direction = mat_vec(&h_inv, &grad)
            .into_iter()
            .map(|v| -v)
            .collect::<Vec<_>>();
        freeze_active(&mut direction, &x, bounds);

        if dot(&direction, &grad) >= 0.0 {
            h_inv = identity(n);
            direction = pg.iter().map(|v| -v).collect();
        }

        let Some((x_new, f_new)) = line_search(&objective, &x, fx, &grad, &direction, bounds)
        else {
            if is_identity(&h_inv) {
                // No descent along the projected gradient: stationary up to numerical noise.
                converged = inf_norm(&pg) < options.gradient_tolerance * 1e3;
                break;
            }
            h_inv = identity(n);
            continue;
        };

        let grad_new = gradient(&objective, &x_new, bounds, options.diff_step);
        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = grad_new.iter().zip(&grad).map(|(a, b)| a - b).collect();
        bfgs_update(&mut h_inv, &s, &y);

        let improvement = fx - f_new;
        x = x_new;
        fx = f_new;
        grad = grad_new;

        if improvement.abs() < options.value_tolerance * (1.0 + fx.abs()) {
            converged = true;
            break;
        }
    }

    OptimizeResult {
        x,
        value: fx,
        iterations,
        converged,
    }
}

fn line_search<F>(
    objective: &F,
    x: &[f64],
    fx: f64,
    grad: &[f64],
    direction: &[f64],
    bounds: &[Bounds],
) -> Option<(Vec<f64>, f64)>
where
    F: Fn(&[f64]) -> f64,
{
    let mut alpha = 1.0;
    for _ in 0..MAX_BACKTRACKS {
        let candidate: Vec<f64> = x
            .iter()
            .zip(direction)
            .map(|(xi, di)| xi + alpha * di)
            .collect();
        let candidate = project(&candidate, bounds);
        let step: Vec<f64> = candidate.iter().zip(x).map(|(a, b)| a - b).collect();
        if inf_norm(&step) < 1e-14 {
            return None;
        }
        let f_candidate = objective(&candidate);
        if f_candidate.is_finite() && f_candidate <= fx + ARMIJO_C * dot(grad, &step) {
            return Some((candidate, f_candidate));
        }
        alpha *= 0.5;
    }
    None
}

fn gradient<F>(objective: &F, x: &[f64], bounds: &[Bounds], step: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut shifted = x.to_vec();
    (0..x.len())
        .map(|i| {
            let h = step * (1.0 + x[i].abs());
            let hi = (x[i] + h).min(bounds[i].max);
            let lo = (x[i] - h).max(bounds[i].min);
            if hi - lo <= 0.0 {
                return 0.0;
            }
            shifted[i] = hi;
            let f_hi = objective(&shifted);
            shifted[i] = lo;
            let f_lo = objective(&shifted);
            shifted[i] = x[i];
            let g = (f_hi - f_lo) / (hi - lo);
            if g.is_finite() {
                g
            } else {
                0.0
            }
        })
        .collect()
}

fn bfgs_update(h_inv: &mut [Vec<f64>], s: &[f64], y: &[f64]) {
    let sy = dot(s, y);
    if sy <= 1e-12 {
        return;
    }
    let rho = 1.0 / sy;
    let n = s.len();
    let hy = mat_vec(h_inv, y);
    let yhy = dot(y, &hy);

    for i in 0..n {
        for j in 0..n {
            h_inv[i][j] += rho * ((1.0 + rho * yhy) * s[i] * s[j] - hy[i] * s[j] - s[i] * hy[j]);
        }
    }
}

fn projected_gradient(x: &[f64], grad: &[f64], bounds: &[Bounds]) -> Vec<f64> {
    x.iter()
        .zip(grad)
        .zip(bounds)
        .map(|((&xi, &gi), b)| {
            if (xi <= b.min && gi > 0.0) || (xi >= b.max && gi < 0.0) {
                0.0
            } else {
                gi
            }
        })
        .collect()
}

fn freeze_active(direction: &mut [f64], x: &[f64], bounds: &[Bounds]) {
    for ((d, &xi), b) in direction.iter_mut().zip(x).zip(bounds) {
        if (xi <= b.min && *d < 0.0) || (xi >= b.max && *d > 0.0) {
            *d = 0.0;
        }
    }
}

fn project(x: &[f64], bounds: &[Bounds]) -> Vec<f64> {
    x.iter().zip(bounds).map(|(v, b)| b.clamp(*v)).collect()
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

fn is_identity(m: &[Vec<f64>]) -> bool {
    m.iter().enumerate().all(|(i, row)| {
        row.iter()
            .enumerate()
            .all(|(j, &v)| if i == j { v == 1.0 } else { v == 0.0 })
    })
}

fn mat_vec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| dot(row, v)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}
