//! Parametric accelerated failure time models.
//!
//! `log T = b0 + x b + sigma W` with `W` standard extreme value (Weibull,
//! exponential when `sigma = 1`), standard normal (log-normal) or standard
//! logistic (log-logistic). Parameters are `theta = (b0, b, log sigma)`;
//! the exponential family has no scale parameter.

use std::f64::consts::{PI, SQRT_2};

use log::{debug, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::erf::erfc;

use crate::error::FitError;
use crate::models::design::{Design, DesignLayout};
use crate::models::metrics::harrell_c;
use crate::models::{linalg, Coefficient, Family};

pub const INTERCEPT: &str = "(Intercept)";
pub const LOG_SCALE: &str = "Log(scale)";

/// Error distribution of `W`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    ExtremeValue,
    Normal,
    Logistic,
}

fn softplus(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn normal_log_sf(z: f64) -> f64 {
    if z < 30.0 {
        (0.5 * erfc(z / SQRT_2)).ln()
    } else {
        // asymptotic series, erfc underflows out here
        let z2 = z * z;
        -0.5 * z2 - z.ln() - 0.5 * (2.0 * PI).ln() + (1.0 - 1.0 / z2 + 3.0 / (z2 * z2)).ln()
    }
}

impl Distribution {
    pub fn for_family(family: Family) -> Option<Distribution> {
        match family {
            Family::Exponential | Family::Weibull => Some(Distribution::ExtremeValue),
            Family::LogNormal => Some(Distribution::Normal),
            Family::LogLogistic => Some(Distribution::Logistic),
            _ => None,
        }
    }

    pub fn log_pdf(self, z: f64) -> f64 {
        match self {
            Distribution::ExtremeValue => z - z.exp(),
            Distribution::Normal => -0.5 * z * z - 0.5 * (2.0 * PI).ln(),
            Distribution::Logistic => z - 2.0 * softplus(z),
        }
    }

    pub fn log_sf(self, z: f64) -> f64 {
        match self {
            Distribution::ExtremeValue => -z.exp(),
            Distribution::Normal => normal_log_sf(z),
            Distribution::Logistic => -softplus(z),
        }
    }

    /// d/dz log f(z)
    fn d_log_pdf(self, z: f64) -> f64 {
        match self {
            Distribution::ExtremeValue => 1.0 - z.exp(),
            Distribution::Normal => -z,
            Distribution::Logistic => 1.0 - 2.0 * sigmoid(z),
        }
    }

    /// d/dz log S(z), minus the hazard of W
    fn d_log_sf(self, z: f64) -> f64 {
        match self {
            Distribution::ExtremeValue => -z.exp(),
            Distribution::Normal => -(self.log_pdf(z) - normal_log_sf(z)).exp(),
            Distribution::Logistic => -sigmoid(z),
        }
    }

    /// `w_p` with `P(W <= w_p) = p`.
    pub fn quantile(self, p: f64) -> f64 {
        match self {
            Distribution::ExtremeValue => (-(1.0 - p).ln()).ln(),
            Distribution::Normal => Normal::new(0.0, 1.0).map_or(f64::NAN, |n| n.inverse_cdf(p)),
            Distribution::Logistic => (p / (1.0 - p)).ln(),
        }
    }
}

/// Fitted AFT model.
#[derive(Debug, Clone, Serialize)]
pub struct AftModel {
    pub family: Family,
    pub distribution: Distribution,
    pub layout: DesignLayout,
    /// Intercept, design columns, then `Log(scale)` unless the scale is fixed.
    pub names: Vec<String>,
    pub sources: Vec<String>,
    pub theta: Array1<f64>,
    pub covariance: Array2<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub n: usize,
    pub events: usize,
    pub concordance: f64,
}

impl AftModel {
    pub fn fixed_scale(&self) -> bool {
        self.family == Family::Exponential
    }

    pub fn scale(&self) -> f64 {
        if self.fixed_scale() {
            1.0
        } else {
            self.theta[self.theta.len() - 1].exp()
        }
    }

    /// Number of regression coefficients, intercept included.
    fn n_location(&self) -> usize {
        if self.fixed_scale() {
            self.theta.len()
        } else {
            self.theta.len() - 1
        }
    }

    /// `b0 + x b` for one expanded design row.
    pub fn linear_predictor(&self, x: &[f64]) -> f64 {
        self.theta[0]
            + x.iter()
                .zip(self.theta.iter().skip(1))
                .map(|(a, b)| a * b)
                .sum::<f64>()
    }

    /// `log t_p` for failure probability `p` and its delta-method SE.
    pub fn log_quantile(&self, x: &[f64], p: f64) -> (f64, f64) {
        let w = self.distribution.quantile(p);
        let sigma = self.scale();
        let eta = self.linear_predictor(x) + sigma * w;
        let mut grad = Array1::<f64>::zeros(self.theta.len());
        grad[0] = 1.0;
        for (j, v) in x.iter().enumerate() {
            grad[j + 1] = *v;
        }
        if !self.fixed_scale() {
            grad[self.n_location()] = sigma * w;
        }
        let var = grad.dot(&self.covariance.dot(&grad));
        (eta, var.max(0.0).sqrt())
    }

    pub fn coefficients(&self) -> Vec<Coefficient> {
        (0..self.theta.len())
            .map(|j| {
                let covariate = (j > 0 && j < self.n_location()).then(|| self.sources[j].as_str());
                Coefficient::new(
                    &self.names[j],
                    covariate,
                    self.theta[j],
                    self.covariance[[j, j]].sqrt(),
                )
            })
            .collect()
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.theta.len() as f64
    }
}

/// Data of one fit: the design with an intercept column and log times.
struct Problem<'a> {
    x: Array2<f64>,
    log_t: Vec<f64>,
    status: &'a [u8],
    dist: Distribution,
    fixed_scale: bool,
}

impl Problem<'_> {
    fn split<'t>(&self, theta: &'t Array1<f64>) -> (ndarray::ArrayView1<'t, f64>, f64) {
        let p = self.x.ncols();
        let log_sigma = if self.fixed_scale { 0.0 } else { theta[p] };
        (theta.slice(ndarray::s![0..p]), log_sigma)
    }

    fn log_likelihood(&self, theta: &Array1<f64>) -> f64 {
        let (beta, log_sigma) = self.split(theta);
        let sigma = log_sigma.exp();
        let eta = self.x.dot(&beta);
        let mut ll = 0.0;
        for i in 0..self.log_t.len() {
            let z = (self.log_t[i] - eta[i]) / sigma;
            ll += if self.status[i] == 1 {
                self.dist.log_pdf(z) - log_sigma - self.log_t[i]
            } else {
                self.dist.log_sf(z)
            };
        }
        ll
    }

    fn gradient(&self, theta: &Array1<f64>) -> Array1<f64> {
        let (beta, log_sigma) = self.split(theta);
        let sigma = log_sigma.exp();
        let p = self.x.ncols();
        let eta = self.x.dot(&beta);
        let mut grad = Array1::<f64>::zeros(theta.len());
        for i in 0..self.log_t.len() {
            let z = (self.log_t[i] - eta[i]) / sigma;
            let event = self.status[i] == 1;
            let g = if event {
                self.dist.d_log_pdf(z)
            } else {
                self.dist.d_log_sf(z)
            };
            grad.slice_mut(ndarray::s![0..p])
                .scaled_add(-g / sigma, &self.x.row(i));
            if !self.fixed_scale {
                grad[p] += -z * g - if event { 1.0 } else { 0.0 };
            }
        }
        grad
    }

    /// Central differences of the analytic gradient, symmetrised.
    fn hessian(&self, theta: &Array1<f64>) -> Array2<f64> {
        let k = theta.len();
        let mut h = Array2::<f64>::zeros((k, k));
        for j in 0..k {
            let step = 1e-5 * theta[j].abs().max(1.0);
            let mut up = theta.clone();
            let mut down = theta.clone();
            up[j] += step;
            down[j] -= step;
            let diff = (self.gradient(&up) - self.gradient(&down)) / (2.0 * step);
            h.column_mut(j).assign(&diff);
        }
        (&h + &h.t()) / 2.0
    }
}

/// Least squares of log time on the design for starting values.
fn initial_theta(problem: &Problem) -> Result<Array1<f64>, FitError> {
    let y = Array1::from(problem.log_t.clone());
    let xtx = problem.x.t().dot(&problem.x);
    let xty = problem.x.t().dot(&y);
    let beta = linalg::solve(&xtx, &xty).ok_or(FitError::Singular)?;
    if problem.fixed_scale {
        return Ok(beta);
    }
    let resid = &y - &problem.x.dot(&beta);
    let n = resid.len() as f64;
    let sd = (resid.dot(&resid) / n).sqrt();
    let log_sigma = if sd.is_finite() && sd > 1e-8 { sd.ln() } else { 0.0 };
    let mut theta = Array1::<f64>::zeros(beta.len() + 1);
    theta.slice_mut(ndarray::s![0..beta.len()]).assign(&beta);
    theta[beta.len()] = log_sigma;
    Ok(theta)
}

/// Maximum likelihood fit of an AFT model.
///
/// Rows with a non-positive time have no log time and are dropped with a
/// warning.
pub fn fit_aft(design: &Design, family: Family, max_iter: usize, tol: f64) -> Result<AftModel, FitError> {
    let dist = Distribution::for_family(family)
        .ok_or_else(|| FitError::UnknownCovariate(format!("{family:?} is not a parametric family")))?;
    let positive = design.filter_rows(|t, _| t > 0.0);
    let removed = design.n() - positive.n();
    if removed > 0 {
        warn!("{family:?}: {removed} row(s) with time <= 0 dropped");
    }
    let design = &positive;
    let n = design.n();
    if n == 0 {
        return Err(FitError::NoRows);
    }
    let events = design.events();
    if events == 0 {
        return Err(FitError::NoEvents(n));
    }

    let p = design.p() + 1;
    let mut x = Array2::<f64>::ones((n, p));
    x.slice_mut(ndarray::s![.., 1..]).assign(&design.x);
    let problem = Problem {
        x,
        log_t: design.time.iter().map(|t| t.ln()).collect(),
        status: &design.status,
        dist,
        fixed_scale: family == Family::Exponential,
    };

    let mut theta = initial_theta(&problem)?;
    let mut ll = problem.log_likelihood(&theta);
    if !ll.is_finite() {
        return Err(FitError::NonConvergence(0));
    }
    let mut iterations = 0;
    let mut converged = false;
    while iterations < max_iter {
        iterations += 1;
        let grad = problem.gradient(&theta);
        let neg_h = -problem.hessian(&theta);
        let (direction, newton) = match linalg::solve(&neg_h, &grad) {
            Some(d) if d.dot(&grad) > 0.0 => (d, true),
            _ => (grad.clone(), false),
        };
        let mut scale = 1.0;
        let accepted = loop {
            let candidate = &theta + &(&direction * scale);
            let new_ll = problem.log_likelihood(&candidate);
            if new_ll.is_finite() && new_ll >= ll - 1e-12 {
                break Some((candidate, new_ll));
            }
            scale /= 2.0;
            if scale < 1e-10 {
                break None;
            }
        };
        let Some((candidate, new_ll)) = accepted else {
            return Err(FitError::NonConvergence(iterations));
        };
        let change = (new_ll - ll).abs();
        theta = candidate;
        ll = new_ll;
        debug!("{family:?} iteration {iterations}: loglik {ll:.6}");
        if newton && change < tol * (ll.abs() + tol) {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(FitError::NonConvergence(max_iter));
    }

    let neg_h = -problem.hessian(&theta);
    let covariance = linalg::invert(&neg_h).ok_or(FitError::Singular)?;
    if covariance.diag().iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(FitError::Singular);
    }

    let mut names = vec![INTERCEPT.to_string()];
    names.extend(design.names.iter().cloned());
    let mut sources = vec![INTERCEPT.to_string()];
    sources.extend(design.sources.iter().cloned());
    if !problem.fixed_scale {
        names.push(LOG_SCALE.to_string());
        sources.push(LOG_SCALE.to_string());
    }

    // longer predicted times mean lower risk
    let eta = problem.x.dot(&theta.slice(ndarray::s![0..p]));
    let risk: Vec<f64> = eta.iter().map(|e| -e).collect();
    let concordance = harrell_c(&design.time, &design.status, &risk);

    Ok(AftModel {
        family,
        distribution: dist,
        layout: design.layout.clone(),
        names,
        sources,
        theta,
        covariance,
        log_likelihood: ll,
        iterations,
        n,
        events,
        concordance,
    })
}
