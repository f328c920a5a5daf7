use log::debug;
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;

use crate::error::FitError;
use crate::models::design::{Design, DesignLayout};
use crate::models::metrics::harrell_c;
use crate::models::{linalg, Coefficient};

/// Fitted Cox proportional hazards model.
#[derive(Debug, Clone, Serialize)]
pub struct CoxModel {
    pub layout: DesignLayout,
    pub names: Vec<String>,
    pub sources: Vec<String>,
    pub beta: Array1<f64>,
    pub covariance: Array2<f64>,
    pub log_likelihood: f64,
    /// Log partial likelihood at beta = 0.
    pub null_log_likelihood: f64,
    pub iterations: usize,
    pub n: usize,
    pub events: usize,
    pub concordance: f64,
}

impl CoxModel {
    pub fn coefficients(&self) -> Vec<Coefficient> {
        (0..self.beta.len())
            .map(|j| {
                Coefficient::new(
                    &self.names[j],
                    Some(&self.sources[j]),
                    self.beta[j],
                    self.covariance[[j, j]].sqrt(),
                )
            })
            .collect()
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.beta.len() as f64
    }
}

/// Breslow partial likelihood, score and information at `beta`.
///
/// `order` sorts the rows by decreasing time.
fn partial_likelihood(
    x: &Array2<f64>,
    time: &[f64],
    status: &[u8],
    order: &[usize],
    beta: &Array1<f64>,
) -> (f64, Array1<f64>, Array2<f64>) {
    let p = x.ncols();
    let eta = x.dot(beta);
    let mut loglik = 0.0;
    let mut score = Array1::<f64>::zeros(p);
    let mut info = Array2::<f64>::zeros((p, p));

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));

    let mut k = 0;
    while k < order.len() {
        let t = time[order[k]];
        let mut d = 0.0;
        let mut x_events = Array1::<f64>::zeros(p);
        let mut eta_events = 0.0;
        // add everyone tied at t to the risk set first
        while k < order.len() && time[order[k]] == t {
            let i = order[k];
            let row = x.row(i);
            let w = eta[i].exp();
            s0 += w;
            s1.scaled_add(w, &row);
            let col = row.insert_axis(Axis(1));
            s2.scaled_add(w, &col.dot(&col.t()));
            if status[i] == 1 {
                d += 1.0;
                x_events += &row;
                eta_events += eta[i];
            }
            k += 1;
        }
        if d == 0.0 {
            continue;
        }
        let mean = &s1 / s0;
        loglik += eta_events - d * s0.ln();
        score += &(&x_events - &(&mean * d));
        let m = mean.view().insert_axis(Axis(1));
        let outer = m.dot(&m.t());
        info.scaled_add(d, &(&(&s2 / s0) - &outer));
    }
    (loglik, score, info)
}

/// Fit a Cox proportional hazards model by Newton–Raphson with step halving.
///
/// Ties use the Breslow approximation. Covariates are centred internally;
/// this leaves the coefficients unchanged.
pub fn fit_cox(design: &Design, max_iter: usize, tol: f64) -> Result<CoxModel, FitError> {
    let n = design.n();
    let events = design.events();
    if n == 0 {
        return Err(FitError::NoRows);
    }
    if events == 0 {
        return Err(FitError::NoEvents(n));
    }
    let p = design.p();
    let means = design
        .x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(p));
    let x = &design.x - &means;

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| design.time[j].total_cmp(&design.time[i]));

    let mut beta = Array1::<f64>::zeros(p);
    let (null_ll, mut score, mut info) =
        partial_likelihood(&x, &design.time, &design.status, &order, &beta);
    let mut loglik = null_ll;
    let mut converged = p == 0;
    let mut iterations = 0;

    while !converged && iterations < max_iter {
        iterations += 1;
        let step = linalg::solve(&info, &score).ok_or(FitError::Singular)?;
        let mut scale = 1.0;
        let (new_beta, new_ll, new_score, new_info) = loop {
            let candidate = &beta + &(&step * scale);
            let (ll, s, i) = partial_likelihood(&x, &design.time, &design.status, &order, &candidate);
            if ll.is_finite() && ll >= loglik - 1e-12 {
                break (candidate, ll, s, i);
            }
            scale /= 2.0;
            if scale < 1e-6 {
                return Err(FitError::NonConvergence(iterations));
            }
        };
        let change = (new_ll - loglik).abs();
        beta = new_beta;
        loglik = new_ll;
        score = new_score;
        info = new_info;
        debug!("cox iteration {iterations}: loglik {loglik:.6}");
        converged = change < tol * (loglik.abs() + tol);
    }
    if !converged {
        return Err(FitError::NonConvergence(max_iter));
    }
    let covariance = linalg::invert(&info).ok_or(FitError::Singular)?;
    if covariance.diag().iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(FitError::Singular);
    }

    let risk = x.dot(&beta);
    let concordance = harrell_c(&design.time, &design.status, risk.as_slice().unwrap_or(&[]));

    Ok(CoxModel {
        layout: design.layout.clone(),
        names: design.names.clone(),
        sources: design.sources.clone(),
        beta,
        covariance,
        log_likelihood: loglik,
        null_log_likelihood: null_ll,
        iterations,
        n,
        events,
        concordance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::design::{Term, TermKind};

    fn design(x: Vec<f64>, time: Vec<f64>, status: Vec<u8>) -> Design {
        let n = time.len();
        let layout = DesignLayout {
            terms: vec![Term {
                covariate: "x".into(),
                kind: TermKind::Numeric,
            }],
            interactions: vec![],
        };
        Design {
            layout,
            names: vec!["x".into()],
            sources: vec!["x".into()],
            x: Array2::from_shape_vec((n, 1), x).unwrap(),
            time,
            status,
            rows: (0..n).collect(),
            dropped: 0,
        }
    }

    #[test]
    fn test_score_vanishes_at_the_estimate() -> Result<(), FitError> {
        // (t, d, x): (1,1,1) (2,1,0) (3,1,1) (4,1,0) has a finite maximum
        let d = design(
            vec![1.0, 0.0, 1.0, 0.0],
            vec![1.0, 2.0, 3.0, 4.0],
            vec![1, 1, 1, 1],
        );
        let fit = fit_cox(&d, 50, 1e-10)?;
        // score at the optimum is zero; check against a direct evaluation
        let x = &d.x - &d.x.mean_axis(Axis(0)).unwrap();
        let order = vec![3, 2, 1, 0];
        let (ll, score, _) = partial_likelihood(&x, &d.time, &d.status, &order, &fit.beta);
        assert!(score[0].abs() < 1e-6);
        assert!((ll - fit.log_likelihood).abs() < 1e-9);
        assert!(fit.beta[0] > 0.0, "x = 1 fails earlier, so its hazard is higher");
        assert!(fit.log_likelihood >= fit.null_log_likelihood);
        Ok(())
    }

    #[test]
    fn test_null_loglik_with_ties_matches_breslow() -> Result<(), FitError> {
        // at beta = 0 with no ties: sum -ln(n_at_risk)
        let d = design(
            vec![0.3, 1.2, -0.4, 0.8, 0.1],
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![1, 0, 1, 1, 0],
        );
        let fit = fit_cox(&d, 50, 1e-9)?;
        let expected = -(5.0_f64.ln() + 3.0_f64.ln() + 2.0_f64.ln());
        assert!((fit.null_log_likelihood - expected).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_no_events_is_an_error() {
        let d = design(vec![0.0, 1.0], vec![1.0, 2.0], vec![0, 0]);
        assert_eq!(fit_cox(&d, 20, 1e-9).unwrap_err(), FitError::NoEvents(2));
    }

    #[test]
    fn test_constant_covariate_is_singular() {
        let d = design(vec![1.0; 4], vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 0, 1]);
        assert_eq!(fit_cox(&d, 20, 1e-9).unwrap_err(), FitError::Singular);
    }

    #[test]
    fn test_fit_is_deterministic() -> Result<(), FitError> {
        let x: Vec<f64> = (0..30).map(|i| f64::from(i % 5) * 0.5).collect();
        let time: Vec<f64> = (0..30).map(|i| f64::from((i * 13) % 29 + 1)).collect();
        let status: Vec<u8> = (0..30).map(|i| (i % 4 != 0) as u8).collect();
        let d = design(x, time, status);
        let a = fit_cox(&d, 50, 1e-9)?;
        let b = fit_cox(&d, 50, 1e-9)?;
        assert_eq!(a.beta, b.beta);
        assert_eq!(a.covariance, b.covariance);
        Ok(())
    }
}
