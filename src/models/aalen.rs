//! Aalen's additive hazards model.
//!
//! The hazard is `a0(t) + sum_j x_j a_j(t)`; the cumulative regression
//! functions `B_j(t) = int a_j` are estimated by ordinary least squares
//! increments at each event time, using everyone still at risk.

use log::debug;
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;

use crate::error::FitError;
use crate::models::design::{Design, DesignLayout};
use crate::models::{linalg, Coefficient};

pub const INTERCEPT: &str = "(Intercept)";

#[derive(Debug, Clone, Serialize)]
pub struct AalenModel {
    pub layout: DesignLayout,
    /// Intercept first, then the design columns.
    pub names: Vec<String>,
    pub sources: Vec<String>,
    /// Event times at which the increments were estimable.
    pub times: Vec<f64>,
    /// `B(t)` at each entry of `times`, one row per time.
    pub cumulative: Array2<f64>,
    /// Variance of `B` at the last estimable time.
    pub variance: Array1<f64>,
    pub n: usize,
    pub events: usize,
    /// Events past the last estimable time (risk set too small).
    pub unused_events: usize,
}

impl AalenModel {
    pub fn last_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Cumulative regression functions at the last estimable time with a z-test.
    pub fn coefficients(&self) -> Vec<Coefficient> {
        let Some(last) = self.cumulative.outer_iter().last() else {
            return Vec::new();
        };
        last.iter()
            .enumerate()
            .map(|(j, &b)| {
                let covariate = (j > 0).then(|| self.sources[j].as_str());
                Coefficient::new(&self.names[j], covariate, b, self.variance[j].sqrt())
            })
            .collect()
    }

    /// `B(t)`, constant between event times.
    pub fn cumulative_at(&self, t: f64) -> Option<Array1<f64>> {
        let k = self.times.iter().rposition(|&s| s <= t)?;
        Some(self.cumulative.row(k).to_owned())
    }
}

pub fn fit_aalen(design: &Design) -> Result<AalenModel, FitError> {
    let n = design.n();
    let events = design.events();
    if n == 0 {
        return Err(FitError::NoRows);
    }
    if events == 0 {
        return Err(FitError::NoEvents(n));
    }
    let p = design.p() + 1;
    let mut x = Array2::<f64>::ones((n, p));
    x.slice_mut(ndarray::s![.., 1..]).assign(&design.x);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| design.time[i].total_cmp(&design.time[j]));

    // X'X over the current risk set; rows leave as time passes
    let mut xtx = x.t().dot(&x);
    let mut b = Array1::<f64>::zeros(p);
    let mut var = Array2::<f64>::zeros((p, p));
    let mut times = Vec::new();
    let mut path: Vec<f64> = Vec::new();
    let mut unused_events = 0;

    let mut k = 0;
    while k < n {
        let t = design.time[order[k]];
        let start = k;
        while k < n && design.time[order[k]] == t {
            k += 1;
        }
        let tied = &order[start..k];
        let failures: Vec<usize> = tied
            .iter()
            .copied()
            .filter(|&i| design.status[i] == 1)
            .collect();
        if !failures.is_empty() {
            match linalg::invert(&xtx) {
                Some(inv) if unused_events == 0 => {
                    // dB = (X'X)^-1 X' dN, dN is 1 on the failures
                    let mut xt_dn = Array1::<f64>::zeros(p);
                    for &i in &failures {
                        xt_dn += &x.row(i);
                    }
                    b += &inv.dot(&xt_dn);
                    let mut middle = Array2::<f64>::zeros((p, p));
                    for &i in &failures {
                        let row = x.row(i).insert_axis(Axis(1));
                        middle += &row.dot(&row.t());
                    }
                    var += &inv.dot(&middle).dot(&inv);
                    times.push(t);
                    path.extend(b.iter());
                }
                _ => unused_events += failures.len(),
            }
        }
        for &i in tied {
            let row = x.row(i).insert_axis(Axis(1));
            xtx -= &row.dot(&row.t());
        }
    }
    if times.is_empty() {
        return Err(FitError::Singular);
    }
    if unused_events > 0 {
        debug!(
            "aalen: {unused_events} event(s) after t = {} not estimable",
            times[times.len() - 1]
        );
    }
    let cumulative = Array2::from_shape_vec((times.len(), p), path).map_err(|_| FitError::Singular)?;

    let mut names = vec![INTERCEPT.to_string()];
    names.extend(design.names.iter().cloned());
    let mut sources = vec![INTERCEPT.to_string()];
    sources.extend(design.sources.iter().cloned());

    Ok(AalenModel {
        layout: design.layout.clone(),
        names,
        sources,
        times,
        cumulative,
        variance: var.diag().to_owned(),
        n,
        events,
        unused_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::design::{Term, TermKind};

    fn design(x: Vec<f64>, time: Vec<f64>, status: Vec<u8>) -> Design {
        let n = time.len();
        Design {
            layout: DesignLayout {
                terms: vec![Term {
                    covariate: "x".into(),
                    kind: TermKind::Numeric,
                }],
                interactions: vec![],
            },
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
    fn test_first_increment_by_hand() -> Result<(), FitError> {
        // risk set at t=1: x = 0,0,1,1; failure has x = 0
        // OLS of dN = (1,0,0,0) on (1, x): intercept 1/2, slope -1/2
        let d = design(
            vec![0.0, 0.0, 1.0, 1.0],
            vec![1.0, 5.0, 6.0, 7.0],
            vec![1, 0, 0, 0],
        );
        let fit = fit_aalen(&d)?;
        assert_eq!(fit.times, vec![1.0]);
        let b = fit.cumulative.row(0);
        assert!((b[0] - 0.5).abs() < 1e-12);
        assert!((b[1] + 0.5).abs() < 1e-12);
        let coefs = fit.coefficients();
        assert_eq!(coefs[0].name, INTERCEPT);
        assert_eq!(coefs[1].covariate.as_deref(), Some("x"));
        assert_eq!(coefs[0].covariate, None);
        Ok(())
    }

    #[test]
    fn test_small_risk_sets_stop_the_estimate() -> Result<(), FitError> {
        let d = design(
            vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![1, 1, 1, 1, 1, 1],
        );
        let fit = fit_aalen(&d)?;
        // by t = 6 only one subject is left, X'X is singular
        assert!(fit.unused_events >= 1);
        assert_eq!(fit.times.len() + fit.unused_events, 6);
        assert!(fit.cumulative_at(0.5).is_none());
        assert!(fit.cumulative_at(100.0).is_some());
        Ok(())
    }

    #[test]
    fn test_no_events() {
        let d = design(vec![0.0, 1.0], vec![1.0, 2.0], vec![0, 0]);
        assert_eq!(fit_aalen(&d).unwrap_err(), FitError::NoEvents(2));
    }
}
