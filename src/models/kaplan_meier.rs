//! Kaplan–Meier product-limit estimator and the k-sample log-rank test.

use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::models::linalg;
use crate::models::metrics::chi_square_p;

/// One step of the product-limit curve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KmStep {
    pub time: f64,
    pub at_risk: usize,
    pub events: usize,
    pub censored: usize,
    pub survival: f64,
    /// Greenwood standard error of `survival`.
    pub se: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KaplanMeier {
    pub label: String,
    pub n: usize,
    pub steps: Vec<KmStep>,
}

impl KaplanMeier {
    /// `time`/`status` pairs with a missing time are ignored.
    pub fn fit(label: &str, time: &[f64], status: &[u8]) -> Self {
        let mut obs: Vec<(f64, u8)> = time
            .iter()
            .zip(status.iter())
            .filter(|(t, _)| !t.is_nan())
            .map(|(&t, &s)| (t, s))
            .collect();
        obs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let n = obs.len();

        let mut steps = Vec::new();
        let mut survival = 1.0_f64;
        let mut greenwood = 0.0_f64;
        let mut i = 0;
        while i < n {
            let t = obs[i].0;
            let at_risk = n - i;
            let mut events = 0;
            let mut censored = 0;
            while i < n && obs[i].0 == t {
                if obs[i].1 == 1 {
                    events += 1;
                } else {
                    censored += 1;
                }
                i += 1;
            }
            let (r, d) = (at_risk as f64, events as f64);
            if events > 0 {
                survival *= 1.0 - d / r;
                if r > d {
                    greenwood += d / (r * (r - d));
                }
            }
            steps.push(KmStep {
                time: t,
                at_risk,
                events,
                censored,
                survival,
                se: survival * greenwood.sqrt(),
            });
        }
        KaplanMeier {
            label: label.to_string(),
            n,
            steps,
        }
    }

    /// S(t), right-continuous.
    pub fn survival_at(&self, t: f64) -> f64 {
        self.steps
            .iter()
            .take_while(|s| s.time <= t)
            .last()
            .map_or(1.0, |s| s.survival)
    }

    /// Smallest time with S(t) <= 0.5, `None` if the curve never gets there.
    pub fn median(&self) -> Option<f64> {
        self.quantile(0.5)
    }

    /// Smallest time with S(t) <= 1 - p.
    pub fn quantile(&self, p: f64) -> Option<f64> {
        self.steps
            .iter()
            .find(|s| s.survival <= 1.0 - p + 1e-12)
            .map(|s| s.time)
    }

    pub fn events(&self) -> usize {
        self.steps.iter().map(|s| s.events).sum()
    }
}

/// Result of the k-sample log-rank test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRankTest {
    pub groups: Vec<String>,
    pub observed: Vec<f64>,
    pub expected: Vec<f64>,
    pub chi_square: f64,
    pub df: usize,
    pub p_value: f64,
}

/// k-sample log-rank test. `group` holds a group index per subject; groups
/// with no subjects are dropped.
pub fn log_rank_test(time: &[f64], status: &[u8], group: &[usize], labels: &[String]) -> LogRankTest {
    let k_all = labels.len();
    let mut present = vec![false; k_all];
    for (&g, t) in group.iter().zip(time.iter()) {
        if g < k_all && !t.is_nan() {
            present[g] = true;
        }
    }
    let remap: Vec<Option<usize>> = {
        let mut next = 0;
        present
            .iter()
            .map(|&p| {
                p.then(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect()
    };
    let groups: Vec<String> = labels
        .iter()
        .zip(present.iter())
        .filter(|(_, p)| **p)
        .map(|(l, _)| l.clone())
        .collect();
    let k = groups.len();

    let mut obs: Vec<(f64, u8, usize)> = time
        .iter()
        .zip(status.iter())
        .zip(group.iter())
        .filter_map(|((&t, &s), &g)| {
            let g = remap.get(g).copied().flatten()?;
            (!t.is_nan()).then_some((t, s, g))
        })
        .collect();
    obs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut at_risk = vec![0.0_f64; k];
    for &(_, _, g) in &obs {
        at_risk[g] += 1.0;
    }
    let mut observed = vec![0.0; k];
    let mut expected = vec![0.0; k];
    let mut var = Array2::<f64>::zeros((k, k));

    let mut i = 0;
    while i < obs.len() {
        let t = obs[i].0;
        let mut d_g = vec![0.0; k];
        let mut leaving = vec![0.0; k];
        while i < obs.len() && obs[i].0 == t {
            let (_, s, g) = obs[i];
            if s == 1 {
                d_g[g] += 1.0;
            }
            leaving[g] += 1.0;
            i += 1;
        }
        let d: f64 = d_g.iter().sum();
        let n: f64 = at_risk.iter().sum();
        if d > 0.0 && n > 0.0 {
            for a in 0..k {
                observed[a] += d_g[a];
                expected[a] += d * at_risk[a] / n;
                if n > 1.0 {
                    let scale = d * (n - d) / (n * n * (n - 1.0));
                    for b in 0..k {
                        let delta = if a == b { n * at_risk[a] } else { 0.0 };
                        var[[a, b]] += scale * (delta - at_risk[a] * at_risk[b]);
                    }
                }
            }
        }
        for g in 0..k {
            at_risk[g] -= leaving[g];
        }
    }

    // the k x k covariance has rank k-1: drop the last group
    let df = k.saturating_sub(1);
    let chi_square = if df == 0 {
        0.0
    } else {
        let u = Array1::from_iter((0..df).map(|a| observed[a] - expected[a]));
        let v = var.slice(ndarray::s![0..df, 0..df]).to_owned();
        match linalg::solve(&v, &u) {
            Some(x) => u.dot(&x),
            None => 0.0,
        }
    };
    LogRankTest {
        groups,
        observed,
        expected,
        chi_square,
        df,
        p_value: if df == 0 {
            1.0
        } else {
            chi_square_p(chi_square, df as f64)
        },
    }
}
