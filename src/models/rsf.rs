//! Random survival forest.
//!
//! Bootstrap trees grown with log-rank splitting on random cut points,
//! Nelson–Aalen leaves summarised as ensemble mortality, out-of-bag
//! concordance error and permutation importance.

use std::collections::BTreeSet;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use ndarray::Array2;
use ordered_float::OrderedFloat;
use rand::prelude::IndexedRandom;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::ForestConfig;
use crate::error::FitError;
use crate::models::design::Design;
use crate::models::metrics::harrell_c;

/// Node of a survival tree. Leaves carry the node mortality.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    split_feature: Option<usize>,
    split_value: Option<f64>,
    left: Option<Box<TreeNode>>,
    right: Option<Box<TreeNode>>,
    mortality: f64,
}

impl TreeNode {
    fn leaf(mortality: f64) -> Self {
        TreeNode {
            split_feature: None,
            split_value: None,
            left: None,
            right: None,
            mortality,
        }
    }

    /// Mortality of the leaf holding row `i`; `replace` substitutes one feature value.
    fn predict(&self, x: &Array2<f64>, i: usize, replace: Option<(usize, f64)>) -> f64 {
        let mut node = self;
        loop {
            match (node.split_feature, node.split_value, &node.left, &node.right) {
                (Some(f), Some(v), Some(left), Some(right)) => {
                    let value = match replace {
                        Some((rf, rv)) if rf == f => rv,
                        _ => x[[i, f]],
                    };
                    node = if value <= v { left } else { right };
                }
                _ => return node.mortality,
            }
        }
    }

    fn count_leaves(&self) -> usize {
        match (&self.left, &self.right) {
            (Some(l), Some(r)) => l.count_leaves() + r.count_leaves(),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SurvivalTree {
    pub root: TreeNode,
    /// Rows not drawn into the bootstrap sample.
    pub oob: Vec<usize>,
}

/// Fitted forest.
#[derive(Debug, Clone, Serialize)]
pub struct ForestModel {
    pub names: Vec<String>,
    #[serde(skip)]
    pub trees: Vec<SurvivalTree>,
    pub n: usize,
    pub events: usize,
    pub mtry: usize,
    /// 1 - Harrell's C of the out-of-bag ensemble mortality.
    pub oob_error: f64,
    /// Permutation importance per covariate, in design order.
    pub importance: Vec<(String, f64)>,
}

impl ForestModel {
    /// Importance sorted from most to least important.
    pub fn ranked_importance(&self) -> Vec<(String, f64)> {
        let mut ranked = self.importance.clone();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn mean_leaves(&self) -> f64 {
        let total: usize = self.trees.iter().map(|t| t.root.count_leaves()).sum();
        total as f64 / self.trees.len().max(1) as f64
    }
}

/// Log-rank statistic of a two-way split, standardised.
///
/// `order` holds the node rows sorted by time; `goes_left[k]` says where
/// `order[k]` ends up.
pub fn log_rank_stat(time: &[f64], status: &[u8], order: &[usize], goes_left: &[bool]) -> f64 {
    let mut y_l = goes_left.iter().filter(|&&l| l).count() as f64;
    let mut y = order.len() as f64;
    let mut o_minus_e = 0.0;
    let mut v = 0.0;
    let mut k = 0;
    while k < order.len() {
        let t = time[order[k]];
        let (mut d, mut d_l, mut n_l, mut n_t) = (0.0, 0.0, 0.0, 0.0);
        while k < order.len() && time[order[k]] == t {
            let left = goes_left[k];
            if status[order[k]] == 1 {
                d += 1.0;
                if left {
                    d_l += 1.0;
                }
            }
            if left {
                n_l += 1.0;
            }
            n_t += 1.0;
            k += 1;
        }
        if d > 0.0 && y > 1.0 {
            o_minus_e += d_l - d * y_l / y;
            v += y_l * (y - y_l) * d * (y - d) / (y * y * (y - 1.0));
        }
        y_l -= n_l;
        y -= n_t;
    }
    if v <= 0.0 {
        0.0
    } else {
        o_minus_e.abs() / v.sqrt()
    }
}

/// Nelson–Aalen mortality of a leaf: the cumulative hazard summed over the
/// forest-wide event time grid.
fn leaf_mortality(time: &[f64], status: &[u8], rows: &[usize], grid: &[f64]) -> f64 {
    let mut sorted: Vec<usize> = rows.to_vec();
    sorted.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
    let mut at_risk = sorted.len() as f64;
    let mut mortality = 0.0;
    let mut k = 0;
    while k < sorted.len() {
        let t = time[sorted[k]];
        let (mut d, mut leaving) = (0.0, 0.0);
        while k < sorted.len() && time[sorted[k]] == t {
            if status[sorted[k]] == 1 {
                d += 1.0;
            }
            leaving += 1.0;
            k += 1;
        }
        if d > 0.0 {
            // a jump at t counts once for every grid time >= t
            let later = grid.len() - grid.partition_point(|&g| g < t);
            mortality += d / at_risk * later as f64;
        }
        at_risk -= leaving;
    }
    mortality
}

struct Grower<'a> {
    x: &'a Array2<f64>,
    time: &'a [f64],
    status: &'a [u8],
    grid: &'a [f64],
    min_node_size: usize,
    mtry: usize,
    n_split: usize,
}

impl Grower<'_> {
    fn candidate_cuts(&self, rows: &[usize], f: usize, rng: &mut StdRng) -> Vec<f64> {
        let values: BTreeSet<OrderedFloat<f64>> =
            rows.iter().map(|&i| OrderedFloat(self.x[[i, f]])).collect();
        // the largest value sends everything left
        let mut cuts: Vec<f64> = values.iter().map(|v| v.0).collect();
        cuts.pop();
        if self.n_split > 0 && cuts.len() > self.n_split {
            let mut chosen: Vec<f64> = cuts.choose_multiple(rng, self.n_split).copied().collect();
            chosen.sort_by(f64::total_cmp);
            return chosen;
        }
        cuts
    }

    fn grow(&self, rows: Vec<usize>, rng: &mut StdRng) -> TreeNode {
        let events = rows.iter().filter(|&&i| self.status[i] == 1).count();
        if rows.len() < 2 * self.min_node_size.max(1) || events == 0 {
            return TreeNode::leaf(leaf_mortality(self.time, self.status, &rows, self.grid));
        }
        let mut order = rows.clone();
        order.sort_by(|&a, &b| self.time[a].total_cmp(&self.time[b]));

        let features: Vec<usize> = (0..self.x.ncols()).collect();
        let sampled: Vec<usize> = features.choose_multiple(rng, self.mtry).copied().collect();

        let mut best: Option<(f64, usize, f64)> = None;
        for &f in &sampled {
            for cut in self.candidate_cuts(&rows, f, rng) {
                let goes_left: Vec<bool> = order.iter().map(|&i| self.x[[i, f]] <= cut).collect();
                let n_left = goes_left.iter().filter(|&&l| l).count();
                if n_left < self.min_node_size || order.len() - n_left < self.min_node_size {
                    continue;
                }
                let stat = log_rank_stat(self.time, self.status, &order, &goes_left);
                match best {
                    Some((s, _, _)) if stat <= s => {}
                    _ => best = Some((stat, f, cut)),
                }
            }
        }

        let Some((stat, f, cut)) = best else {
            return TreeNode::leaf(leaf_mortality(self.time, self.status, &rows, self.grid));
        };
        if stat <= 0.0 {
            return TreeNode::leaf(leaf_mortality(self.time, self.status, &rows, self.grid));
        }
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().copied().partition(|&i| self.x[[i, f]] <= cut);
        TreeNode {
            split_feature: Some(f),
            split_value: Some(cut),
            left: Some(Box::new(self.grow(left_rows, rng))),
            right: Some(Box::new(self.grow(right_rows, rng))),
            mortality: 0.0,
        }
    }
}

/// Average of the out-of-bag predictions each tree hands to `per_tree`'s sink.
fn oob_mortality<F>(trees: &[SurvivalTree], n: usize, mut per_tree: F) -> Vec<f64>
where
    F: FnMut(usize, &SurvivalTree, &mut dyn FnMut(usize, f64)),
{
    let mut sum = vec![0.0; n];
    let mut count = vec![0usize; n];
    for (b, tree) in trees.iter().enumerate() {
        per_tree(b, tree, &mut |i, m| {
            sum[i] += m;
            count[i] += 1;
        });
    }
    sum.iter()
        .zip(count.iter())
        .map(|(s, &c)| if c == 0 { f64::NAN } else { s / c as f64 })
        .collect()
}

fn oob_error(time: &[f64], status: &[u8], mortality: &[f64]) -> f64 {
    1.0 - harrell_c(time, status, mortality)
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_prefix("Growing trees");
    pb
}

/// Grow the forest on an unexpanded design (one column per covariate).
///
/// Each tree draws from its own `StdRng` seeded with `seed + tree index`, so
/// the result does not depend on how rayon schedules the trees.
pub fn fit_forest(design: &Design, config: &ForestConfig) -> Result<ForestModel, FitError> {
    let n = design.n();
    let events = design.events();
    if n == 0 {
        return Err(FitError::NoRows);
    }
    if events == 0 {
        return Err(FitError::NoEvents(n));
    }
    let p = design.p();
    if p == 0 || config.n_trees == 0 {
        return Err(FitError::NoRows);
    }
    let mtry = config
        .mtry
        .unwrap_or_else(|| (p as f64).sqrt().ceil() as usize)
        .clamp(1, p);

    let grid: Vec<f64> = design
        .time
        .iter()
        .zip(design.status.iter())
        .filter(|(_, s)| **s == 1)
        .map(|(t, _)| OrderedFloat(*t))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|t| t.0)
        .collect();

    let grower = Grower {
        x: &design.x,
        time: &design.time,
        status: &design.status,
        grid: &grid,
        min_node_size: config.min_node_size,
        mtry,
        n_split: config.n_split,
    };

    info!(
        "Growing {} survival trees on {} rows ({} events), mtry = {}",
        config.n_trees, n, events, mtry
    );
    let pb = progress_bar(config.n_trees as u64);
    let trees: Vec<SurvivalTree> = (0..config.n_trees)
        .into_par_iter()
        .map(|b| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(b as u64));
            let mut in_bag = vec![false; n];
            let sample: Vec<usize> = (0..n)
                .map(|_| {
                    let i = rng.random_range(0..n);
                    in_bag[i] = true;
                    i
                })
                .collect();
            let oob: Vec<usize> = (0..n).filter(|&i| !in_bag[i]).collect();
            let root = grower.grow(sample, &mut rng);
            pb.inc(1);
            SurvivalTree { root, oob }
        })
        .collect();
    pb.finish_and_clear();

    let x = &design.x;
    let base = oob_mortality(&trees, n, |_, tree, add| {
        for &i in &tree.oob {
            add(i, tree.root.predict(x, i, None));
        }
    });
    let error = oob_error(&design.time, &design.status, &base);

    let importance: Vec<(String, f64)> = (0..p)
        .into_par_iter()
        .map(|f| {
            let permuted = oob_mortality(&trees, n, |b, tree, add| {
                let stream = (f as u64 + 1).wrapping_mul(config.n_trees as u64) + b as u64;
                let mut rng = StdRng::seed_from_u64(config.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let mut values: Vec<f64> = tree.oob.iter().map(|&i| x[[i, f]]).collect();
                values.shuffle(&mut rng);
                for (&i, &v) in tree.oob.iter().zip(values.iter()) {
                    add(i, tree.root.predict(x, i, Some((f, v))));
                }
            });
            let vimp = oob_error(&design.time, &design.status, &permuted) - error;
            (design.names[f].clone(), vimp)
        })
        .collect();

    info!("Forest OOB error (1 - C): {error:.4}");
    Ok(ForestModel {
        names: design.names.clone(),
        trees,
        n,
        events,
        mtry,
        oob_error: error,
        importance,
    })
}
