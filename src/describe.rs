//! Descriptive summaries of the normalised table.
//!
//! Everything here is a read-only view: frequency tables, histograms and the
//! per-arm balance table. None of it feeds back into the modelling stages.

use std::fmt;

use ordered_float::OrderedFloat;

use crate::data::SurvivalData;
use crate::error::DataError;

/// Two-way frequency table with margins.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossTab {
    pub row_var: String,
    pub col_var: String,
    pub row_labels: Vec<String>,
    pub col_labels: Vec<String>,
    /// `counts[r][c]`
    pub counts: Vec<Vec<usize>>,
}

/// Distinct values of a column in display order: factor levels in level
/// order, numbers ascending, missing last.
fn ordered_values(data: &SurvivalData, col: &str) -> Result<Vec<f64>, DataError> {
    if let Some(factor) = data.factors.get(col) {
        let mut vals: Vec<f64> = (0..factor.n_levels()).map(|i| i as f64).collect();
        if data.column(col)?.iter().any(|v| v.is_nan()) {
            vals.push(f64::NAN);
        }
        return Ok(vals);
    }
    let mut vals: Vec<OrderedFloat<f64>> = data
        .column(col)?
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| OrderedFloat(v))
        .collect();
    vals.sort();
    vals.dedup();
    let mut out: Vec<f64> = vals.into_iter().map(|v| v.0).collect();
    if data.column(col)?.iter().any(|v| v.is_nan()) {
        out.push(f64::NAN);
    }
    Ok(out)
}

fn position(values: &[f64], v: f64) -> Option<usize> {
    values
        .iter()
        .position(|&x| (x.is_nan() && v.is_nan()) || x == v)
}

impl CrossTab {
    pub fn new(data: &SurvivalData, row: &str, col: &str) -> Result<Self, DataError> {
        let row_vals = ordered_values(data, row)?;
        let col_vals = ordered_values(data, col)?;
        let mut counts = vec![vec![0usize; col_vals.len()]; row_vals.len()];
        let rv = data.column(row)?;
        let cv = data.column(col)?;
        for (&r, &c) in rv.iter().zip(cv.iter()) {
            if let (Some(i), Some(j)) = (position(&row_vals, r), position(&col_vals, c)) {
                counts[i][j] += 1;
            }
        }
        Ok(CrossTab {
            row_var: row.to_string(),
            col_var: col.to_string(),
            row_labels: row_vals.iter().map(|&v| data.display_value(row, v)).collect(),
            col_labels: col_vals.iter().map(|&v| data.display_value(col, v)).collect(),
            counts,
        })
    }

    /// Count for a pair of display labels; 0 when either label is absent.
    pub fn count(&self, row_label: &str, col_label: &str) -> usize {
        match (
            self.row_labels.iter().position(|l| l == row_label),
            self.col_labels.iter().position(|l| l == col_label),
        ) {
            (Some(i), Some(j)) => self.counts[i][j],
            _ => 0,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Markdown rendering with row and column margins.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("| {} \\ {} |", self.row_var, self.col_var));
        for c in &self.col_labels {
            out.push_str(&format!(" {c} |"));
        }
        out.push_str(" total |\n|---|");
        for _ in 0..=self.col_labels.len() {
            out.push_str("---:|");
        }
        out.push('\n');
        for (label, row) in self.row_labels.iter().zip(self.counts.iter()) {
            out.push_str(&format!("| {label} |"));
            for n in row {
                out.push_str(&format!(" {n} |"));
            }
            out.push_str(&format!(" {} |\n", row.iter().sum::<usize>()));
        }
        out.push_str("| total |");
        for j in 0..self.col_labels.len() {
            let col_sum: usize = self.counts.iter().map(|r| r[j]).sum();
            out.push_str(&format!(" {col_sum} |"));
        }
        out.push_str(&format!(" {} |\n", self.total()));
        out
    }
}

impl fmt::Display for CrossTab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>14}", format!("{}\\{}", self.row_var, self.col_var))?;
        for c in &self.col_labels {
            write!(f, "\t{c:>10}")?;
        }
        writeln!(f)?;
        for (label, row) in self.row_labels.iter().zip(self.counts.iter()) {
            write!(f, "{label:>14}")?;
            for n in row {
                write!(f, "\t{n:>10}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Equal-width histogram over the observed range. Missing values are counted
/// separately.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub variable: String,
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
    pub missing: usize,
}

impl Histogram {
    pub fn new(variable: &str, values: &[f64], num_bins: usize) -> Self {
        let present: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let missing = values.len() - present.len();
        if present.is_empty() || num_bins == 0 {
            return Histogram {
                variable: variable.to_string(),
                edges: vec![],
                counts: vec![],
                missing,
            };
        }
        let min = present.iter().copied().fold(f64::INFINITY, f64::min);
        let mut max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max - min < f64::EPSILON {
            // everything at one value
            max = min + 1.0;
        }
        let width = (max - min) / num_bins as f64;
        let edges: Vec<f64> = (0..=num_bins).map(|k| min + k as f64 * width).collect();
        let mut counts = vec![0u64; num_bins];
        for v in present {
            let k = (((v - min) / width).floor() as usize).min(num_bins - 1);
            counts[k] += 1;
        }
        Histogram {
            variable: variable.to_string(),
            edges,
            counts,
            missing,
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Histogram of {} ({} NA)", self.variable, self.missing)?;
        let max = self.counts.iter().copied().max().unwrap_or(0).max(1);
        for (k, &n) in self.counts.iter().enumerate() {
            let bar = "#".repeat((n * 40 / max) as usize);
            writeln!(
                f,
                "  [{:>9.2}, {:>9.2}) {:>5} {}",
                self.edges[k],
                self.edges[k + 1],
                n,
                bar
            )?;
        }
        Ok(())
    }
}

fn mean_sd(xs: &[f64]) -> (usize, f64, f64) {
    let vals: Vec<f64> = xs.iter().copied().filter(|v| !v.is_nan()).collect();
    let n = vals.len();
    if n == 0 {
        return (0, f64::NAN, f64::NAN);
    }
    let mean = vals.iter().sum::<f64>() / n as f64;
    let sd = if n > 1 {
        (vals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        f64::NAN
    };
    (n, mean, sd)
}

/// One row of the balance table: a summary per treatment arm.
#[derive(Debug, Clone)]
pub struct BalanceRow {
    pub variable: String,
    pub binary: bool,
    /// Per arm `(n, mean, sd)`; for binary variables the mean is the proportion.
    pub by_arm: Vec<(usize, f64, f64)>,
}

/// Baseline balance between treatment arms.
#[derive(Debug, Clone)]
pub struct BalanceTable {
    pub group: String,
    pub arms: Vec<String>,
    pub arm_sizes: Vec<usize>,
    pub rows: Vec<BalanceRow>,
}

impl BalanceTable {
    pub fn new(data: &SurvivalData, group: &str, variables: &[String]) -> Result<Self, DataError> {
        let arm_values: Vec<f64> = ordered_values(data, group)?
            .into_iter()
            .filter(|v| !v.is_nan())
            .collect();
        let g = data.column(group)?;
        let arm_rows: Vec<Vec<usize>> = arm_values
            .iter()
            .map(|&a| (0..g.len()).filter(|&i| g[i] == a).collect())
            .collect();

        let mut rows = Vec::with_capacity(variables.len());
        for var in variables {
            let col = data.column(var)?;
            let binary = data.binary_labels.contains_key(var);
            let by_arm = arm_rows
                .iter()
                .map(|idx| {
                    let xs: Vec<f64> = idx.iter().map(|&i| col[i]).collect();
                    mean_sd(&xs)
                })
                .collect();
            rows.push(BalanceRow {
                variable: var.clone(),
                binary,
                by_arm,
            });
        }
        Ok(BalanceTable {
            group: group.to_string(),
            arms: arm_values.iter().map(|&a| data.display_value(group, a)).collect(),
            arm_sizes: arm_rows.iter().map(Vec::len).collect(),
            rows,
        })
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::from("| variable |");
        for (arm, n) in self.arms.iter().zip(self.arm_sizes.iter()) {
            out.push_str(&format!(" {arm} (n={n}) |"));
        }
        out.push_str("\n|---|");
        for _ in &self.arms {
            out.push_str("---:|");
        }
        out.push('\n');
        for row in &self.rows {
            out.push_str(&format!("| {} |", row.variable));
            for &(n, mean, sd) in &row.by_arm {
                if row.binary {
                    out.push_str(&format!(" {:.1}% of {n} |", 100.0 * mean));
                } else {
                    out.push_str(&format!(" {mean:.2} ({sd:.2}) |"));
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Factor;
    use ndarray::Array2;

    fn table() -> SurvivalData {
        // treat, sex, age
        let numeric = vec![
            1.0, 1.0, 20.0, //
            1.0, 0.0, 30.0, //
            0.0, 1.0, 40.0, //
            0.0, 1.0, 50.0, //
            1.0, f64::NAN, f64::NAN,
        ];
        let mut data = SurvivalData {
            ids: (1..=5).map(|i| i.to_string()).collect(),
            headers: vec!["treat".into(), "sex".into(), "age".into()],
            numeric_data: Array2::from_shape_vec((5, 3), numeric).unwrap(),
            ..SurvivalData::default()
        };
        data.binary_labels.insert("treat".into(), ["deferred".into(), "immediate".into()]);
        data.binary_labels.insert("sex".into(), ["female".into(), "male".into()]);
        data
    }

    #[test]
    fn test_cross_tab_counts_and_labels() -> Result<(), DataError> {
        let data = table();
        let tab = CrossTab::new(&data, "treat", "sex")?;
        assert_eq!(tab.row_labels, vec!["deferred", "immediate"]);
        assert_eq!(tab.col_labels, vec!["female", "male", "NA"]);
        assert_eq!(tab.count("immediate", "male"), 1);
        assert_eq!(tab.count("deferred", "male"), 2);
        assert_eq!(tab.count("immediate", "NA"), 1);
        assert_eq!(tab.total(), 5);
        let md = tab.to_markdown();
        assert!(md.contains("| immediate | 1 | 1 | 1 | 3 |"), "{md}");
        Ok(())
    }

    #[test]
    fn test_cross_tab_with_factor_levels() -> Result<(), DataError> {
        let mut data = table();
        let f = Factor::with_levels("band", &["young".to_string(), "old".to_string()], None);
        data.set_factor_column(f, &[0.0, 0.0, 1.0, 1.0, 1.0]);
        let tab = CrossTab::new(&data, "treat", "band")?;
        assert_eq!(tab.col_labels, vec!["young", "old"]);
        assert_eq!(tab.count("immediate", "old"), 1);
        Ok(())
    }

    #[test]
    fn test_histogram_counts_every_present_value() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, f64::NAN];
        let h = Histogram::new("x", &values, 3);
        assert_eq!(h.total(), 10);
        assert_eq!(h.missing, 1);
        assert_eq!(h.counts.len(), 3);
        assert_eq!(h.edges.first(), Some(&1.0));
        assert_eq!(h.edges.last(), Some(&10.0));
        assert_eq!(h.counts[2], 4, "the maximum falls in the last bin");
    }

    #[test]
    fn test_balance_table() -> Result<(), DataError> {
        let data = table();
        let bal = BalanceTable::new(&data, "treat", &["age".to_string(), "sex".to_string()])?;
        assert_eq!(bal.arms, vec!["deferred", "immediate"]);
        assert_eq!(bal.arm_sizes, vec![2, 3]);
        let (n, mean, _) = bal.rows[0].by_arm[1];
        assert_eq!((n, mean), (2, 25.0));
        assert!(bal.rows[1].binary);
        assert_eq!(bal.rows[1].by_arm[0].1, 1.0);
        Ok(())
    }
}
