use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::data::SurvivalData;
use crate::error::FitError;

/// How a covariate enters the design matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TermKind {
    Numeric,
    /// Treatment contrasts: one indicator per non-reference level.
    /// `labels[0]` is the reference.
    Factor { labels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub covariate: String,
    pub kind: TermKind,
}

impl Term {
    pub fn column_names(&self) -> Vec<String> {
        match &self.kind {
            TermKind::Numeric => vec![self.covariate.clone()],
            TermKind::Factor { labels } => labels
                .iter()
                .skip(1)
                .map(|l| format!("{}={}", self.covariate, l))
                .collect(),
        }
    }

    /// Expand one raw value (a number, or a level index for factors).
    pub fn expand(&self, value: f64) -> Vec<f64> {
        match &self.kind {
            TermKind::Numeric => vec![value],
            TermKind::Factor { labels } => (1..labels.len())
                .map(|k| {
                    if value.is_nan() {
                        f64::NAN
                    } else if value == k as f64 {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
        }
    }
}

/// Terms plus interactions: everything needed to turn raw covariate values
/// into one design row. Kept by fitted models so predictions use the same
/// expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignLayout {
    pub terms: Vec<Term>,
    pub interactions: Vec<(String, String)>,
}

impl DesignLayout {
    fn term(&self, covariate: &str) -> Option<&Term> {
        self.terms.iter().find(|t| t.covariate == covariate)
    }

    /// Design column names and, for each, the covariate (or `a:b` interaction) it came from.
    pub fn columns(&self) -> (Vec<String>, Vec<String>) {
        let mut names = Vec::new();
        let mut sources = Vec::new();
        for term in &self.terms {
            for name in term.column_names() {
                names.push(name);
                sources.push(term.covariate.clone());
            }
        }
        for (a, b) in &self.interactions {
            if let (Some(ta), Some(tb)) = (self.term(a), self.term(b)) {
                for ca in ta.column_names() {
                    for cb in tb.column_names() {
                        names.push(format!("{ca}:{cb}"));
                        sources.push(format!("{a}:{b}"));
                    }
                }
            }
        }
        (names, sources)
    }

    /// Expand raw values (one per term, in term order) into a design row.
    pub fn expand_row(&self, raw: &[f64]) -> Vec<f64> {
        let expanded: Vec<Vec<f64>> = self
            .terms
            .iter()
            .zip(raw.iter())
            .map(|(t, &v)| t.expand(v))
            .collect();
        let mut row: Vec<f64> = expanded.iter().flatten().copied().collect();
        for (a, b) in &self.interactions {
            let ia = self.terms.iter().position(|t| &t.covariate == a);
            let ib = self.terms.iter().position(|t| &t.covariate == b);
            if let (Some(ia), Some(ib)) = (ia, ib) {
                for va in &expanded[ia] {
                    for vb in &expanded[ib] {
                        row.push(va * vb);
                    }
                }
            }
        }
        row
    }
}

/// A model-ready design: complete rows only.
#[derive(Debug, Clone)]
pub struct Design {
    pub layout: DesignLayout,
    pub names: Vec<String>,
    pub sources: Vec<String>,
    pub x: Array2<f64>,
    pub time: Vec<f64>,
    pub status: Vec<u8>,
    /// Table rows that made it into the design.
    pub rows: Vec<usize>,
    pub dropped: usize,
}

impl Design {
    pub fn n(&self) -> usize {
        self.time.len()
    }

    pub fn p(&self) -> usize {
        self.x.ncols()
    }

    pub fn events(&self) -> usize {
        self.status.iter().filter(|&&s| s == 1).count()
    }

    /// Keep only the rows where `keep` holds.
    pub fn filter_rows<F: Fn(f64, u8) -> bool>(&self, keep: F) -> Design {
        let idx: Vec<usize> = (0..self.n())
            .filter(|&i| keep(self.time[i], self.status[i]))
            .collect();
        Design {
            layout: self.layout.clone(),
            names: self.names.clone(),
            sources: self.sources.clone(),
            x: self.x.select(ndarray::Axis(0), &idx),
            time: idx.iter().map(|&i| self.time[i]).collect(),
            status: idx.iter().map(|&i| self.status[i]).collect(),
            rows: idx.iter().map(|&i| self.rows[i]).collect(),
            dropped: self.dropped + self.n() - idx.len(),
        }
    }
}

/// Build the design matrix for `covariates` (+ pairwise `interactions`).
///
/// With `expand_factors == false` factors enter as their level index, one
/// column per covariate; the forest splits on them that way. Rows with a
/// missing time, status or covariate are dropped (listwise deletion).
pub fn build_design(
    data: &SurvivalData,
    time_col: &str,
    status_col: &str,
    covariates: &[String],
    interactions: &[(String, String)],
    expand_factors: bool,
) -> Result<Design, FitError> {
    let mut terms = Vec::with_capacity(covariates.len());
    let mut raw_cols = Vec::with_capacity(covariates.len());
    for cov in covariates {
        let col = data
            .column(cov)
            .map_err(|_| FitError::UnknownCovariate(cov.clone()))?;
        raw_cols.push(col);
        let kind = match data.factors.get(cov) {
            Some(f) if expand_factors => TermKind::Factor {
                labels: f.labels().to_vec(),
            },
            _ => TermKind::Numeric,
        };
        terms.push(Term {
            covariate: cov.clone(),
            kind,
        });
    }
    for (a, b) in interactions {
        for name in [a, b] {
            if !covariates.contains(name) {
                return Err(FitError::UnknownCovariate(format!("{a}:{b} needs main effect '{name}'")));
            }
        }
    }
    let layout = DesignLayout {
        terms,
        interactions: interactions.to_vec(),
    };
    let (names, sources) = layout.columns();

    let time_all = data
        .column(time_col)
        .map_err(|_| FitError::UnknownCovariate(time_col.to_string()))?;
    let status_all = data
        .column(status_col)
        .map_err(|_| FitError::UnknownCovariate(status_col.to_string()))?;

    let mut rows = Vec::new();
    let mut values = Vec::new();
    let mut time = Vec::new();
    let mut status = Vec::new();
    for i in 0..data.n_rows() {
        let (t, s) = (time_all[i], status_all[i]);
        if t.is_nan() || !(s == 0.0 || s == 1.0) {
            continue;
        }
        let raw: Vec<f64> = raw_cols.iter().map(|c| c[i]).collect();
        let row = layout.expand_row(&raw);
        if row.iter().any(|v| v.is_nan()) {
            continue;
        }
        rows.push(i);
        values.extend(row);
        time.push(t);
        status.push(s as u8);
    }
    let dropped = data.n_rows() - rows.len();
    if dropped > 0 {
        debug!("{dropped} row(s) with missing values dropped from the design");
    }
    if rows.is_empty() {
        return Err(FitError::NoRows);
    }
    let x = Array2::from_shape_vec((rows.len(), names.len()), values)
        .map_err(|_| FitError::NoRows)?;
    Ok(Design {
        layout,
        names,
        sources,
        x,
        time,
        status,
        rows,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Factor;

    fn table() -> SurvivalData {
        // time, status, age, treat
        let numeric = vec![
            10.0, 1.0, 30.0, 1.0, //
            20.0, 0.0, 40.0, 0.0, //
            15.0, 1.0, f64::NAN, 1.0, //
            f64::NAN, 1.0, 50.0, 0.0, //
            30.0, 1.0, 60.0, 1.0,
        ];
        let mut data = SurvivalData {
            ids: (1..=5).map(|i| i.to_string()).collect(),
            headers: vec!["time".into(), "status".into(), "age".into(), "treat".into()],
            numeric_data: Array2::from_shape_vec((5, 4), numeric).unwrap(),
            ..SurvivalData::default()
        };
        let f = Factor::with_levels("centre", &["a".into(), "b".into(), "c".into()], None);
        data.set_factor_column(f, &[0.0, 1.0, 2.0, 0.0, 2.0]);
        data
    }

    #[test]
    fn test_listwise_deletion() -> Result<(), FitError> {
        let data = table();
        let d = build_design(&data, "time", "status", &["age".into(), "treat".into()], &[], true)?;
        assert_eq!(d.rows, vec![0, 1, 4]);
        assert_eq!(d.dropped, 2);
        assert_eq!(d.events(), 2);
        assert_eq!(d.names, vec!["age", "treat"]);
        Ok(())
    }

    #[test]
    fn test_factor_dummies_and_interactions() -> Result<(), FitError> {
        let data = table();
        let d = build_design(
            &data,
            "time",
            "status",
            &["centre".into(), "treat".into()],
            &[("centre".into(), "treat".into())],
            true,
        )?;
        assert_eq!(
            d.names,
            vec!["centre=b", "centre=c", "treat", "centre=b:treat", "centre=c:treat"]
        );
        assert_eq!(d.sources[3], "centre:treat");
        // row 4: centre c, treat 1
        let last = d.x.row(d.n() - 1).to_vec();
        assert_eq!(last, vec![0.0, 1.0, 1.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_unexpanded_factor_is_one_column() -> Result<(), FitError> {
        let data = table();
        let d = build_design(&data, "time", "status", &["centre".into()], &[], false)?;
        assert_eq!(d.names, vec!["centre"]);
        assert_eq!(d.x[[1, 0]], 1.0);
        Ok(())
    }

    #[test]
    fn test_unknown_covariate() {
        let data = table();
        let err = build_design(&data, "time", "status", &["weight".into()], &[], true).unwrap_err();
        assert_eq!(err, FitError::UnknownCovariate("weight".into()));
    }
}
