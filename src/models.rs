pub mod aalen;
pub mod aft;
pub mod cox;
pub mod design;
pub mod kaplan_meier;
pub mod linalg;
pub mod metrics;
pub mod rsf;

use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{ColumnSchema, ForestConfig};
use crate::data::SurvivalData;
use crate::error::FitError;

pub use aalen::AalenModel;
pub use aft::AftModel;
pub use cox::CoxModel;
pub use design::{build_design, Design, DesignLayout};
pub use kaplan_meier::{log_rank_test, KaplanMeier, LogRankTest};
pub use rsf::ForestModel;

const COX_MAX_ITER: usize = 50;
const COX_TOL: f64 = 1e-9;
const AFT_MAX_ITER: usize = 100;
const AFT_TOL: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Cox,
    Aalen,
    Exponential,
    Weibull,
    LogNormal,
    LogLogistic,
    RandomForest,
}

impl Family {
    /// Families with a likelihood on the time scale, usable for prediction.
    pub fn is_parametric(self) -> bool {
        matches!(
            self,
            Family::Exponential | Family::Weibull | Family::LogNormal | Family::LogLogistic
        )
    }

    pub fn parametric() -> [Family; 4] {
        [
            Family::Exponential,
            Family::Weibull,
            Family::LogNormal,
            Family::LogLogistic,
        ]
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Cox => "Cox PH",
            Family::Aalen => "Aalen additive",
            Family::Exponential => "exponential AFT",
            Family::Weibull => "Weibull AFT",
            Family::LogNormal => "log-normal AFT",
            Family::LogLogistic => "log-logistic AFT",
            Family::RandomForest => "random survival forest",
        };
        write!(f, "{name}")
    }
}

/// One model to fit: family, covariates and pairwise interactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub family: Family,
    pub covariates: Vec<String>,
    #[serde(default)]
    pub interactions: Vec<(String, String)>,
}

impl ModelSpec {
    pub fn new(name: &str, family: Family, covariates: &[String]) -> Self {
        ModelSpec {
            name: name.to_string(),
            family,
            covariates: covariates.to_vec(),
            interactions: Vec::new(),
        }
    }

    pub fn with_interaction(mut self, a: &str, b: &str) -> Self {
        self.interactions.push((a.to_string(), b.to_string()));
        self
    }
}

/// One estimated coefficient with its Wald test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coefficient {
    pub name: String,
    /// Covariate (or `a:b` interaction) the design column belongs to;
    /// `None` for the intercept and scale.
    pub covariate: Option<String>,
    pub estimate: f64,
    pub se: f64,
    pub z: f64,
    pub p: f64,
}

impl Coefficient {
    pub fn new(name: &str, covariate: Option<&str>, estimate: f64, se: f64) -> Self {
        let z = estimate / se;
        Coefficient {
            name: name.to_string(),
            covariate: covariate.map(str::to_string),
            estimate,
            se,
            z,
            p: metrics::two_sided_p(z),
        }
    }
}

/// What every fitted model reports, whatever its family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub family: Family,
    pub covariates: Vec<String>,
    pub n: usize,
    pub events: usize,
    pub coefficients: Vec<Coefficient>,
    pub log_likelihood: Option<f64>,
    pub aic: Option<f64>,
    pub concordance: Option<f64>,
    /// Forest only: permutation importance per covariate.
    pub importance: Option<Vec<(String, f64)>>,
    pub oob_error: Option<f64>,
}

impl ModelSummary {
    /// Number of free parameters behind the log-likelihood.
    pub fn n_parameters(&self) -> usize {
        self.coefficients.len()
    }
}

#[derive(Debug, Clone)]
pub enum FittedModel {
    Cox(CoxModel),
    Aalen(AalenModel),
    Aft(AftModel),
    Forest(ForestModel),
}

impl FittedModel {
    pub fn summary(&self, spec: &ModelSpec) -> ModelSummary {
        let mut summary = ModelSummary {
            name: spec.name.clone(),
            family: spec.family,
            covariates: spec.covariates.clone(),
            n: 0,
            events: 0,
            coefficients: Vec::new(),
            log_likelihood: None,
            aic: None,
            concordance: None,
            importance: None,
            oob_error: None,
        };
        match self {
            FittedModel::Cox(m) => {
                summary.n = m.n;
                summary.events = m.events;
                summary.coefficients = m.coefficients();
                summary.log_likelihood = Some(m.log_likelihood);
                summary.aic = Some(m.aic());
                summary.concordance = Some(m.concordance);
            }
            FittedModel::Aalen(m) => {
                summary.n = m.n;
                summary.events = m.events;
                summary.coefficients = m.coefficients();
            }
            FittedModel::Aft(m) => {
                summary.n = m.n;
                summary.events = m.events;
                summary.coefficients = m.coefficients();
                summary.log_likelihood = Some(m.log_likelihood);
                summary.aic = Some(m.aic());
                summary.concordance = Some(m.concordance);
            }
            FittedModel::Forest(m) => {
                summary.n = m.n;
                summary.events = m.events;
                summary.importance = Some(m.importance.clone());
                summary.oob_error = Some(m.oob_error);
                summary.concordance = Some(1.0 - m.oob_error);
            }
        }
        summary
    }

    pub fn as_aft(&self) -> Option<&AftModel> {
        match self {
            FittedModel::Aft(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_forest(&self) -> Option<&ForestModel> {
        match self {
            FittedModel::Forest(m) => Some(m),
            _ => None,
        }
    }
}

/// Fit one model specification on the table.
///
/// Rows missing any of the model's values are dropped for this fit only.
/// The forest splits on raw covariate values, so factors are not expanded
/// and interactions are ignored for it.
pub fn fit_model(
    data: &SurvivalData,
    columns: &ColumnSchema,
    spec: &ModelSpec,
    forest: &ForestConfig,
) -> Result<FittedModel, FitError> {
    let is_forest = spec.family == Family::RandomForest;
    let interactions: &[(String, String)] = if is_forest { &[] } else { &spec.interactions };
    if is_forest && !spec.interactions.is_empty() {
        warn!("{}: interactions are ignored by the forest", spec.name);
    }
    let design = build_design(
        data,
        &columns.time,
        &columns.status,
        &spec.covariates,
        interactions,
        !is_forest,
    )?;
    info!(
        "Fitting '{}' ({}): {} rows, {} events, {} dropped",
        spec.name,
        spec.family,
        design.n(),
        design.events(),
        design.dropped
    );
    let fitted = match spec.family {
        Family::Cox => FittedModel::Cox(cox::fit_cox(&design, COX_MAX_ITER, COX_TOL)?),
        Family::Aalen => FittedModel::Aalen(aalen::fit_aalen(&design)?),
        Family::Exponential | Family::Weibull | Family::LogNormal | Family::LogLogistic => {
            FittedModel::Aft(aft::fit_aft(&design, spec.family, AFT_MAX_ITER, AFT_TOL)?)
        }
        Family::RandomForest => FittedModel::Forest(rsf::fit_forest(&design, forest)?),
    };
    Ok(fitted)
}

/// A model specification with the outcome of its fit. Failed fits stay in
/// the run so they can be reported.
#[derive(Debug, Clone)]
pub struct ModelRun {
    pub spec: ModelSpec,
    pub result: Result<FittedModel, FitError>,
}

impl ModelRun {
    pub fn summary(&self) -> Option<ModelSummary> {
        self.result.as_ref().ok().map(|m| m.summary(&self.spec))
    }
}

/// Fit every specification in order; a failure is logged and recorded, and
/// the next specification is fitted anyway.
pub fn fit_all(
    data: &SurvivalData,
    columns: &ColumnSchema,
    specs: &[ModelSpec],
    forest: &ForestConfig,
) -> Vec<ModelRun> {
    specs
        .iter()
        .map(|spec| {
            let result = fit_model(data, columns, spec, forest);
            if let Err(e) = &result {
                warn!("Model '{}' could not be fitted: {e}", spec.name);
            }
            ModelRun {
                spec: spec.clone(),
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn table() -> SurvivalData {
        let n = 60;
        let mut numeric = Vec::with_capacity(n * 4);
        for i in 0..n {
            let treat = (i % 2) as f64;
            let age = 20.0 + ((i * 37) % 50) as f64;
            let base = ((i / 2 * 13) % 23 + 1) as f64 * 15.0;
            let time = if treat == 1.0 { base * 1.8 } else { base };
            let status = if i % 7 == 0 { 0.0 } else { 1.0 };
            numeric.extend([time, status, treat, age]);
        }
        SurvivalData {
            ids: (0..n).map(|i| format!("p{i}")).collect(),
            headers: vec!["time".into(), "status".into(), "treat".into(), "age".into()],
            numeric_data: Array2::from_shape_vec((n, 4), numeric).unwrap(),
            ..SurvivalData::default()
        }
    }

    fn covs() -> Vec<String> {
        vec!["treat".to_string(), "age".to_string()]
    }

    #[test]
    fn test_every_family_produces_a_summary() {
        let data = table();
        let columns = ColumnSchema::default();
        let forest = ForestConfig {
            n_trees: 20,
            min_node_size: 5,
            ..ForestConfig::default()
        };
        let specs: Vec<ModelSpec> = [
            Family::Cox,
            Family::Aalen,
            Family::Exponential,
            Family::Weibull,
            Family::LogNormal,
            Family::LogLogistic,
            Family::RandomForest,
        ]
        .iter()
        .map(|&f| ModelSpec::new(&format!("{f:?}"), f, &covs()))
        .collect();
        let runs = fit_all(&data, &columns, &specs, &forest);
        for run in &runs {
            let summary = run
                .summary()
                .unwrap_or_else(|| panic!("{} failed: {:?}", run.spec.name, run.result));
            assert_eq!(summary.n, 60);
            assert_eq!(summary.aic.is_some(), matches!(run.spec.family, Family::Cox) || run.spec.family.is_parametric());
            if run.spec.family == Family::RandomForest {
                assert_eq!(summary.importance.as_ref().map(Vec::len), Some(2));
            }
        }
    }

    #[test]
    fn test_failed_fit_does_not_stop_the_run() {
        let data = table();
        let columns = ColumnSchema::default();
        let specs = vec![
            ModelSpec::new("bad", Family::Cox, &["weight".to_string()]),
            ModelSpec::new("good", Family::Cox, &covs()),
        ];
        let runs = fit_all(&data, &columns, &specs, &ForestConfig::default());
        assert_eq!(
            runs[0].result.as_ref().err(),
            Some(&FitError::UnknownCovariate("weight".into()))
        );
        assert!(runs[1].result.is_ok());
    }

    #[test]
    fn test_interaction_column_is_named() -> Result<(), FitError> {
        let data = table();
        let spec = ModelSpec::new("ix", Family::Cox, &covs()).with_interaction("treat", "age");
        let fitted = fit_model(&data, &ColumnSchema::default(), &spec, &ForestConfig::default())?;
        let names: Vec<String> = fitted
            .summary(&spec)
            .coefficients
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(names, vec!["treat", "age", "treat:age"]);
        Ok(())
    }

    #[test]
    fn test_coefficient_wald_test() {
        let c = Coefficient::new("treat", Some("treat"), -0.5, 0.25);
        assert_eq!(c.z, -2.0);
        assert!((c.p - 0.0455).abs() < 1e-3);
    }
}
