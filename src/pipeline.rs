//! The analysis run from raw table to report, one stage after the other.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::compare::{
    aic_groups, important_covariates, likelihood_ratio_test, reduce_covariates,
    select_best_parametric, significant_covariates, split_interactions, AicGroup,
    LikelihoodRatioTest,
};
use crate::config::AnalysisConfig;
use crate::data::features::derive_features;
use crate::data::normalize::{normalize, NormalizeReport};
use crate::data::validate::{validate, ValidationReport};
use crate::data::{load_table, SurvivalData};
use crate::describe::{BalanceTable, CrossTab, Histogram};
use crate::error::PredictError;
use crate::models::{
    fit_all, fit_model, log_rank_test, Family, KaplanMeier, LogRankTest, ModelRun, ModelSpec,
    ModelSummary,
};
use crate::plot;
use crate::predict::{predict_quantiles, ProfilePrediction};
use crate::report;

/// Everything the descriptive stages produce.
#[derive(Debug, Clone)]
pub struct Description {
    pub input: String,
    pub n_rows: usize,
    pub normalize: NormalizeReport,
    /// EEG table after the correction.
    pub eeg_corrected: Option<CrossTab>,
    pub age_bands: Option<CrossTab>,
    pub sex_by_arm: Option<CrossTab>,
    pub validation: ValidationReport,
    pub histograms: Vec<Histogram>,
    pub balance: BalanceTable,
    pub km: Vec<KaplanMeier>,
    pub log_rank: LogRankTest,
}

/// Output of the model comparator.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    /// AIC rankings, one per group of comparable fits.
    pub aic_groups: Vec<AicGroup>,
    /// Fitted models without an AIC.
    pub unranked: Vec<String>,
    /// Flagged covariate sets, labelled by the model that produced them.
    pub flagged: Vec<(String, Vec<String>)>,
    pub reduced: Vec<String>,
    pub reduced_interactions: Vec<(String, String)>,
    pub best_parametric: Option<String>,
    /// Parametric fits left out of the AIC choice: `(model, rows used)`.
    pub skipped: Vec<(String, usize)>,
    pub likelihood_ratio_tests: Vec<LikelihoodRatioTest>,
}

/// A complete run.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub description: Description,
    pub runs: Vec<ModelRun>,
    pub comparison: Comparison,
    pub final_run: ModelRun,
    pub probabilities: Vec<f64>,
    pub predictions: Vec<ProfilePrediction>,
    pub prediction_errors: Vec<(String, PredictError)>,
    /// `(caption, file name)` relative to the output directory.
    pub figures: Vec<(String, String)>,
}

/// Load, normalise, derive and validate. The returned table is read-only
/// from here on.
pub fn prepare<P: AsRef<Path>>(
    file: P,
    delimiter: u8,
    config: &AnalysisConfig,
) -> Result<(SurvivalData, NormalizeReport, ValidationReport)> {
    let file = file.as_ref();
    let mut data = load_table(file, delimiter, config)?;
    let normalized = normalize(&mut data, &config.recoding)?;
    derive_features(&mut data, &config.columns.age, &config.features)?;
    let validation = validate(&data, &config.columns, &config.checks, &normalized)
        .with_context(|| format!("Consistency check failed for '{}'", file.display()))?;
    Ok((data, normalized, validation))
}

/// Kaplan-Meier curve per treatment arm and the log-rank test between them.
/// Rows missing time, status or arm are left out.
fn km_by_arm(data: &SurvivalData, config: &AnalysisConfig) -> Result<(Vec<KaplanMeier>, LogRankTest)> {
    let c = &config.columns;
    let time = data.column(&c.time)?;
    let status = data.column(&c.status)?;
    let arm = data.column(&c.treatment)?;

    let mut arms: Vec<f64> = arm.iter().copied().filter(|v| !v.is_nan()).collect();
    arms.sort_by(f64::total_cmp);
    arms.dedup();
    let labels: Vec<String> = arms
        .iter()
        .map(|&a| data.display_value(&c.treatment, a))
        .collect();

    let (mut t, mut s, mut g) = (Vec::new(), Vec::new(), Vec::new());
    for i in 0..data.n_rows() {
        if time[i].is_nan() || status[i].is_nan() {
            continue;
        }
        let Some(k) = arms.iter().position(|&a| a == arm[i]) else {
            continue;
        };
        t.push(time[i]);
        s.push(u8::from(status[i] == 1.0));
        g.push(k);
    }

    let curves: Vec<KaplanMeier> = labels
        .iter()
        .enumerate()
        .map(|(k, label)| {
            let (tk, sk): (Vec<f64>, Vec<u8>) = (0..g.len())
                .filter(|&i| g[i] == k)
                .map(|i| (t[i], s[i]))
                .unzip();
            KaplanMeier::fit(label, &tk, &sk)
        })
        .collect();
    let test = log_rank_test(&t, &s, &g, &labels);
    info!(
        "Log-rank test between {}: chi2 = {:.3} on {} df, p = {:.4}",
        labels.join(" / "),
        test.chi_square,
        test.df,
        test.p_value
    );
    Ok((curves, test))
}

/// Covariates summarised per arm: every numeric covariate any model uses.
fn balance_variables(data: &SurvivalData, config: &AnalysisConfig) -> Vec<String> {
    let mut vars: Vec<String> = Vec::new();
    for spec in &config.models {
        for cov in &spec.covariates {
            if cov != &config.columns.treatment
                && data.has_column(cov)
                && !data.is_factor(cov)
                && !vars.contains(cov)
            {
                vars.push(cov.clone());
            }
        }
    }
    vars
}

/// The descriptive stages on a prepared table.
pub fn describe(
    input: &str,
    data: &SurvivalData,
    normalized: NormalizeReport,
    validation: ValidationReport,
    config: &AnalysisConfig,
) -> Result<Description> {
    let eeg_corrected = match &config.recoding.eeg_correction {
        Some(rule) if data.has_column(&rule.performed) && data.has_column(&rule.abnormal) => {
            Some(CrossTab::new(data, &rule.performed, &rule.abnormal)?)
        }
        _ => None,
    };
    let age_bands = if data.has_column(&config.features.age_band_column) {
        Some(CrossTab::new(
            data,
            &config.features.age_band_column,
            &config.columns.treatment,
        )?)
    } else {
        None
    };
    let sex_by_arm = if data.has_column(&config.columns.sex) {
        Some(CrossTab::new(
            data,
            &config.columns.sex,
            &config.columns.treatment,
        )?)
    } else {
        None
    };

    let f = &config.features;
    let mut histograms = Vec::new();
    for var in [
        &config.columns.age,
        &f.period_column,
        &f.log_period_column,
        &f.previous_column,
    ] {
        if data.has_column(var) {
            let values = data.as_vec_f64(var)?;
            histograms.push(Histogram::new(var, &values, config.output.histogram_bins));
        }
    }

    let balance = BalanceTable::new(
        data,
        &config.columns.treatment,
        &balance_variables(data, config),
    )?;
    let (km, log_rank) = km_by_arm(data, config)?;

    Ok(Description {
        input: input.to_string(),
        n_rows: data.n_rows(),
        normalize: normalized,
        eeg_corrected,
        age_bands,
        sex_by_arm,
        validation,
        histograms,
        balance,
        km,
        log_rank,
    })
}

fn summary_of<'a>(summaries: &'a [ModelSummary], name: &str) -> Option<&'a ModelSummary> {
    summaries.iter().find(|s| s.name == name)
}

/// `small` is nested in `big`: same family, a strict subset of the terms.
fn is_nested(small: &ModelRun, big: &ModelRun) -> bool {
    small.spec.family == big.spec.family
        && small.spec.name != big.spec.name
        && small.spec.covariates.iter().all(|c| big.spec.covariates.contains(c))
        && small.spec.interactions.iter().all(|i| big.spec.interactions.contains(i))
        && small.spec.covariates.len() + small.spec.interactions.len()
            < big.spec.covariates.len() + big.spec.interactions.len()
}

/// Likelihood ratio tests for every nested pair fitted on the same rows.
fn nested_tests(runs: &[&ModelRun]) -> Vec<LikelihoodRatioTest> {
    let mut tests = Vec::new();
    for small in runs {
        for big in runs {
            if !is_nested(small, big) {
                continue;
            }
            let (Some(s), Some(b)) = (small.summary(), big.summary()) else {
                continue;
            };
            if s.n != b.n {
                // listwise deletion left different rows
                continue;
            }
            tests.extend(likelihood_ratio_test(&s, &b));
        }
    }
    tests
}

/// Rank the fits and narrow the covariate set.
pub fn compare_models(runs: &[ModelRun], config: &AnalysisConfig) -> Comparison {
    let summaries: Vec<ModelSummary> = runs.iter().filter_map(ModelRun::summary).collect();
    let cmp = &config.comparison;

    let unranked = summaries
        .iter()
        .filter(|s| s.aic.is_none())
        .map(|s| s.name.clone())
        .collect();

    let mut flagged = Vec::new();
    for name in &cmp.significance_from {
        match summary_of(&summaries, name) {
            Some(s) => flagged.push((
                format!("{name} (p < {})", cmp.alpha),
                significant_covariates(s, cmp.alpha),
            )),
            None => warn!("'{name}' was not fitted - left out of the covariate selection"),
        }
    }
    if let Some(name) = &cmp.importance_from {
        match summary_of(&summaries, name) {
            Some(s) if s.importance.is_some() => flagged.push((
                format!("{name} (importance > {})", cmp.importance_threshold),
                important_covariates(s, cmp.importance_threshold),
            )),
            _ => warn!("'{name}' has no importance scores - left out of the covariate selection"),
        }
    }
    let sets: Vec<Vec<String>> = flagged.iter().map(|(_, s)| s.clone()).collect();
    let (mains, reduced_interactions) = split_interactions(&reduce_covariates(&sets));
    let mut reduced = cmp.always_include.clone();
    for cov in mains {
        if !reduced.contains(&cov) {
            reduced.push(cov);
        }
    }
    info!("Reduced covariate set: {}", reduced.join(", "));

    let (best, skipped) = select_best_parametric(&summaries);
    let best_parametric = best.map(|s| s.name.clone());
    let skipped = skipped.into_iter().map(|s| (s.name.clone(), s.n)).collect();

    let ok_runs: Vec<&ModelRun> = runs.iter().filter(|r| r.result.is_ok()).collect();
    Comparison {
        aic_groups: aic_groups(&summaries),
        unranked,
        flagged,
        reduced,
        reduced_interactions,
        best_parametric,
        skipped,
        likelihood_ratio_tests: nested_tests(&ok_runs),
    }
}

/// Specification of the model used for prediction.
pub fn final_spec(runs: &[ModelRun], comparison: &Comparison, config: &AnalysisConfig) -> ModelSpec {
    let fm = &config.final_model;
    let family = fm.family.unwrap_or_else(|| {
        comparison
            .best_parametric
            .as_ref()
            .and_then(|name| runs.iter().find(|r| &r.spec.name == name))
            .map_or(Family::Weibull, |r| r.spec.family)
    });
    if !family.is_parametric() {
        warn!("Final family {family} cannot predict quantiles");
    }
    let (covariates, mut interactions) = match &fm.covariates {
        Some(c) => (c.clone(), Vec::new()),
        None => (comparison.reduced.clone(), comparison.reduced_interactions.clone()),
    };
    for pair in &fm.interactions {
        if !interactions.contains(pair) {
            interactions.push(pair.clone());
        }
    }
    ModelSpec {
        name: fm.name.clone(),
        family,
        covariates,
        interactions,
    }
}

/// Write the figures that have data behind them; returns `(caption, file)`.
fn write_figures(
    description: &Description,
    predictions: &[ProfilePrediction],
    out_dir: &Path,
) -> Result<Vec<(String, String)>> {
    let mut figures = Vec::new();
    for hist in &description.histograms {
        if hist.counts.is_empty() {
            continue;
        }
        let file = format!("hist_{}.svg", hist.variable);
        plot::plot_histogram(hist, &out_dir.join(&file))?;
        figures.push((format!("Histogram of {}", hist.variable), file));
    }
    if !description.km.is_empty() {
        let file = "km_by_arm.svg".to_string();
        plot::plot_kaplan_meier(
            &description.km,
            "Time to first seizure by treatment arm",
            &out_dir.join(&file),
        )?;
        figures.push(("Kaplan-Meier curves by arm".to_string(), file));
    }
    if !predictions.is_empty() {
        let file = "predicted_quantiles.svg".to_string();
        plot::plot_quantiles(predictions, "Predicted time to first seizure", &out_dir.join(&file))?;
        figures.push(("Predicted quantiles with +/- 2 SE".to_string(), file));
    }
    Ok(figures)
}

/// Run every stage and write `report.md`, `normalized.tsv` and the figures
/// into `out_dir`.
pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(
    file: P,
    delimiter: u8,
    config: &AnalysisConfig,
    out_dir: Q,
) -> Result<Analysis> {
    let file = file.as_ref();
    let out_dir: PathBuf = out_dir.as_ref().to_path_buf();
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create output directory '{}'", out_dir.display()))?;

    let (data, normalized, validation) = prepare(file, delimiter, config)?;
    if config.output.export_normalized {
        let path = out_dir.join("normalized.tsv");
        data.to_file(&path, delimiter)?;
        info!("Table as the pipeline sees it written to {}", path.display());
    }
    let description = describe(
        &file.display().to_string(),
        &data,
        normalized,
        validation,
        config,
    )?;

    let runs = fit_all(&data, &config.columns, &config.models, &config.forest);
    let comparison = compare_models(&runs, config);

    let spec = final_spec(&runs, &comparison, config);
    info!("Final model: {} with {}", spec.family, spec.covariates.join(", "));
    let result = fit_model(&data, &config.columns, &spec, &config.forest);
    if let Err(e) = &result {
        warn!("Final model could not be fitted: {e}");
    }
    let final_run = ModelRun { spec, result };

    let mut predictions = Vec::new();
    let mut prediction_errors = Vec::new();
    if let Some(aft) = final_run.result.as_ref().ok().and_then(|m| m.as_aft()) {
        for profile in &config.prediction.profiles {
            match predict_quantiles(aft, profile, &config.prediction.probabilities) {
                Ok(p) => predictions.push(p),
                Err(e) => {
                    warn!("No prediction for '{}': {e}", profile.name);
                    prediction_errors.push((profile.name.clone(), e));
                }
            }
        }
    }

    let figures = if config.output.plots {
        write_figures(&description, &predictions, &out_dir)?
    } else {
        Vec::new()
    };

    let analysis = Analysis {
        description,
        runs,
        comparison,
        final_run,
        probabilities: config.prediction.probabilities.clone(),
        predictions,
        prediction_errors,
        figures,
    };
    let report_path = out_dir.join("report.md");
    fs::write(&report_path, report::render(&analysis))
        .with_context(|| format!("Failed to write '{}'", report_path.display()))?;
    info!("Report written to {}", report_path.display());
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FitError;
    use crate::models::Coefficient;

    fn failed(name: &str, family: Family, covs: &[&str]) -> ModelRun {
        let covs: Vec<String> = covs.iter().map(|s| s.to_string()).collect();
        ModelRun {
            spec: ModelSpec::new(name, family, &covs),
            result: Err(FitError::NoRows),
        }
    }

    #[test]
    fn test_nesting_needs_same_family_and_fewer_terms() {
        let small = failed("a", Family::Weibull, &["treat"]);
        let big = failed("b", Family::Weibull, &["treat", "age"]);
        let other = failed("c", Family::Cox, &["treat", "age"]);
        assert!(is_nested(&small, &big));
        assert!(!is_nested(&big, &small));
        assert!(!is_nested(&small, &other));
        assert!(!is_nested(&small, &small));
    }

    #[test]
    fn test_final_spec_defaults_to_weibull_and_reduced_set() {
        let config = AnalysisConfig::default();
        let comparison = Comparison {
            reduced: vec!["treat".into(), "age".into()],
            ..Comparison::default()
        };
        let spec = final_spec(&[], &comparison, &config);
        assert_eq!(spec.family, Family::Weibull);
        assert_eq!(spec.covariates, vec!["treat", "age"]);
    }

    #[test]
    fn test_flagged_interaction_becomes_an_interaction_term() {
        let config = AnalysisConfig::default();
        let comparison = Comparison {
            reduced: vec!["treat".into(), "age".into(), "sex".into()],
            reduced_interactions: vec![("age".into(), "sex".into())],
            ..Comparison::default()
        };
        let spec = final_spec(&[], &comparison, &config);
        assert_eq!(spec.covariates, vec!["treat", "age", "sex"]);
        assert_eq!(spec.interactions, vec![("age".to_string(), "sex".to_string())]);
        assert!(spec.covariates.iter().all(|c| !c.contains(':')));
    }

    #[test]
    fn test_failed_runs_are_left_out_of_the_comparison() {
        let mut config = AnalysisConfig::default();
        config.comparison.significance_from = vec!["cox_full".into()];
        config.comparison.importance_from = None;
        let runs = vec![failed("cox_full", Family::Cox, &["treat"])];
        let cmp = compare_models(&runs, &config);
        assert!(cmp.aic_groups.is_empty());
        assert!(cmp.unranked.is_empty());
        assert!(cmp.flagged.is_empty());
        assert_eq!(cmp.reduced, vec!["treat"]);
        assert!(cmp.best_parametric.is_none());
    }

    #[test]
    fn test_summary_lookup_by_name() {
        let s = ModelSummary {
            name: "cox_full".into(),
            family: Family::Cox,
            covariates: vec!["treat".into()],
            n: 10,
            events: 5,
            coefficients: vec![Coefficient::new("treat", Some("treat"), 1.0, 0.1)],
            log_likelihood: Some(-3.0),
            aic: Some(8.0),
            concordance: None,
            importance: None,
            oob_error: None,
        };
        let all = vec![s];
        assert!(summary_of(&all, "cox_full").is_some());
        assert!(summary_of(&all, "forest").is_none());
    }
}
