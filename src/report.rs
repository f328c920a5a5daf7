//! Markdown rendering of a run.

use std::fmt::{self, Write};

use crate::models::{AalenModel, Coefficient, Family, FittedModel, ForestModel, KaplanMeier, ModelRun};
use crate::pipeline::{Analysis, Comparison, Description};
use crate::predict::ProfilePrediction;

/// Times at which the Aalen cumulative regression functions are tabulated.
const AALEN_TIMES: [f64; 4] = [90.0, 180.0, 365.0, 730.0];

fn fmt_opt(v: Option<f64>, digits: usize) -> String {
    match v {
        Some(x) if x.is_finite() => format!("{x:.digits$}"),
        _ => "NA".to_string(),
    }
}

fn fmt_p(p: f64) -> String {
    if p < 1e-4 {
        "<0.0001".to_string()
    } else {
        format!("{p:.4}")
    }
}

fn km_table<W: Write>(out: &mut W, curves: &[KaplanMeier]) -> fmt::Result {
    writeln!(
        out,
        "| arm | n | events | median | 25% seizure by | seizure free at 1 year |\n|---|---:|---:|---:|---:|---:|"
    )?;
    for km in curves {
        writeln!(
            out,
            "| {} | {} | {} | {} | {} | {:.3} |",
            km.label,
            km.n,
            km.events(),
            fmt_opt(km.median(), 0),
            fmt_opt(km.quantile(0.25), 0),
            km.survival_at(365.0)
        )?;
    }
    Ok(())
}

/// The descriptive stages; `describe` prints exactly this.
impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "## Data\n")?;
        writeln!(f, "Input `{}`: {} subjects.\n", self.input, self.n_rows)?;

        let n = &self.normalize;
        if !n.unknown_codes.is_empty() {
            writeln!(f, "Codes outside the recoding table (set to NA):\n")?;
            for (col, k) in &n.unknown_codes {
                writeln!(f, "- `{col}`: {k}")?;
            }
            writeln!(f)?;
        }
        if !n.missing_dates.is_empty() {
            writeln!(f, "| date column | missing | unparsed |\n|---|---:|---:|")?;
            for (col, k) in &n.missing_dates {
                let bad = n.unparsed_dates.get(col).map_or(0, Vec::len);
                writeln!(f, "| {col} | {k} | {bad} |")?;
            }
            writeln!(f)?;
        }

        if let Some(raw) = &n.eeg_raw {
            writeln!(f, "### EEG consistency\n")?;
            writeln!(f, "Raw codes before recoding:\n\n{}", raw.to_markdown())?;
            writeln!(
                f,
                "{} subject(s) had an abnormal EEG recorded without an EEG and were corrected.\n",
                n.eeg_corrected
            )?;
            if let Some(fixed) = &self.eeg_corrected {
                writeln!(f, "After correction:\n\n{}", fixed.to_markdown())?;
            }
        }

        let v = &self.validation;
        writeln!(f, "### Consistency checks\n")?;
        writeln!(
            f,
            "{} subject(s) lack both the first seizure date and the period; they are kept and dropped per fit.\n",
            v.jointly_missing.len()
        )?;
        if !v.unparsed_dates.is_empty() {
            writeln!(
                f,
                "{} subject(s) have a first seizure date that could not be read ({}); it is treated as missing.\n",
                v.unparsed_dates.len(),
                v.unparsed_dates.join(", ")
            )?;
        }
        if v.outcome_issues.is_empty() {
            writeln!(f, "No inconsistent outcomes.\n")?;
        } else {
            writeln!(f, "| subject | problem |\n|---|---|")?;
            for (id, problem) in &v.outcome_issues {
                writeln!(f, "| {id} | {problem} |")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "## Description\n")?;
        if let Some(bands) = &self.age_bands {
            writeln!(f, "### Age bands\n\n{}", bands.to_markdown())?;
        }
        if let Some(sex) = &self.sex_by_arm {
            writeln!(f, "### Sex by arm\n\n{}", sex.to_markdown())?;
        }
        writeln!(f, "### Balance between arms\n\n{}", self.balance.to_markdown())?;
        for hist in &self.histograms {
            writeln!(f, "```\n{hist}```\n")?;
        }

        writeln!(f, "### Time to first seizure by arm\n")?;
        km_table(f, &self.km)?;
        let lr = &self.log_rank;
        writeln!(
            f,
            "\nLog-rank test: chi-square {:.3} on {} df, p = {}.\n",
            lr.chi_square,
            lr.df,
            fmt_p(lr.p_value)
        )
    }
}

fn coefficient_table<W: Write>(out: &mut W, family: Family, coefficients: &[Coefficient]) -> fmt::Result {
    let ratio = match family {
        Family::Cox => Some("HR"),
        f if f.is_parametric() => Some("time ratio"),
        _ => None,
    };
    match ratio {
        Some(r) => writeln!(
            out,
            "| term | estimate | SE | z | p | {r} (95% CI) |\n|---|---:|---:|---:|---:|---:|"
        )?,
        None => writeln!(out, "| term | estimate | SE | z | p |\n|---|---:|---:|---:|---:|")?,
    }
    for c in coefficients {
        write!(
            out,
            "| {} | {:.4} | {:.4} | {:.3} | {} |",
            c.name,
            c.estimate,
            c.se,
            c.z,
            fmt_p(c.p)
        )?;
        if ratio.is_some() {
            if c.covariate.is_some() {
                write!(
                    out,
                    " {:.3} ({:.3}, {:.3}) |",
                    c.estimate.exp(),
                    (c.estimate - 1.96 * c.se).exp(),
                    (c.estimate + 1.96 * c.se).exp()
                )?;
            } else {
                write!(out, " |")?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

fn aalen_table<W: Write>(out: &mut W, m: &AalenModel) -> fmt::Result {
    let Some(last) = m.last_time() else {
        return Ok(());
    };
    let times: Vec<f64> = AALEN_TIMES.iter().copied().filter(|&t| t <= last).collect();
    if times.is_empty() {
        return Ok(());
    }
    write!(out, "| term |")?;
    for t in &times {
        write!(out, " B({t}) |")?;
    }
    write!(out, "\n|---|")?;
    for _ in &times {
        write!(out, "---:|")?;
    }
    writeln!(out)?;
    let rows: Vec<_> = times.iter().filter_map(|&t| m.cumulative_at(t)).collect();
    for (j, name) in m.names.iter().enumerate() {
        write!(out, "| {name} |")?;
        for row in &rows {
            write!(out, " {:.4} |", row[j])?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn forest_table<W: Write>(out: &mut W, m: &ForestModel) -> fmt::Result {
    writeln!(out, "| covariate | importance |\n|---|---:|")?;
    for (name, v) in m.ranked_importance() {
        writeln!(out, "| {name} | {v:.4} |")?;
    }
    Ok(())
}

fn write_run<W: Write>(out: &mut W, run: &ModelRun) -> fmt::Result {
    let spec = &run.spec;
    writeln!(out, "### {} ({})\n", spec.name, spec.family)?;
    let terms: Vec<String> = spec
        .covariates
        .iter()
        .cloned()
        .chain(spec.interactions.iter().map(|(a, b)| format!("{a}:{b}")))
        .collect();
    writeln!(out, "Covariates: {}\n", terms.join(", "))?;
    let model = match &run.result {
        Ok(m) => m,
        Err(e) => return writeln!(out, "**Fit failed:** {e}\n"),
    };
    let summary = model.summary(spec);
    writeln!(
        out,
        "n = {}, events = {}, log-likelihood = {}, AIC = {}, concordance = {}\n",
        summary.n,
        summary.events,
        fmt_opt(summary.log_likelihood, 3),
        fmt_opt(summary.aic, 2),
        fmt_opt(summary.concordance, 3)
    )?;
    match model {
        FittedModel::Cox(m) => {
            writeln!(
                out,
                "Converged in {} iteration(s); likelihood ratio against the null model: {:.3} on {} df.\n",
                m.iterations,
                2.0 * (m.log_likelihood - m.null_log_likelihood),
                m.beta.len()
            )?;
        }
        FittedModel::Aalen(m) => {
            writeln!(
                out,
                "Cumulative regression functions at t = {}.",
                fmt_opt(m.last_time(), 0)
            )?;
            if m.unused_events > 0 {
                writeln!(
                    out,
                    "{} late event(s) fall past the last time the design is estimable.",
                    m.unused_events
                )?;
            }
            writeln!(out)?;
            aalen_table(out, m)?;
            writeln!(out)?;
        }
        FittedModel::Aft(m) => {
            writeln!(
                out,
                "Scale = {:.4}{}, converged in {} iteration(s).\n",
                m.scale(),
                if m.fixed_scale() { " (fixed)" } else { "" },
                m.iterations
            )?;
        }
        FittedModel::Forest(m) => {
            writeln!(
                out,
                "{} trees, mtry = {}, {:.1} leaves per tree, out-of-bag error = {:.4}.\n",
                m.trees.len(),
                m.mtry,
                m.mean_leaves(),
                m.oob_error
            )?;
            forest_table(out, m)?;
            return writeln!(out);
        }
    }
    coefficient_table(out, spec.family, &summary.coefficients)?;
    writeln!(out)
}

fn write_comparison<W: Write>(out: &mut W, c: &Comparison) -> fmt::Result {
    writeln!(out, "## Model comparison\n")?;
    writeln!(
        out,
        "AIC is compared only between models with the same likelihood fitted on the same rows.\n"
    )?;
    for group in &c.aic_groups {
        writeln!(out, "### AIC, {}, n = {}\n", group.likelihood, group.n)?;
        writeln!(out, "| rank | model | AIC |\n|---:|---|---:|")?;
        for (k, (name, aic)) in group.ranking.iter().enumerate() {
            writeln!(out, "| {} | {name} | {aic:.2} |", k + 1)?;
        }
        writeln!(out)?;
    }
    if !c.unranked.is_empty() {
        writeln!(out, "Without an AIC: {}.\n", c.unranked.join(", "))?;
    }
    if let Some(best) = &c.best_parametric {
        writeln!(out, "Best parametric model by AIC: **{best}**.\n")?;
    }
    for (name, n) in &c.skipped {
        writeln!(out, "- {name} was fitted on {n} rows and left out of the AIC choice.")?;
    }
    if !c.skipped.is_empty() {
        writeln!(out)?;
    }
    for (label, set) in &c.flagged {
        writeln!(out, "- {label}: {}", set.join(", "))?;
    }
    let mut reduced = c.reduced.clone();
    reduced.extend(c.reduced_interactions.iter().map(|(a, b)| format!("{a}:{b}")));
    writeln!(out, "\nReduced covariate set: **{}**\n", reduced.join(", "))?;
    if !c.likelihood_ratio_tests.is_empty() {
        writeln!(
            out,
            "| reduced | full | LR statistic | df | p |\n|---|---|---:|---:|---:|"
        )?;
        for t in &c.likelihood_ratio_tests {
            writeln!(
                out,
                "| {} | {} | {:.3} | {} | {} |",
                t.reduced,
                t.full,
                t.statistic,
                t.df,
                fmt_p(t.p_value)
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn prediction_table<W: Write>(
    out: &mut W,
    probabilities: &[f64],
    predictions: &[ProfilePrediction],
) -> fmt::Result {
    write!(out, "| p |")?;
    for pred in predictions {
        write!(out, " {} (days, +/- 2 SE) |", pred.profile)?;
    }
    write!(out, "\n|---:|")?;
    for _ in predictions {
        write!(out, "---:|")?;
    }
    writeln!(out)?;
    for &p in probabilities {
        write!(out, "| {p:.2} |")?;
        for pred in predictions {
            match pred.at(p) {
                Some(q) => write!(out, " {:.0} ({:.0}, {:.0}) |", q.time, q.lower, q.upper)?,
                None => write!(out, " NA |")?,
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Time to first seizure: immediate vs deferred treatment\n")?;
        write!(f, "{}", self.description)?;

        writeln!(f, "## Models\n")?;
        for run in &self.runs {
            write_run(f, run)?;
        }
        let failed: Vec<&ModelRun> = self.runs.iter().filter(|r| r.result.is_err()).collect();
        if !failed.is_empty() {
            writeln!(f, "Failed fits:\n")?;
            for run in failed {
                if let Err(e) = &run.result {
                    writeln!(f, "- {}: {e}", run.spec.name)?;
                }
            }
            writeln!(f)?;
        }

        write_comparison(f, &self.comparison)?;

        writeln!(f, "## Final model\n")?;
        write_run(f, &self.final_run)?;

        if !self.predictions.is_empty() {
            writeln!(f, "## Predicted time to first seizure\n")?;
            prediction_table(f, &self.probabilities, &self.predictions)?;
            writeln!(f)?;
        }
        for (profile, e) in &self.prediction_errors {
            writeln!(f, "- no prediction for {profile}: {e}")?;
        }

        if !self.figures.is_empty() {
            writeln!(f, "\n## Figures\n")?;
            for (caption, file) in &self.figures {
                writeln!(f, "![{caption}]({file})\n")?;
            }
        }
        Ok(())
    }
}

/// The descriptive part of the report.
pub fn render_description(d: &Description) -> String {
    d.to_string()
}

/// The full report.
pub fn render(a: &Analysis) -> String {
    a.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{AicGroup, Likelihood};
    use crate::predict::QuantilePrediction;

    #[test]
    fn test_p_values_are_floored() {
        assert_eq!(fmt_p(1e-9), "<0.0001");
        assert_eq!(fmt_p(0.04321), "0.0432");
        assert_eq!(fmt_opt(None, 2), "NA");
        assert_eq!(fmt_opt(Some(f64::NAN), 2), "NA");
    }

    #[test]
    fn test_cox_table_shows_hazard_ratios() -> fmt::Result {
        let coefs = vec![Coefficient::new("treat", Some("treat"), 0.0, 0.5)];
        let mut table = String::new();
        coefficient_table(&mut table, Family::Cox, &coefs)?;
        assert!(table.contains("HR (95% CI)"));
        assert!(table.contains("1.000 (0.375, 2.664)"));
        let mut aalen = String::new();
        coefficient_table(&mut aalen, Family::Aalen, &coefs)?;
        assert!(!aalen.contains("CI"));
        Ok(())
    }

    #[test]
    fn test_prediction_table_has_a_row_per_probability() -> fmt::Result {
        let pred = ProfilePrediction {
            profile: "immediate".into(),
            quantiles: vec![QuantilePrediction {
                p: 0.5,
                time: 400.0,
                lower: 300.0,
                upper: 520.0,
            }],
        };
        let mut table = String::new();
        prediction_table(&mut table, &[0.25, 0.5], &[pred])?;
        assert!(table.contains("| 0.25 | NA |"));
        assert!(table.contains("| 0.50 | 400 (300, 520) |"));
        Ok(())
    }

    #[test]
    fn test_aic_groups_are_rendered_apart() -> fmt::Result {
        let comparison = Comparison {
            aic_groups: vec![
                AicGroup {
                    likelihood: Likelihood::Full,
                    n: 57,
                    ranking: vec![("weibull".into(), 1000.0), ("exponential".into(), 1020.5)],
                },
                AicGroup {
                    likelihood: Likelihood::Partial,
                    n: 57,
                    ranking: vec![("cox_full".into(), 700.0)],
                },
            ],
            unranked: vec!["aalen".into()],
            best_parametric: Some("weibull".into()),
            skipped: vec![("lognormal_eeg".into(), 50)],
            reduced: vec!["treat".into()],
            ..Comparison::default()
        };
        let mut out = String::new();
        write_comparison(&mut out, &comparison)?;
        assert!(out.contains("### AIC, full likelihood, n = 57"));
        assert!(out.contains("### AIC, Cox partial likelihood, n = 57"));
        assert!(out.contains("| 2 | exponential | 1020.50 |"));
        assert!(out.contains("| 1 | cox_full | 700.00 |"));
        assert!(out.contains("Without an AIC: aalen."));
        assert!(out.contains("- lognormal_eeg was fitted on 50 rows"));
        Ok(())
    }
}
