//! Consistency checks run after normalisation and before any model is fitted.

use log::{info, warn};

use crate::config::{CheckConfig, ColumnSchema};
use crate::data::normalize::NormalizeReport;
use crate::data::SurvivalData;
use crate::error::DataError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// Subjects where both the first-seizure date and the period are missing.
    pub jointly_missing: Vec<String>,
    /// Subjects with a first-seizure date that was recorded but did not parse.
    pub unparsed_dates: Vec<String>,
    /// Subjects whose outcome pair is inconsistent (status outside {0,1},
    /// negative time, or an event shorter than the minimum duration).
    pub outcome_issues: Vec<(String, String)>,
}

/// The first-seizure date and the elapsed period must be missing together.
/// Jointly missing rows are returned; a row with only one of the two missing
/// is an error. Subjects in `unparsed` had a date that failed to parse; their
/// date is NA but not absent, so they never count as a mismatch.
pub fn check_joint_missingness(
    data: &SurvivalData,
    date_col: &str,
    period_col: &str,
    unparsed: &[String],
) -> Result<Vec<String>, DataError> {
    let dates = data.date_column(date_col)?;
    let period = data.column(period_col)?;
    let mut both = Vec::new();
    let mut mismatched = Vec::new();
    for (i, (d, p)) in dates.iter().zip(period.iter()).enumerate() {
        let id = &data.ids[i];
        if unparsed.contains(id) {
            continue;
        }
        match (d.is_none(), p.is_nan()) {
            (true, true) => both.push(id.clone()),
            (false, false) => {}
            _ => mismatched.push(id.clone()),
        }
    }
    if !mismatched.is_empty() {
        return Err(DataError::InconsistentMissingness {
            date_col: date_col.to_string(),
            period_col: period_col.to_string(),
            rows: mismatched,
        });
    }
    Ok(both)
}

/// Rows whose (time, status) pair breaks the outcome invariants.
pub fn check_outcome(
    data: &SurvivalData,
    time_col: &str,
    status_col: &str,
    min_event_time: f64,
) -> Result<Vec<(String, String)>, DataError> {
    let time = data.column(time_col)?;
    let status = data.column(status_col)?;
    let mut issues = Vec::new();
    for (i, (&t, &s)) in time.iter().zip(status.iter()).enumerate() {
        let problem = if !s.is_nan() && s != 0.0 && s != 1.0 {
            Some(format!("status {s} is not 0/1"))
        } else if t < 0.0 {
            Some(format!("negative time {t}"))
        } else if s == 1.0 && t < min_event_time {
            Some(format!("event at {t} before the minimum duration {min_event_time}"))
        } else {
            None
        };
        if let Some(p) = problem {
            issues.push((data.ids[i].clone(), p));
        }
    }
    Ok(issues)
}

pub fn validate(
    data: &SurvivalData,
    columns: &ColumnSchema,
    checks: &CheckConfig,
    normalized: &NormalizeReport,
) -> Result<ValidationReport, DataError> {
    let unparsed_dates = normalized
        .unparsed_dates
        .get(&checks.first_seizure_date)
        .cloned()
        .unwrap_or_default();
    if !unparsed_dates.is_empty() {
        warn!(
            "{} subject(s) have an unreadable '{}' and are not checked against '{}': {}",
            unparsed_dates.len(),
            checks.first_seizure_date,
            checks.period,
            unparsed_dates.join(", ")
        );
    }
    let jointly_missing = check_joint_missingness(
        data,
        &checks.first_seizure_date,
        &checks.period,
        &unparsed_dates,
    )?;
    if !jointly_missing.is_empty() {
        info!(
            "{} subject(s) lack both '{}' and '{}' - treated as missing at random",
            jointly_missing.len(),
            checks.first_seizure_date,
            checks.period
        );
    }
    let outcome_issues = check_outcome(data, &columns.time, &columns.status, checks.min_event_time)?;
    for (id, problem) in &outcome_issues {
        warn!("subject {id}: {problem}");
    }
    Ok(ValidationReport {
        jointly_missing,
        unparsed_dates,
        outcome_issues,
    })
}
