//! Type normalisation: binary recoding, factor relabelling, date parsing and
//! the EEG consistency correction.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use log::{info, warn};

use crate::config::{BinaryColumn, EegCorrection, Recoding};
use crate::data::{Factor, SurvivalData};
use crate::describe::CrossTab;
use crate::error::DataError;

/// What the normaliser changed, for the report.
#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    /// Raw `performed x abnormal` table, captured before any recoding.
    pub eeg_raw: Option<CrossTab>,
    pub eeg_corrected: usize,
    /// Values outside the {one, zero} codes of a binary column, or outside
    /// the fixed levels of a factor.
    pub unknown_codes: BTreeMap<String, usize>,
    /// Subjects whose non-empty date string did not parse, per column.
    pub unparsed_dates: BTreeMap<String, Vec<String>>,
    pub missing_dates: BTreeMap<String, usize>,
}

/// Map a {one, zero} coded value to 1/0. Anything else is missing.
pub fn recode_binary(value: f64, one: f64, zero: f64) -> f64 {
    if value == one {
        1.0
    } else if value == zero {
        0.0
    } else {
        f64::NAN
    }
}

/// Parse a date string; empty, `NA` and malformed strings give `None`.
pub fn parse_date(value: &str, format: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NA") {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, format).ok()
}

fn recode_binary_column(
    data: &mut SurvivalData,
    def: &BinaryColumn,
    report: &mut NormalizeReport,
) -> Result<(), DataError> {
    if data.binary_labels.contains_key(&def.column) {
        // already recoded
        return Ok(());
    }
    let (Ok(one), Ok(zero)) = (def.one.parse::<f64>(), def.zero.parse::<f64>()) else {
        warn!(
            "Binary codes '{}'/'{}' of '{}' are not numeric - column left as is",
            def.one, def.zero, def.column
        );
        return Ok(());
    };
    let raw = data.as_vec_f64(&def.column)?;
    let mut unknown = 0;
    let recoded: Vec<f64> = raw
        .iter()
        .map(|&v| {
            let r = recode_binary(v, one, zero);
            if r.is_nan() && !v.is_nan() {
                unknown += 1;
            }
            r
        })
        .collect();
    if unknown > 0 {
        warn!("{unknown} value(s) of '{}' are neither {one} nor {zero} - set to NA", def.column);
        report.unknown_codes.insert(def.column.clone(), unknown);
    }
    data.set_column(&def.column, &recoded);
    data.binary_labels.insert(def.column.clone(), def.labels.clone());
    Ok(())
}

/// Treat the abnormal EEG result as authoritative: every row with
/// `abnormal == 1` gets `performed = 1`. Returns the number of rows changed.
/// Applying it a second time changes nothing.
pub fn correct_eeg(data: &mut SurvivalData, rule: &EegCorrection) -> Result<usize, DataError> {
    let abnormal = data.as_vec_f64(&rule.abnormal)?;
    let mut performed = data.as_vec_f64(&rule.performed)?;
    let mut changed = 0;
    for (p, a) in performed.iter_mut().zip(abnormal.iter()) {
        if *a == 1.0 && *p != 1.0 {
            *p = 1.0;
            changed += 1;
        }
    }
    data.set_column(&rule.performed, &performed);
    Ok(changed)
}

/// Normalise the raw table in place according to the recoding table.
pub fn normalize(data: &mut SurvivalData, recoding: &Recoding) -> Result<NormalizeReport, DataError> {
    let mut report = NormalizeReport::default();

    if let Some(rule) = &recoding.eeg_correction {
        if data.has_column(&rule.performed) && data.has_column(&rule.abnormal) {
            report.eeg_raw = Some(CrossTab::new(data, &rule.performed, &rule.abnormal)?);
        }
    }

    for def in &recoding.binary {
        if !data.has_column(&def.column) {
            warn!("Binary column '{}' not in the data - skipped", def.column);
            continue;
        }
        recode_binary_column(data, def, &mut report)?;
    }

    for def in &recoding.factors {
        let Some(raw) = data.text.remove(&def.column) else {
            if !data.is_factor(&def.column) {
                warn!("Factor column '{}' not in the data - skipped", def.column);
            }
            continue;
        };
        let factor = Factor::from_def(def, raw.iter().map(String::as_str));
        let mut unknown = 0;
        let values: Vec<f64> = raw
            .iter()
            .map(|code| {
                let v = factor.get_f64(code);
                let code = code.trim();
                if v.is_nan() && !(code.is_empty() || code.eq_ignore_ascii_case("NA")) {
                    unknown += 1;
                }
                v
            })
            .collect();
        if unknown > 0 {
            warn!("{unknown} code(s) of factor '{}' are not a known level - set to NA", def.column);
            report.unknown_codes.insert(def.column.clone(), unknown);
        }
        info!("Factor '{}' has {} levels", def.column, factor.n_levels());
        data.set_factor_column(factor, &values);
    }

    for col in &recoding.dates {
        let Some(raw) = data.text.remove(col) else {
            continue;
        };
        let mut unparsed: Vec<String> = Vec::new();
        let mut missing = 0;
        let parsed: Vec<Option<NaiveDate>> = raw
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let d = parse_date(s, &recoding.date_format);
                if d.is_none() {
                    missing += 1;
                    let t = s.trim();
                    if !(t.is_empty() || t.eq_ignore_ascii_case("NA")) {
                        unparsed.push(data.ids[i].clone());
                    }
                }
                d
            })
            .collect();
        if !unparsed.is_empty() {
            warn!(
                "{} value(s) of date column '{col}' did not parse as '{}' - set to NA",
                unparsed.len(),
                recoding.date_format
            );
            report.unparsed_dates.insert(col.clone(), unparsed);
        }
        report.missing_dates.insert(col.clone(), missing);
        data.dates.insert(col.clone(), parsed);
    }

    if let Some(rule) = &recoding.eeg_correction {
        if data.has_column(&rule.performed) && data.has_column(&rule.abnormal) {
            report.eeg_corrected = correct_eeg(data, rule)?;
            if report.eeg_corrected > 0 {
                info!(
                    "{} row(s) had an abnormal EEG without an EEG - '{}' set to yes",
                    report.eeg_corrected, rule.performed
                );
            }
        }
    }

    Ok(report)
}
