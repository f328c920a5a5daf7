//! Derived covariates: age bands, log elapsed period, previous-seizure flag.

use log::{info, warn};

use crate::config::FeatureConfig;
use crate::data::{Factor, SurvivalData};
use crate::error::DataError;

/// Fixed, ordered age bands. The first band is closed on both sides,
/// every later one is right-closed: `[b0,b1]`, `(b1,b2]`, ..., `(bk,max]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgeBands {
    breaks: Vec<f64>,
}

impl AgeBands {
    /// `lower` are the configured breakpoints; `max` closes the last band.
    /// Breakpoints at or above `max` are dropped so no band is empty by construction.
    pub fn new(lower: &[f64], max: f64) -> Self {
        let mut breaks: Vec<f64> = lower.iter().copied().filter(|b| *b < max).collect();
        breaks.push(max);
        AgeBands { breaks }
    }

    pub fn breaks(&self) -> &[f64] {
        &self.breaks
    }

    pub fn n_bands(&self) -> usize {
        self.breaks.len().saturating_sub(1)
    }

    /// Index of the band holding `age`, `None` for missing or out-of-range ages.
    pub fn band(&self, age: f64) -> Option<usize> {
        if age.is_nan() || self.breaks.len() < 2 {
            return None;
        }
        let first = self.breaks[0];
        let last = self.breaks[self.breaks.len() - 1];
        if age < first || age > last {
            return None;
        }
        if age <= self.breaks[1] {
            return Some(0);
        }
        (1..self.n_bands()).find(|&k| age > self.breaks[k] && age <= self.breaks[k + 1])
    }

    pub fn labels(&self) -> Vec<String> {
        (0..self.n_bands())
            .map(|k| {
                let open = if k == 0 { '[' } else { '(' };
                format!("{open}{},{}]", self.breaks[k], self.breaks[k + 1])
            })
            .collect()
    }

    pub fn as_factor(&self, column: &str) -> Factor {
        let labels = self.labels();
        Factor::with_levels(column, &labels, None)
    }
}

/// `ln(period + 1)`; zero maps to zero, negative or missing periods are missing.
pub fn log_period(period: f64) -> f64 {
    if period.is_nan() || period < 0.0 {
        f64::NAN
    } else {
        period.ln_1p()
    }
}

/// 1 when `count > threshold`, 0 otherwise, `NaN` when missing.
pub fn threshold_flag(count: f64, threshold: f64) -> f64 {
    if count.is_nan() {
        f64::NAN
    } else if count > threshold {
        1.0
    } else {
        0.0
    }
}

/// Add the derived columns to the table.
pub fn derive_features(
    data: &mut SurvivalData,
    age_column: &str,
    cfg: &FeatureConfig,
) -> Result<AgeBands, DataError> {
    let age = data.as_vec_f64(age_column)?;
    let max_age = age
        .iter()
        .copied()
        .filter(|a| !a.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    let bands = AgeBands::new(&cfg.age_breaks, max_age);
    let band_values: Vec<f64> = age
        .iter()
        .map(|&a| bands.band(a).map_or(f64::NAN, |k| k as f64))
        .collect();
    let outside = age
        .iter()
        .zip(band_values.iter())
        .filter(|(a, b)| !a.is_nan() && b.is_nan())
        .count();
    if outside > 0 {
        warn!("{outside} age value(s) fall outside the age bands - set to NA");
    }
    data.set_factor_column(bands.as_factor(&cfg.age_band_column), &band_values);

    let period: Vec<f64> = data
        .as_vec_f64(&cfg.period_column)?
        .into_iter()
        .map(log_period)
        .collect();
    data.set_column(&cfg.log_period_column, &period);

    let flags: Vec<f64> = data
        .as_vec_f64(&cfg.previous_column)?
        .into_iter()
        .map(|c| threshold_flag(c, cfg.previous_threshold))
        .collect();
    data.set_column(&cfg.previous_flag_column, &flags);
    data.binary_labels.insert(
        cfg.previous_flag_column.clone(),
        [
            format!("<={}", cfg.previous_threshold),
            format!(">{}", cfg.previous_threshold),
        ],
    );

    info!(
        "Derived '{}' ({} bands), '{}' and '{}'",
        cfg.age_band_column,
        bands.n_bands(),
        cfg.log_period_column,
        cfg.previous_flag_column
    );
    Ok(bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn default_bands(max: f64) -> AgeBands {
        AgeBands::new(&[0.0, 5.0, 9.0, 19.0, 29.0, 39.0, 49.0, 59.0, 69.0], max)
    }

    #[test]
    fn test_age_bands_are_exhaustive_and_disjoint() {
        let bands = default_bands(88.0);
        assert_eq!(bands.breaks(), &[0.0, 5.0, 9.0, 19.0, 29.0, 39.0, 49.0, 59.0, 69.0, 88.0]);
        let mut age = 0.0;
        while age <= 88.0 {
            let hits = (0..bands.n_bands())
                .filter(|&k| {
                    let lo = bands.breaks()[k];
                    let hi = bands.breaks()[k + 1];
                    if k == 0 { age >= lo && age <= hi } else { age > lo && age <= hi }
                })
                .count();
            assert_eq!(hits, 1, "age {age} hits {hits} bands");
            assert!(bands.band(age).is_some());
            age += 0.25;
        }
    }

    #[test]
    fn test_age_band_boundaries() {
        let bands = default_bands(75.0);
        assert_eq!(bands.band(0.0), Some(0), "lowest interval includes the minimum");
        assert_eq!(bands.band(5.0), Some(0));
        assert_eq!(bands.band(5.5), Some(1));
        assert_eq!(bands.band(69.0), Some(7));
        assert_eq!(bands.band(75.0), Some(8));
        assert_eq!(bands.band(75.1), None);
        assert_eq!(bands.band(-1.0), None);
        assert_eq!(bands.band(f64::NAN), None);
        assert_eq!(bands.labels()[0], "[0,5]");
        assert_eq!(bands.labels()[8], "(69,75]");
    }

    #[test]
    fn test_log_period_is_monotone_and_zero_at_zero() {
        assert_eq!(log_period(0.0), 0.0, "period 0 maps to 0");
        assert!(log_period(-1.0).is_nan());
        let mut prev = log_period(0.0);
        for p in 1..1000 {
            let v = log_period(f64::from(p) * 0.5);
            assert!(v > prev);
            prev = v;
        }
        assert!((log_period(std::f64::consts::E - 1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_flag() {
        assert_eq!(threshold_flag(1.0, 1.0), 0.0, "exactly one previous seizure is false");
        assert_eq!(threshold_flag(5.0, 1.0), 1.0);
        assert_eq!(threshold_flag(0.0, 1.0), 0.0);
        assert!(threshold_flag(f64::NAN, 1.0).is_nan());
    }

    #[test]
    fn test_derive_features_on_table() -> Result<(), DataError> {
        // age, period, previous
        let numeric = vec![
            30.0, 0.0, 1.0, //
            4.0, 10.0, 5.0, //
            70.0, f64::NAN, 2.0,
        ];
        let mut data = SurvivalData {
            ids: vec!["a".into(), "b".into(), "c".into()],
            headers: vec!["age".into(), "period".into(), "previous".into()],
            numeric_data: Array2::from_shape_vec((3, 3), numeric).unwrap(),
            ..SurvivalData::default()
        };
        let cfg = FeatureConfig::default();
        let bands = derive_features(&mut data, "age", &cfg)?;
        assert_eq!(bands.n_bands(), 9);
        assert_eq!(data.display_value("age_band", data.as_vec_f64("age_band")?[0]), "(29,39]");
        assert_eq!(data.display_value("age_band", data.as_vec_f64("age_band")?[1]), "[0,5]");
        let lp = data.as_vec_f64("log_period")?;
        assert_eq!(lp[0], 0.0);
        assert!(lp[2].is_nan());
        assert_eq!(data.as_vec_f64("previous_gt1")?, vec![0.0, 1.0, 1.0]);
        Ok(())
    }
}
