//! Quantile survival times for covariate profiles from a fitted AFT model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PredictError;
use crate::models::design::TermKind;
use crate::models::AftModel;

/// A covariate value in a profile: a number, or a level label for factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileValue {
    Number(f64),
    Level(String),
}

/// A named synthetic subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub values: BTreeMap<String, ProfileValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantilePrediction {
    /// Failure probability.
    pub p: f64,
    pub time: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfilePrediction {
    pub profile: String,
    pub quantiles: Vec<QuantilePrediction>,
}

impl ProfilePrediction {
    /// Predicted time at probability `p`, if it was requested.
    pub fn at(&self, p: f64) -> Option<&QuantilePrediction> {
        self.quantiles.iter().find(|q| (q.p - p).abs() < 1e-9)
    }
}

/// Raw term values of a profile, in the model's term order.
fn raw_values(model: &AftModel, profile: &Profile) -> Result<Vec<f64>, PredictError> {
    model
        .layout
        .terms
        .iter()
        .map(|term| {
            let value = profile
                .values
                .get(&term.covariate)
                .ok_or_else(|| PredictError::MissingValue {
                    profile: profile.name.clone(),
                    covariate: term.covariate.clone(),
                })?;
            match (&term.kind, value) {
                (TermKind::Numeric, ProfileValue::Number(v)) => Ok(*v),
                (TermKind::Factor { labels }, ProfileValue::Level(level)) => labels
                    .iter()
                    .position(|l| l == level)
                    .map(|k| k as f64)
                    .ok_or_else(|| PredictError::UnknownLevel {
                        profile: profile.name.clone(),
                        covariate: term.covariate.clone(),
                        level: level.clone(),
                    }),
                (TermKind::Numeric, ProfileValue::Level(_)) => Err(PredictError::WrongKind {
                    profile: profile.name.clone(),
                    covariate: term.covariate.clone(),
                    expected: "number",
                }),
                (TermKind::Factor { .. }, ProfileValue::Number(_)) => Err(PredictError::WrongKind {
                    profile: profile.name.clone(),
                    covariate: term.covariate.clone(),
                    expected: "level label",
                }),
            }
        })
        .collect()
}

/// For each failure probability `p`: `exp(eta)` with the band
/// `exp(eta -/+ 2 se)`, where `eta = b0 + x b + sigma w_p`.
///
/// Profile values for covariates the model does not use are ignored.
pub fn predict_quantiles(
    model: &AftModel,
    profile: &Profile,
    probabilities: &[f64],
) -> Result<ProfilePrediction, PredictError> {
    if let Some(&p) = probabilities.iter().find(|&&p| !(p > 0.0 && p < 1.0)) {
        return Err(PredictError::Probability(p));
    }
    let raw = raw_values(model, profile)?;
    let x = model.layout.expand_row(&raw);
    let quantiles = probabilities
        .iter()
        .map(|&p| {
            let (eta, se) = model.log_quantile(&x, p);
            QuantilePrediction {
                p,
                time: eta.exp(),
                lower: (eta - 2.0 * se).exp(),
                upper: (eta + 2.0 * se).exp(),
            }
        })
        .collect();
    Ok(ProfilePrediction {
        profile: profile.name.clone(),
        quantiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::aft::{Distribution, INTERCEPT, LOG_SCALE};
    use crate::models::design::{DesignLayout, Term};
    use crate::models::Family;
    use ndarray::{array, Array2};

    /// Weibull with log T = 5 + 0.5 treat + 0.2 centre=b + sigma W.
    fn model() -> AftModel {
        AftModel {
            family: Family::Weibull,
            distribution: Distribution::ExtremeValue,
            layout: DesignLayout {
                terms: vec![
                    Term {
                        covariate: "treat".into(),
                        kind: TermKind::Numeric,
                    },
                    Term {
                        covariate: "centre".into(),
                        kind: TermKind::Factor {
                            labels: vec!["a".into(), "b".into()],
                        },
                    },
                ],
                interactions: vec![],
            },
            names: vec![INTERCEPT.into(), "treat".into(), "centre=b".into(), LOG_SCALE.into()],
            sources: vec![INTERCEPT.into(), "treat".into(), "centre".into(), LOG_SCALE.into()],
            theta: array![5.0, 0.5, 0.2, 0.0],
            covariance: Array2::eye(4) * 0.01,
            log_likelihood: -100.0,
            iterations: 5,
            n: 50,
            events: 30,
            concordance: 0.6,
        }
    }

    fn profile(treat: f64, centre: &str) -> Profile {
        Profile {
            name: format!("treat={treat}"),
            values: [
                ("treat".to_string(), ProfileValue::Number(treat)),
                ("centre".to_string(), ProfileValue::Level(centre.to_string())),
                ("unused".to_string(), ProfileValue::Number(3.0)),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_median_matches_closed_form() -> Result<(), PredictError> {
        let pred = predict_quantiles(&model(), &profile(1.0, "b"), &[0.5])?;
        let w = (2.0_f64.ln()).ln();
        let expected = (5.0 + 0.5 + 0.2 + w).exp();
        let q = pred.at(0.5).expect("requested");
        assert!((q.time - expected).abs() < 1e-9 * expected);
        assert!(q.lower < q.time && q.time < q.upper);
        Ok(())
    }

    #[test]
    fn test_quantiles_are_monotone_and_bands_contain_estimate() -> Result<(), PredictError> {
        let probs: Vec<f64> = (1..20).map(|i| f64::from(i) * 0.05).collect();
        let pred = predict_quantiles(&model(), &profile(0.0, "a"), &probs)?;
        for w in pred.quantiles.windows(2) {
            assert!(w[1].time > w[0].time);
        }
        for q in &pred.quantiles {
            assert!(q.lower <= q.time && q.time <= q.upper);
        }
        Ok(())
    }

    #[test]
    fn test_profile_errors() {
        let m = model();
        let mut missing = profile(1.0, "a");
        missing.values.remove("treat");
        assert!(matches!(
            predict_quantiles(&m, &missing, &[0.5]),
            Err(PredictError::MissingValue { .. })
        ));
        assert!(matches!(
            predict_quantiles(&m, &profile(1.0, "z"), &[0.5]),
            Err(PredictError::UnknownLevel { .. })
        ));
        assert_eq!(
            predict_quantiles(&m, &profile(1.0, "a"), &[1.0]),
            Err(PredictError::Probability(1.0))
        );
    }

    #[test]
    fn test_profile_json_accepts_numbers_and_labels() -> Result<(), serde_json::Error> {
        let p: Profile = serde_json::from_str(
            r#"{ "name": "x", "values": { "treat": 1, "centre": "b" } }"#,
        )?;
        assert_eq!(p.values["treat"], ProfileValue::Number(1.0));
        assert_eq!(p.values["centre"], ProfileValue::Level("b".into()));
        Ok(())
    }
}
