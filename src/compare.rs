//! Ranking fitted models and narrowing the covariate set.

use std::fmt;

use log::warn;
use serde::Serialize;

use crate::models::metrics::chi_square_p;
use crate::models::{Family, ModelSummary};

/// Summaries sorted by ascending AIC; models without an AIC go last, in
/// their input order.
pub fn rank_by_aic<'a, I>(summaries: I) -> Vec<&'a ModelSummary>
where
    I: IntoIterator<Item = &'a ModelSummary>,
{
    let mut ranked: Vec<&ModelSummary> = summaries.into_iter().collect();
    // stable sort keeps input order among equal keys
    ranked.sort_by(|a, b| match (a.aic, b.aic) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    ranked
}

/// Lowest AIC; ties go to the earlier model.
pub fn select_best<'a, I>(summaries: I) -> Option<&'a ModelSummary>
where
    I: IntoIterator<Item = &'a ModelSummary>,
{
    rank_by_aic(summaries).into_iter().find(|s| s.aic.is_some())
}

/// The likelihood an AIC was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Likelihood {
    /// Full likelihood of a parametric AFT model.
    Full,
    /// Cox partial likelihood.
    Partial,
}

impl Likelihood {
    pub fn of(family: Family) -> Option<Likelihood> {
        match family {
            Family::Cox => Some(Likelihood::Partial),
            f if f.is_parametric() => Some(Likelihood::Full),
            _ => None,
        }
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Likelihood::Full => write!(f, "full likelihood"),
            Likelihood::Partial => write!(f, "Cox partial likelihood"),
        }
    }
}

/// Models whose AICs can be compared with each other: same likelihood,
/// fitted on the same number of rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AicGroup {
    pub likelihood: Likelihood,
    pub n: usize,
    /// `(model, AIC)` by ascending AIC.
    pub ranking: Vec<(String, f64)>,
}

/// Rank within comparable groups. Full likelihood comes first, then larger
/// samples; models without an AIC are left out.
pub fn aic_groups(summaries: &[ModelSummary]) -> Vec<AicGroup> {
    let mut groups: Vec<AicGroup> = Vec::new();
    for s in rank_by_aic(summaries) {
        let (Some(likelihood), Some(aic)) = (Likelihood::of(s.family), s.aic) else {
            continue;
        };
        match groups
            .iter_mut()
            .find(|g| g.likelihood == likelihood && g.n == s.n)
        {
            Some(g) => g.ranking.push((s.name.clone(), aic)),
            None => groups.push(AicGroup {
                likelihood,
                n: s.n,
                ranking: vec![(s.name.clone(), aic)],
            }),
        }
    }
    groups.sort_by(|a, b| a.likelihood.cmp(&b.likelihood).then(b.n.cmp(&a.n)));
    groups
}

/// Row count shared by most fits; ties go to the larger count.
pub fn reference_n<I: IntoIterator<Item = usize>>(counts: I) -> Option<usize> {
    let mut tally: Vec<(usize, usize)> = Vec::new();
    for n in counts {
        match tally.iter_mut().find(|(m, _)| *m == n) {
            Some((_, k)) => *k += 1,
            None => tally.push((n, 1)),
        }
    }
    tally
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(n, _)| n)
}

/// Lowest full-likelihood AIC among the parametric fits on the reference
/// row count; ties go to the earlier model. Fits on any other count are
/// returned as skipped.
pub fn select_best_parametric(summaries: &[ModelSummary]) -> (Option<&ModelSummary>, Vec<&ModelSummary>) {
    let candidates: Vec<&ModelSummary> = summaries
        .iter()
        .filter(|s| s.family.is_parametric() && s.aic.is_some())
        .collect();
    let Some(n) = reference_n(candidates.iter().map(|s| s.n)) else {
        return (None, Vec::new());
    };
    let (comparable, skipped): (Vec<&ModelSummary>, Vec<&ModelSummary>) =
        candidates.into_iter().partition(|s| s.n == n);
    for s in &skipped {
        warn!(
            "'{}' was fitted on {} rows, not {} - left out of the AIC choice",
            s.name, s.n, n
        );
    }
    (select_best(comparable), skipped)
}

/// Split flagged terms into main effects and `a:b` interactions. The main
/// effects of an interaction are added when they were not flagged themselves.
pub fn split_interactions(terms: &[String]) -> (Vec<String>, Vec<(String, String)>) {
    let mut mains: Vec<String> = Vec::new();
    let mut pairs: Vec<(String, String)> = Vec::new();
    for term in terms {
        match term.split_once(':') {
            Some((a, b)) => {
                let pair = (a.to_string(), b.to_string());
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
            None if !mains.contains(term) => mains.push(term.clone()),
            None => {}
        }
    }
    for (a, b) in &pairs {
        for name in [a, b] {
            if !mains.contains(name) {
                mains.push(name.clone());
            }
        }
    }
    (mains, pairs)
}

/// Intersection of the flagged sets, in the order of the first set.
pub fn reduce_covariates(sets: &[Vec<String>]) -> Vec<String> {
    let Some((first, rest)) = sets.split_first() else {
        return Vec::new();
    };
    first
        .iter()
        .filter(|c| rest.iter().all(|s| s.contains(c)))
        .cloned()
        .collect()
}

/// Likelihood ratio test of a nested pair of models.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LikelihoodRatioTest {
    pub reduced: String,
    pub full: String,
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

/// `None` when either model has no likelihood or the full model does not
/// have more parameters.
pub fn likelihood_ratio_test(reduced: &ModelSummary, full: &ModelSummary) -> Option<LikelihoodRatioTest> {
    let (l0, l1) = (reduced.log_likelihood?, full.log_likelihood?);
    let df = full.n_parameters().checked_sub(reduced.n_parameters())?;
    if df == 0 {
        return None;
    }
    let statistic = (2.0 * (l1 - l0)).max(0.0);
    Some(LikelihoodRatioTest {
        reduced: reduced.name.clone(),
        full: full.name.clone(),
        statistic,
        df,
        p_value: chi_square_p(statistic, df as f64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coefficient;

    fn summary(name: &str, aic: Option<f64>) -> ModelSummary {
        ModelSummary {
            name: name.to_string(),
            family: Family::Weibull,
            covariates: vec![],
            n: 100,
            events: 50,
            coefficients: vec![],
            log_likelihood: aic.map(|a| -a / 2.0),
            aic,
            concordance: None,
            importance: None,
            oob_error: None,
        }
    }

    #[test]
    fn test_rank_by_aic_puts_missing_last() {
        let models = vec![
            summary("exponential", Some(1020.0)),
            summary("aalen", None),
            summary("weibull", Some(1000.0)),
            summary("lognormal", Some(1010.0)),
        ];
        let names: Vec<&str> = rank_by_aic(&models).into_iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["weibull", "lognormal", "exponential", "aalen"]);
        assert_eq!(select_best(&models).map(|s| s.name.as_str()), Some("weibull"));
    }

    #[test]
    fn test_ties_go_to_the_first_model() {
        let models = vec![summary("a", Some(5.0)), summary("b", Some(5.0))];
        assert_eq!(select_best(&models).map(|s| s.name.as_str()), Some("a"));
        assert_eq!(select_best_parametric(&models).0.map(|s| s.name.as_str()), Some("a"));
        assert!(select_best(&[summary("x", None)]).is_none());
        assert!(select_best_parametric(&[summary("x", None)]).0.is_none());
    }

    #[test]
    fn test_smaller_sample_does_not_win_on_aic() {
        let mut full = summary("weibull_full", Some(3100.0));
        full.n = 480;
        let mut short = summary("lognormal_eeg", Some(2000.0));
        short.family = Family::LogNormal;
        short.n = 300;
        let models = vec![full, short];

        let (best, skipped) = select_best_parametric(&models);
        assert_eq!(best.map(|s| s.name.as_str()), Some("weibull_full"));
        let skipped: Vec<&str> = skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["lognormal_eeg"]);
    }

    #[test]
    fn test_reference_n_is_the_most_common_count() {
        let mut models = vec![summary("a", Some(1.0)), summary("b", Some(2.0)), summary("c", Some(0.5))];
        models[2].n = 80;
        assert_eq!(reference_n(models.iter().map(|s| s.n)), Some(100));
        let (best, skipped) = select_best_parametric(&models);
        assert_eq!(best.map(|s| s.name.as_str()), Some("a"));
        assert_eq!(skipped.len(), 1);
        assert_eq!(reference_n(Vec::<usize>::new()), None);
        assert_eq!(reference_n([90, 100]), Some(100), "ties go to the larger count");
    }

    #[test]
    fn test_cox_and_parametric_aic_are_ranked_apart() {
        let mut cox = summary("cox_full", Some(900.0));
        cox.family = Family::Cox;
        let mut aalen = summary("aalen", None);
        aalen.family = Family::Aalen;
        let mut small = summary("weibull_small", Some(800.0));
        small.n = 90;
        let models = vec![
            cox,
            summary("weibull", Some(1000.0)),
            aalen,
            small,
            summary("exponential", Some(1020.0)),
        ];
        let groups = aic_groups(&models);
        assert_eq!(groups.len(), 3);
        assert_eq!((groups[0].likelihood, groups[0].n), (Likelihood::Full, 100));
        let names: Vec<&str> = groups[0].ranking.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["weibull", "exponential"]);
        assert_eq!((groups[1].likelihood, groups[1].n), (Likelihood::Full, 90));
        assert_eq!(groups[2].likelihood, Likelihood::Partial);
        assert_eq!(groups[2].ranking, vec![("cox_full".to_string(), 900.0)]);
    }

    #[test]
    fn test_interactions_are_split_from_main_effects() {
        let terms = vec!["treat".to_string(), "age:sex".to_string(), "age".to_string()];
        let (mains, pairs) = split_interactions(&terms);
        assert_eq!(mains, vec!["treat", "age", "sex"]);
        assert_eq!(pairs, vec![("age".to_string(), "sex".to_string())]);
    }

    #[test]
    fn test_significant_and_important_sets() {
        let mut cox = summary("cox_full", Some(10.0));
        cox.coefficients = vec![
            Coefficient::new("treat", Some("treat"), 0.5, 0.1),
            Coefficient::new("age", Some("age"), 0.01, 0.1),
            Coefficient::new("centre=b", Some("centre"), 1.0, 0.2),
            Coefficient::new("centre=c", Some("centre"), 0.1, 0.2),
            Coefficient::new("(Intercept)", None, 5.0, 0.1),
        ];
        assert_eq!(significant_covariates(&cox, 0.05), vec!["treat", "centre"]);

        let mut forest = summary("forest", None);
        forest.importance = Some(vec![
            ("treat".into(), 0.01),
            ("age".into(), 0.001),
            ("centre".into(), 0.003),
        ]);
        assert_eq!(important_covariates(&forest, 0.002), vec!["treat", "centre"]);
    }

    #[test]
    fn test_reduce_preserves_first_order() {
        let sets = vec![
            vec!["c".to_string(), "a".to_string(), "b".to_string()],
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ];
        assert_eq!(reduce_covariates(&sets), vec!["c", "b"]);
        assert!(reduce_covariates(&[]).is_empty());
    }

    #[test]
    fn test_likelihood_ratio_test() {
        let mut small = summary("small", Some(0.0));
        small.log_likelihood = Some(-100.0);
        small.coefficients = vec![Coefficient::new("a", Some("a"), 1.0, 1.0)];
        let mut big = small.clone();
        big.name = "big".into();
        big.log_likelihood = Some(-98.079);
        big.coefficients.push(Coefficient::new("b", Some("b"), 1.0, 1.0));
        let lrt = likelihood_ratio_test(&small, &big).expect("nested");
        assert_eq!(lrt.df, 1);
        assert!((lrt.p_value - 0.05).abs() < 1e-3);
        assert!(likelihood_ratio_test(&big, &small).is_none());
    }
}
