use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

/// Two-sided p-value of a standard normal z statistic.
pub fn two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    match Normal::new(0.0, 1.0) {
        Ok(n) => 2.0 * (1.0 - n.cdf(z.abs())),
        Err(_) => f64::NAN,
    }
}

/// Upper tail of a chi-square distribution.
pub fn chi_square_p(stat: f64, df: f64) -> f64 {
    if !stat.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    match ChiSquared::new(df) {
        Ok(c) => 1.0 - c.cdf(stat.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Harrell's concordance index.
///
/// A pair is usable when the shorter time is an observed event. `risk` is
/// higher for subjects expected to fail earlier; ties in risk count one half.
pub fn harrell_c(time: &[f64], status: &[u8], risk: &[f64]) -> f64 {
    let mut concordant = 0.0;
    let mut usable = 0.0;
    let n = time.len();
    for i in 0..n {
        if status[i] != 1 || risk[i].is_nan() {
            continue;
        }
        for j in 0..n {
            if i == j || risk[j].is_nan() || time[j] <= time[i] {
                continue;
            }
            usable += 1.0;
            if risk[i] > risk[j] {
                concordant += 1.0;
            } else if risk[i] == risk[j] {
                concordant += 0.5;
            }
        }
    }
    if usable == 0.0 {
        f64::NAN
    } else {
        concordant / usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p_values() {
        assert!((two_sided_p(1.959964) - 0.05).abs() < 1e-5);
        assert!((two_sided_p(0.0) - 1.0).abs() < 1e-12);
        assert!((chi_square_p(3.841459, 1.0) - 0.05).abs() < 1e-5);
        assert!(two_sided_p(f64::NAN).is_nan());
    }

    #[test]
    fn test_harrell_c_perfect_and_reversed() {
        let time = [1.0, 2.0, 3.0, 4.0];
        let status = [1, 1, 1, 0];
        let risk = [4.0, 3.0, 2.0, 1.0];
        assert_eq!(harrell_c(&time, &status, &risk), 1.0);
        let reversed = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(harrell_c(&time, &status, &reversed), 0.0);
        let flat = [1.0; 4];
        assert_eq!(harrell_c(&time, &status, &flat), 0.5);
    }
}
