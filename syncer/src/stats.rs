//! Robust summary statistics over numeric series.
//!
//! All functions are pure and order independent: they sort an internal copy
//! where ordering matters. Conventions:
//!
//! * quantiles use linear interpolation at index `p * (n - 1)`;
//! * standard deviation is the population form (divides by `n`);
//! * MAD is the raw median of absolute deviations, without the 1.4826
//!   consistency scaling.

use crate::errors::{Error, Result};
use serde::Serialize;

pub const DEFAULT_OUTLIER_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub mad: f64,
    pub iqr: f64,
    pub sample_size: usize,
}

fn check(data: &[f64]) -> Result<()> {
    if data.is_empty() {
        return Err(Error::InvalidInput("Statistics requested on an empty series".to_string()));
    }
    if let Some(v) = data.iter().find(|v| !v.is_finite()) {
        return Err(Error::InvalidInput(format!("Series contains non-finite value {}", v)));
    }
    Ok(())
}

fn sorted(data: &[f64]) -> Vec<f64> {
    let mut copy = data.to_vec();
    copy.sort_by(|a, b| a.total_cmp(b));
    copy
}

fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let index = p * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    let fraction = index - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

pub fn quantile(data: &[f64], p: f64) -> Result<f64> {
    check(data)?;
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::InvalidInput(format!("Quantile {} outside [0, 1]", p)));
    }
    Ok(quantile_sorted(&sorted(data), p))
}

pub fn interquartile_range(data: &[f64]) -> Result<f64> {
    Ok(quantile(data, 0.75)? - quantile(data, 0.25)?)
}

/// Keeps values inside `[Q1 - factor * IQR, Q3 + factor * IQR]`, preserving
/// their relative order.
///
/// With a degenerate series (IQR = 0) only values equal to the quartiles
/// survive, so the result may be shorter than expected or even empty when
/// the quartiles are not attained by any sample.
pub fn remove_outliers(data: &[f64], factor: f64) -> Result<Vec<f64>> {
    check(data)?;
    if !factor.is_finite() || factor < 0.0 {
        return Err(Error::InvalidInput(format!("Outlier factor {} must be finite and >= 0", factor)));
    }

    let ordered = sorted(data);
    let q1 = quantile_sorted(&ordered, 0.25);
    let q3 = quantile_sorted(&ordered, 0.75);
    let iqr = q3 - q1;
    let lower = q1 - factor * iqr;
    let upper = q3 + factor * iqr;

    Ok(data
        .iter()
        .copied()
        .filter(|v| *v >= lower && *v <= upper)
        .collect())
}

pub fn mean(data: &[f64]) -> Result<f64> {
    check(data)?;
    Ok(data.iter().sum::<f64>() / data.len() as f64)
}

pub fn median(data: &[f64]) -> Result<f64> {
    quantile(data, 0.5)
}

/// Population standard deviation
pub fn standard_deviation(data: &[f64]) -> Result<f64> {
    let m = mean(data)?;
    let variance = data.iter().map(|v| (v - m).powi(2)).sum::<f64>() / data.len() as f64;
    Ok(variance.sqrt())
}

pub fn median_absolute_deviation(data: &[f64]) -> Result<f64> {
    let m = median(data)?;
    let deviations: Vec<f64> = data.iter().map(|v| (v - m).abs()).collect();
    median(&deviations)
}

/// Computes every statistic over `data` as given (no outlier removal).
pub fn summarize(data: &[f64]) -> Result<Summary> {
    Ok(Summary {
        mean: mean(data)?,
        median: median(data)?,
        std_dev: standard_deviation(data)?,
        mad: median_absolute_deviation(data)?,
        iqr: interquartile_range(data)?,
        sample_size: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_quantile_interpolates() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.5).unwrap(), 2.5);
        assert_eq!(quantile(&[4.0, 1.0, 3.0, 2.0], 0.0).unwrap(), 1.0);
        assert_eq!(quantile(&[4.0, 1.0, 3.0, 2.0], 1.0).unwrap(), 4.0);
        assert!(approx(quantile(&[1.0, 2.0, 3.0, 4.0], 0.25).unwrap(), 1.75));
        assert_eq!(quantile(&[7.0], 0.9).unwrap(), 7.0);
    }

    #[test]
    fn test_quantile_rejects_bad_input() {
        assert!(matches!(quantile(&[], 0.5), Err(Error::InvalidInput(_))));
        assert!(matches!(quantile(&[1.0], 1.5), Err(Error::InvalidInput(_))));
        assert!(matches!(quantile(&[1.0, f64::NAN], 0.5), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_remove_outliers_drops_extreme_value() {
        let data = [10.0, 11.0, 9.0, 10.0, 12.0, 500.0];
        let kept = remove_outliers(&data, 1.5).unwrap();
        assert_eq!(kept, vec![10.0, 11.0, 9.0, 10.0, 12.0]);
    }

    #[test]
    fn test_remove_outliers_degenerate_series() {
        let kept = remove_outliers(&[5.0, 5.0, 5.0], 1.5).unwrap();
        assert_eq!(kept, vec![5.0, 5.0, 5.0]);

        // Quartiles land on 5.0 and 5.0 so the single 9.0 is cut.
        let kept = remove_outliers(&[5.0, 5.0, 5.0, 5.0, 9.0], 1.5).unwrap();
        assert_eq!(kept, vec![5.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_remove_outliers_empty_is_invalid() {
        assert!(matches!(remove_outliers(&[], 1.5), Err(Error::InvalidInput(_))));
        assert!(remove_outliers(&[1.0], -1.0).is_err());
    }

    #[test]
    fn test_population_standard_deviation() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&data).unwrap(), 5.0);
        assert_eq!(standard_deviation(&data).unwrap(), 2.0);
        assert_eq!(standard_deviation(&[3.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_median_and_mad() {
        let data = [1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0];
        assert_eq!(median(&data).unwrap(), 2.0);
        // deviations: 1 1 0 0 2 4 7
        assert_eq!(median_absolute_deviation(&data).unwrap(), 1.0);
    }

    #[test]
    fn test_summarize() {
        let summary = summarize(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(summary.sample_size, 4);
        assert_eq!(summary.mean, 2.5);
        assert_eq!(summary.median, 2.5);
        assert!(approx(summary.iqr, 1.5));
        assert_eq!(summary.mad, 1.0);
        assert!(approx(summary.std_dev, 1.25_f64.sqrt()));
    }
}
