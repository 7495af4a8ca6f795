//! Operating characteristics over replicates.
//!
//! An external analysis library turns each simulated dataset into, per method, a p-value and
//! possibly a point estimate with a confidence interval ([`AnalysisResult`]). This module
//! aggregates those over replicates: rejection rates for tests, and bias, variance, MSE,
//! coverage and interval width for estimators scored against the true statistics of the
//! scenario row.
//!
//! Which estimate is compared with which true value is declared once in a [`StatisticMap`]
//! as a pair of plain functions, one reading the replicate output and one reading the design
//! row, evaluated when the summary is built.

use crate::design::{DesignError, DesignRow};
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("significance level must lie in (0, 1), found {0}")]
    InvalidAlpha(f64),
    #[error("true value of '{statistic}' is not finite ({value})")]
    NonFiniteTruth { statistic: String, value: f64 },
    #[error(transparent)]
    Design(#[from] DesignError),
}

/// Output of one analysis method on one dataset. Every field is optional.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct AnalysisResult {
    pub p_value: Option<f64>,
    pub estimate: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl AnalysisResult {
    /// The p-value when it is a probability.
    pub fn valid_p_value(&self) -> Option<f64> {
        self.p_value.filter(|p| (0.0..=1.0).contains(p))
    }

    pub fn valid_estimate(&self) -> Option<f64> {
        self.estimate.filter(|e| e.is_finite())
    }

    /// `(lower, upper)` when both bounds exist and are ordered. Infinite bounds are allowed.
    pub fn valid_interval(&self) -> Option<(f64, f64)> {
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) if lower <= upper => Some((lower, upper)),
            _ => None,
        }
    }
}

/// Results of every method on one replicate, keyed by method name.
pub type ReplicateOutput = BTreeMap<String, AnalysisResult>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestSummary {
    pub replicates: usize,
    pub rejection_rate: f64,
    /// Replicates without a usable p-value.
    pub missing: usize,
}

/// Share of replicates with `p < alpha`, among those with a valid p-value.
pub fn summarise_test(results: &[AnalysisResult], alpha: f64) -> Result<TestSummary, SummaryError> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(SummaryError::InvalidAlpha(alpha));
    }
    let mut rejected = 0usize;
    let mut valid = 0usize;
    for result in results {
        match result.valid_p_value() {
            Some(p) => {
                valid += 1;
                if p < alpha {
                    rejected += 1;
                }
            }
            None => {
                if let Some(p) = result.p_value {
                    warn!("ignoring p-value {p} outside [0, 1]");
                }
            }
        }
    }
    Ok(TestSummary {
        replicates: results.len(),
        rejection_rate: if valid == 0 {
            f64::NAN
        } else {
            rejected as f64 / valid as f64
        },
        missing: results.len() - valid,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSummary {
    pub replicates: usize,
    pub truth: f64,
    pub mean: f64,
    pub bias: f64,
    /// Sample variance (`n - 1` denominator).
    pub variance: f64,
    pub mse: f64,
    pub coverage: f64,
    pub mean_width: f64,
    pub missing_estimates: usize,
    pub missing_intervals: usize,
}

pub fn summarise_estimator(results: &[AnalysisResult], truth: f64) -> EstimatorSummary {
    let estimates: Vec<f64> = results.iter().filter_map(AnalysisResult::valid_estimate).collect();
    let intervals: Vec<(f64, f64)> = results.iter().filter_map(AnalysisResult::valid_interval).collect();

    let n = estimates.len() as f64;
    let (mean, variance, mse) = if estimates.is_empty() {
        (f64::NAN, f64::NAN, f64::NAN)
    } else {
        let mean = estimates.iter().sum::<f64>() / n;
        let variance = if estimates.len() > 1 {
            estimates.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            f64::NAN
        };
        let mse = estimates.iter().map(|e| (e - truth).powi(2)).sum::<f64>() / n;
        (mean, variance, mse)
    };

    let (coverage, mean_width) = if intervals.is_empty() {
        (f64::NAN, f64::NAN)
    } else {
        let m = intervals.len() as f64;
        let covered = intervals
            .iter()
            .filter(|(lower, upper)| *lower <= truth && truth <= *upper)
            .count();
        let width = intervals.iter().map(|(lower, upper)| upper - lower).sum::<f64>() / m;
        (covered as f64 / m, width)
    };

    EstimatorSummary {
        replicates: results.len(),
        truth,
        mean,
        bias: mean - truth,
        variance,
        mse,
        coverage,
        mean_width,
        missing_estimates: results.len() - estimates.len(),
        missing_intervals: results.len() - intervals.len(),
    }
}

type EstimateFn = Box<dyn Fn(&ReplicateOutput) -> Option<AnalysisResult> + Send + Sync>;
type TruthFn = Box<dyn Fn(&DesignRow) -> Result<f64, DesignError> + Send + Sync>;

struct StatisticEntry {
    name: String,
    estimate: EstimateFn,
    truth: TruthFn,
}

/// Named estimator statistics: how to read the estimate from a replicate and the true value
/// from the design row.
#[derive(Default)]
pub struct StatisticMap {
    entries: Vec<StatisticEntry>,
}

impl StatisticMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<E, T>(mut self, name: &str, estimate: E, truth: T) -> Self
    where
        E: Fn(&ReplicateOutput) -> Option<AnalysisResult> + Send + Sync + 'static,
        T: Fn(&DesignRow) -> Result<f64, DesignError> + Send + Sync + 'static,
    {
        self.entries.push(StatisticEntry {
            name: name.to_string(),
            estimate: Box::new(estimate),
            truth: Box::new(truth),
        });
        self
    }

    /// Compares method `method` with the design column `truth_column`.
    pub fn method(self, name: &str, method: &str, truth_column: &str) -> Self {
        let method = method.to_string();
        let column = truth_column.to_string();
        self.with(
            name,
            move |output| output.get(&method).copied(),
            move |row| row.require(&column),
        )
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summaries of every statistic for one scenario.
    pub fn evaluate(
        &self,
        replicates: &[ReplicateOutput],
        condition: &DesignRow,
    ) -> Result<Vec<(String, EstimatorSummary)>, SummaryError> {
        self.entries
            .iter()
            .map(|entry| {
                let truth = (entry.truth)(condition)?;
                if !truth.is_finite() {
                    return Err(SummaryError::NonFiniteTruth {
                        statistic: entry.name.clone(),
                        value: truth,
                    });
                }
                let results: Vec<AnalysisResult> = replicates
                    .iter()
                    .map(|output| (entry.estimate)(output).unwrap_or_default())
                    .collect();
                Ok((entry.name.clone(), summarise_estimator(&results, truth)))
            })
            .collect()
    }

    /// The condition row extended with `<name>_bias`, `<name>_mse`, ... columns.
    pub fn summary_row(
        &self,
        replicates: &[ReplicateOutput],
        condition: &DesignRow,
    ) -> Result<DesignRow, SummaryError> {
        let mut row = condition.clone();
        for (name, summary) in self.evaluate(replicates, condition)? {
            row.set(&format!("{name}_mean"), summary.mean);
            row.set(&format!("{name}_bias"), summary.bias);
            row.set(&format!("{name}_var"), summary.variance);
            row.set(&format!("{name}_mse"), summary.mse);
            row.set(&format!("{name}_coverage"), summary.coverage);
            row.set(&format!("{name}_width"), summary.mean_width);
        }
        Ok(row)
    }
}

/// Rejection rate of every method found in `replicates`, as `<method>_rejection` columns.
pub fn rejection_rates(
    replicates: &[ReplicateOutput],
    alpha: f64,
) -> Result<Vec<(String, TestSummary)>, SummaryError> {
    let mut methods: Vec<&String> = replicates.iter().flat_map(|r| r.keys()).collect();
    methods.sort();
    methods.dedup();
    methods
        .into_iter()
        .map(|method| {
            let results: Vec<AnalysisResult> = replicates
                .iter()
                .map(|r| r.get(method).copied().unwrap_or_default())
                .collect();
            Ok((format!("{method}_rejection"), summarise_test(&results, alpha)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn result(p: f64, estimate: f64, lower: f64, upper: f64) -> AnalysisResult {
        AnalysisResult {
            p_value: Some(p),
            estimate: Some(estimate),
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    #[test]
    fn rejection_rate_ignores_invalid_p_values() {
        let results = [
            result(0.01, 0.0, 0.0, 0.0),
            result(0.2, 0.0, 0.0, 0.0),
            result(1.7, 0.0, 0.0, 0.0),
            AnalysisResult::default(),
        ];
        let summary = summarise_test(&results, 0.05).unwrap();
        assert_eq!(summary.replicates, 4);
        assert_eq!(summary.missing, 2);
        assert_abs_diff_eq!(summary.rejection_rate, 0.5);
        assert!(summarise_test(&results, 0.0).is_err());
    }

    #[test]
    fn estimator_summary_scores_against_truth() {
        let results = [
            result(0.1, 0.6, 0.5, 0.7),
            result(0.1, 0.8, 0.75, 0.9),
            result(0.1, 0.7, 0.6, 0.8),
        ];
        let summary = summarise_estimator(&results, 0.7);
        assert_abs_diff_eq!(summary.mean, 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.bias, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.variance, 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mse, 0.02 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.coverage, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean_width, 0.55 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn reversed_intervals_count_as_missing() {
        let results = [result(0.1, 1.0, 2.0, 0.5)];
        let summary = summarise_estimator(&results, 1.0);
        assert_eq!(summary.missing_intervals, 1);
        assert!(summary.coverage.is_nan());
    }

    #[test]
    fn statistic_map_pairs_estimates_with_design_columns() {
        let map = StatisticMap::new().method("gAHR", "cox", "gAHR_20").with(
            "log_hr",
            |output| {
                output.get("cox").map(|r| AnalysisResult {
                    estimate: r.estimate.map(f64::ln),
                    ..AnalysisResult::default()
                })
            },
            |row| Ok(row.require("gAHR_20")?.ln()),
        );
        let replicates: Vec<ReplicateOutput> = [0.6, 0.7]
            .iter()
            .map(|&e| BTreeMap::from([("cox".to_string(), result(0.01, e, e - 0.1, e + 0.1))]))
            .collect();
        let condition = DesignRow::new().with("gAHR_20", 0.65);
        let row = map.summary_row(&replicates, &condition).unwrap();
        assert_abs_diff_eq!(row.get("gAHR_bias").unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(row.get("gAHR_coverage").unwrap(), 1.0);
        assert!(row.get("log_hr_coverage").unwrap().is_nan());

        let missing = DesignRow::new();
        assert!(matches!(
            map.evaluate(&replicates, &missing),
            Err(SummaryError::Design(DesignError::MissingColumn(_)))
        ));

        let rates = rejection_rates(&replicates, 0.05).unwrap();
        assert_eq!(rates[0].0, "cox_rejection");
        assert_abs_diff_eq!(rates[0].1.rejection_rate, 1.0);
    }
}
