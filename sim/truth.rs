//! # True Summary Statistics
//!
//! Population values that simulated estimators are scored against, computed from the arms'
//! survival curves rather than from data.
//!
//! For a control curve `(h_c, S_c, f_c)`, a treatment curve `(h_t, S_t, f_t)`, arm shares
//! `p_c + p_t = 1` and the pooled distribution `F = p_c F_c + p_t F_t`, the averaged hazard
//! ratios up to the cutoff `τ` are
//!
//! - `AHR    = ∫ h_t/(h_t+h_c) dF / ∫ h_c/(h_t+h_c) dF`,
//! - `gAHR   = exp(∫ log(h_t/h_c) dF / F(τ))`,
//! - `AHRoc  = ∫ f_t S_c dt / ∫ f_c S_t dt`,
//! - `gAHRoc = exp(∫ log(h_t/h_c) d(1 - S_t S_c) / (1 - S_t(τ) S_c(τ)))`.
//!
//! Under proportional hazards all four equal the constant ratio.
//!
//! Medians are found by Brent's method on `S(t) = 1/2`; restricted means and the ratios by
//! Gauss–Kronrod quadrature split at the curves' breakpoints. A statistic that cannot be
//! computed for a row is written as `NaN` with a warning naming the row and statistic, unless
//! strict mode turns it into an error.

use crate::design::{DesignRow, DesignTable};
use crate::hazard::{HazardError, SurvivalCurve};
use crate::quadrature::{QuadratureError, QuadratureOptions, integrate_piecewise};
use crate::roots::{Extend, RootError, RootOptions, find_root};
use crate::scenarios::{Endpoint, Scenario, ScenarioError, ScenarioFamily};
use log::{info, warn};
use rayon::prelude::*;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Probability mass left in both arms at the automatic cutoff.
pub const AUTO_CUTOFF_TAIL: f64 = 1e-4;
/// Initial upper end of the median search when a curve never falls below the automatic-cutoff
/// tail; the bracket then doubles until it encloses the median.
const MEDIAN_SEARCH_START: f64 = 1.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NumericalError {
    #[error("survival never reaches 0.5 on [0, {t_max}]")]
    NoMedian { t_max: f64 },
    #[error("neither arm falls below 1e-4 survival; no automatic cutoff exists")]
    NoAutoCutoff,
    #[error("{0} is zero; the ratio is undefined")]
    ZeroDenominator(&'static str),
    #[error("each arm has a zero-hazard stretch where the other does not; the averaged log hazard ratio is undefined")]
    IndeterminateLogRatio,
    #[error(transparent)]
    Root(#[from] RootError),
    #[error(transparent)]
    Quadrature(#[from] QuadratureError),
    #[error(transparent)]
    Hazard(#[from] HazardError),
}

#[derive(Debug, Error)]
pub enum TruthError {
    #[error("unsupported statistic selector '{given}'; accepted values are: os, pfs, both")]
    UnknownSelector { given: String },
    #[error("{what} must be finite and positive, found {value}")]
    InvalidTime { what: &'static str, value: f64 },
    #[error("row {row}: {source}")]
    Scenario {
        row: usize,
        #[source]
        source: ScenarioError,
    },
    #[error(transparent)]
    Family(#[from] ScenarioError),
    #[error("row {row}: statistic '{statistic}' failed: {source}")]
    Numerical {
        row: usize,
        statistic: String,
        #[source]
        source: NumericalError,
    },
}

/// Which event processes to summarise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSelection {
    #[default]
    Os,
    Pfs,
    Both,
}

impl EndpointSelection {
    pub fn endpoints(self) -> &'static [Endpoint] {
        match self {
            EndpointSelection::Os => &[Endpoint::Overall],
            EndpointSelection::Pfs => &[Endpoint::ProgressionFree],
            EndpointSelection::Both => &[Endpoint::Overall, Endpoint::ProgressionFree],
        }
    }
}

impl FromStr for EndpointSelection {
    type Err = TruthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "os" => Ok(EndpointSelection::Os),
            "pfs" => Ok(EndpointSelection::Pfs),
            "both" => Ok(EndpointSelection::Both),
            _ => Err(TruthError::UnknownSelector {
                given: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for EndpointSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointSelection::Os => "os",
            EndpointSelection::Pfs => "pfs",
            EndpointSelection::Both => "both",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TruthOptions {
    /// Cutoffs for RMST and the averaged hazard ratios; empty selects the automatic cutoff.
    pub cutoffs: Vec<f64>,
    pub milestones: Vec<f64>,
    pub endpoints: EndpointSelection,
    /// Turn per-row numerical failures into errors instead of `NaN`.
    pub strict: bool,
}

impl TruthOptions {
    fn validate(&self) -> Result<(), TruthError> {
        for &value in &self.cutoffs {
            if !(value.is_finite() && value > 0.0) {
                return Err(TruthError::InvalidTime {
                    what: "cutoff",
                    value,
                });
            }
        }
        for &value in &self.milestones {
            if !(value.is_finite() && value > 0.0) {
                return Err(TruthError::InvalidTime {
                    what: "milestone",
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Averaged hazard ratios up to one cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AverageHazardRatios {
    pub ahr: f64,
    pub gahr: f64,
    pub ahr_oc: f64,
    pub gahr_oc: f64,
}

/// Both arms of one endpoint together with their sample shares.
pub struct ArmPair<'a> {
    pub control: &'a dyn SurvivalCurve,
    pub treatment: &'a dyn SurvivalCurve,
    pub share_control: f64,
    pub share_treatment: f64,
}

fn log_ratio(numerator: f64, denominator: f64) -> f64 {
    (numerator / denominator).ln()
}

impl<'a> ArmPair<'a> {
    fn breakpoints(&self) -> Vec<f64> {
        let mut points = self.control.breakpoints();
        points.extend(self.treatment.breakpoints());
        points
    }

    fn integrate<F: FnMut(f64) -> f64>(&self, f: F, cutoff: f64) -> Result<f64, QuadratureError> {
        Ok(integrate_piecewise(f, 0.0, cutoff, &self.breakpoints(), QuadratureOptions::default())?.value)
    }

    /// The earlier of the two arms' `1 - 1e-4` quantiles.
    pub fn auto_cutoff(&self) -> Result<f64, NumericalError> {
        let control = self.control.quantile(1.0 - AUTO_CUTOFF_TAIL)?;
        let treatment = self.treatment.quantile(1.0 - AUTO_CUTOFF_TAIL)?;
        let cutoff = control.min(treatment);
        if cutoff.is_finite() {
            Ok(cutoff)
        } else {
            Err(NumericalError::NoAutoCutoff)
        }
    }

    fn pooled_density(&self, t: f64) -> f64 {
        self.share_control * self.control.density(t) + self.share_treatment * self.treatment.density(t)
    }

    /// `exp(∫ log(h_t/h_c) w dt / mass)` on `[0, cutoff]`. A stretch of positive weight where only
    /// the treatment hazard vanishes drives the average to 0; one where only the control hazard
    /// vanishes drives it to `+∞`.
    fn geometric_average<W: Fn(f64) -> f64>(
        &self,
        weight: W,
        mass: f64,
        cutoff: f64,
    ) -> Result<f64, NumericalError> {
        if mass <= 0.0 {
            return Err(NumericalError::ZeroDenominator("the event probability by the cutoff"));
        }
        let mut treatment_vanishes = false;
        let mut control_vanishes = false;
        let log_integral = self.integrate(
            |t| {
                let w = weight(t);
                if w <= 0.0 {
                    return 0.0;
                }
                let (ht, hc) = (self.treatment.hazard(t), self.control.hazard(t));
                match (ht > 0.0, hc > 0.0) {
                    (true, true) => log_ratio(ht, hc) * w,
                    (false, true) => {
                        treatment_vanishes = true;
                        0.0
                    }
                    (true, false) => {
                        control_vanishes = true;
                        0.0
                    }
                    (false, false) => 0.0,
                }
            },
            cutoff,
        )?;
        match (treatment_vanishes, control_vanishes) {
            (true, true) => Err(NumericalError::IndeterminateLogRatio),
            (true, false) => Ok(0.0),
            (false, true) => Ok(f64::INFINITY),
            (false, false) => Ok((log_integral / mass).exp()),
        }
    }

    /// Kalbfleisch–Prentice average hazard ratio on `[0, cutoff]`.
    pub fn ahr(&self, cutoff: f64) -> Result<f64, NumericalError> {
        let weighted = |t: f64, hazard: f64| {
            let total = self.control.hazard(t) + self.treatment.hazard(t);
            if total > 0.0 {
                hazard / total * self.pooled_density(t)
            } else {
                0.0
            }
        };
        let numerator = self.integrate(|t| weighted(t, self.treatment.hazard(t)), cutoff)?;
        let denominator = self.integrate(|t| weighted(t, self.control.hazard(t)), cutoff)?;
        if denominator <= 0.0 {
            return Err(NumericalError::ZeroDenominator("the control-weighted event mass"));
        }
        Ok(numerator / denominator)
    }

    /// Geometric average hazard ratio weighted by the pooled event distribution.
    pub fn gahr(&self, cutoff: f64) -> Result<f64, NumericalError> {
        let mass = 1.0
            - (self.share_control * self.control.survival(cutoff)
                + self.share_treatment * self.treatment.survival(cutoff));
        self.geometric_average(|t| self.pooled_density(t), mass, cutoff)
    }

    /// Ratio of the probabilities that the treatment event comes first and that the control
    /// event comes first, both by the cutoff.
    pub fn ahr_oc(&self, cutoff: f64) -> Result<f64, NumericalError> {
        let numerator = self.integrate(
            |t| self.treatment.density(t) * self.control.survival(t),
            cutoff,
        )?;
        let denominator = self.integrate(
            |t| self.control.density(t) * self.treatment.survival(t),
            cutoff,
        )?;
        if denominator <= 0.0 {
            return Err(NumericalError::ZeroDenominator("the control event mass"));
        }
        Ok(numerator / denominator)
    }

    /// Geometric average hazard ratio weighted by the first event of either arm.
    pub fn gahr_oc(&self, cutoff: f64) -> Result<f64, NumericalError> {
        let mass = 1.0 - self.control.survival(cutoff) * self.treatment.survival(cutoff);
        self.geometric_average(
            |t| {
                self.treatment.density(t) * self.control.survival(t)
                    + self.control.density(t) * self.treatment.survival(t)
            },
            mass,
            cutoff,
        )
    }

    /// All four averaged hazard ratios on `[0, cutoff]`, failing if any one fails.
    pub fn average_hazard_ratios(&self, cutoff: f64) -> Result<AverageHazardRatios, NumericalError> {
        Ok(AverageHazardRatios {
            ahr: self.ahr(cutoff)?,
            gahr: self.gahr(cutoff)?,
            ahr_oc: self.ahr_oc(cutoff)?,
            gahr_oc: self.gahr_oc(cutoff)?,
        })
    }
}

/// Median of `curve`: the root of `S(t) - 1/2`. The search starts on `[0, t_max]`, where `t_max`
/// is the curve's `1 - 1e-4` quantile, and grows upwards when that quantile does not exist, so
/// only a survival plateau above one half has no median.
pub fn median(curve: &dyn SurvivalCurve) -> Result<f64, NumericalError> {
    let (t_max, options) = match curve.quantile(1.0 - AUTO_CUTOFF_TAIL) {
        Ok(t) if t.is_finite() && t > 0.0 => (t, RootOptions::default()),
        _ => (MEDIAN_SEARCH_START, RootOptions::default().extend(Extend::Up)),
    };
    match find_root(|t| curve.survival(t) - 0.5, 0.0, t_max, options) {
        Ok(root) => Ok(root.x),
        Err(RootError::NoSignChange { upper, .. }) => Err(NumericalError::NoMedian { t_max: upper }),
        Err(err) => Err(err.into()),
    }
}

pub fn rmst(curve: &dyn SurvivalCurve, cutoff: f64) -> Result<f64, NumericalError> {
    Ok(curve.restricted_mean(cutoff)?)
}

/// Column suffix for a time: integral values print without a decimal point.
pub fn time_label(t: f64) -> String {
    if t.fract() == 0.0 && t.abs() < 1e15 {
        format!("{}", t as i64)
    } else {
        format!("{t}")
    }
}

/// Collects named statistics for one row, containing numerical failures.
struct RowStatistics {
    row: usize,
    strict: bool,
    prefix: &'static str,
    values: Vec<(String, f64)>,
}

impl RowStatistics {
    fn push(&mut self, name: String, value: Result<f64, NumericalError>) -> Result<f64, TruthError> {
        let column = format!("{}{name}", self.prefix);
        let value = match value {
            Ok(v) => v,
            Err(source) if self.strict => {
                return Err(TruthError::Numerical {
                    row: self.row,
                    statistic: column,
                    source,
                });
            }
            Err(err) => {
                warn!("row {}: statistic '{column}' set to NaN: {err}", self.row);
                f64::NAN
            }
        };
        self.values.push((column, value));
        Ok(value)
    }
}

fn endpoint_statistics(
    scenario: &Scenario,
    endpoint: Endpoint,
    options: &TruthOptions,
    row: usize,
) -> Result<Vec<(String, f64)>, TruthError> {
    let (control, treatment) = scenario
        .curves(endpoint)
        .map_err(|source| TruthError::Scenario { row, source })?;
    let (share_control, share_treatment) = scenario.arm_shares();
    let pair = ArmPair {
        control: control.as_ref(),
        treatment: treatment.as_ref(),
        share_control,
        share_treatment,
    };
    let mut stats = RowStatistics {
        row,
        strict: options.strict,
        prefix: match endpoint {
            Endpoint::Overall => "",
            Endpoint::ProgressionFree => "pfs_",
        },
        values: Vec::new(),
    };

    let median_ctrl = stats.push("median_surv_ctrl".into(), median(pair.control))?;
    let median_trt = stats.push("median_surv_trt".into(), median(pair.treatment))?;
    stats.push("median_diff".into(), Ok(median_trt - median_ctrl))?;

    let cutoffs: Vec<(String, Result<f64, NumericalError>)> = if options.cutoffs.is_empty() {
        let auto = pair.auto_cutoff();
        stats.push("cutoff_auto".into(), auto.clone())?;
        vec![("auto".to_string(), auto)]
    } else {
        options
            .cutoffs
            .iter()
            .map(|&tau| (time_label(tau), Ok(tau)))
            .collect()
    };

    for (label, cutoff) in cutoffs {
        let rmst_ctrl = cutoff.clone().and_then(|tau| rmst(pair.control, tau));
        let rmst_trt = cutoff.clone().and_then(|tau| rmst(pair.treatment, tau));
        let rmst_ctrl = stats.push(format!("rmst_ctrl_{label}"), rmst_ctrl)?;
        let rmst_trt = stats.push(format!("rmst_trt_{label}"), rmst_trt)?;
        stats.push(format!("rmst_diff_{label}"), Ok(rmst_trt - rmst_ctrl))?;

        stats.push(format!("AHR_{label}"), cutoff.clone().and_then(|tau| pair.ahr(tau)))?;
        stats.push(format!("gAHR_{label}"), cutoff.clone().and_then(|tau| pair.gahr(tau)))?;
        stats.push(format!("AHRoc_{label}"), cutoff.clone().and_then(|tau| pair.ahr_oc(tau)))?;
        stats.push(format!("gAHRoc_{label}"), cutoff.and_then(|tau| pair.gahr_oc(tau)))?;
    }

    for &m in &options.milestones {
        let label = time_label(m);
        let ctrl = stats.push(format!("milestone_surv_ctrl_{label}"), Ok(pair.control.survival(m)))?;
        let trt = stats.push(format!("milestone_surv_trt_{label}"), Ok(pair.treatment.survival(m)))?;
        stats.push(format!("milestone_diff_{label}"), Ok(trt - ctrl))?;
    }
    Ok(stats.values)
}

/// True statistics of one scenario, in output column order.
pub fn scenario_statistics(
    scenario: &Scenario,
    options: &TruthOptions,
    row: usize,
) -> Result<Vec<(String, f64)>, TruthError> {
    let mut values = Vec::new();
    for &endpoint in options.endpoints.endpoints() {
        values.extend(endpoint_statistics(scenario, endpoint, options, row)?);
    }
    Ok(values)
}

/// Appends the true statistics of every row of `design` as new columns, one output row per
/// input row in the same order. Configuration problems in any row abort before any
/// integration starts.
pub fn true_summary_statistics(
    design: &DesignTable,
    family: ScenarioFamily,
    options: &TruthOptions,
) -> Result<DesignTable, TruthError> {
    options.validate()?;
    if options.endpoints != EndpointSelection::Os && !family.is_multistate() {
        return Err(TruthError::Family(ScenarioError::EndpointUnavailable {
            endpoint: Endpoint::ProgressionFree,
            family,
        }));
    }

    let scenarios = design
        .rows()
        .iter()
        .enumerate()
        .map(|(row, values)| {
            Scenario::from_row(family, values).map_err(|source| TruthError::Scenario { row, source })
        })
        .collect::<Result<Vec<Scenario>, TruthError>>()?;

    info!(
        "computing true {} statistics for {} {family} scenarios",
        options.endpoints,
        scenarios.len()
    );

    let rows = design
        .rows()
        .par_iter()
        .zip(scenarios.par_iter())
        .enumerate()
        .map(|(index, (input, scenario))| {
            let mut output: DesignRow = input.clone();
            for (name, value) in scenario_statistics(scenario, options, index)? {
                output.set(&name, value);
            }
            Ok(output)
        })
        .collect::<Result<Vec<DesignRow>, TruthError>>()?;

    Ok(DesignTable::from_rows_with_columns(design.columns(), rows))
}
