//! # Rate Calibration
//!
//! Converts interpretable design targets into the rates the models consume. Every solver is a
//! scalar monotone equation handed to [`find_root`] with an upward-extending bracket, so a
//! target that no admissible rate reaches ends in an error naming the parameter instead of a
//! wrong root.
//!
//! | target column      | solved column                    | equation                                   |
//! |--------------------|----------------------------------|--------------------------------------------|
//! | `prog_prop_ctrl`   | `prog_rate_ctrl`                 | P(progressed by `followup`) = target        |
//! | `prog_prop_trt`    | `prog_rate_trt`                  | same, treatment arm                        |
//! | `censoring_prop`   | `random_withdrawal`              | Σ p_arm · P(W < T_arm) = target            |
//! | `target_power_ph`  | `hazard_trt` (and `hr_ph`)       | median_trt = median_ctrl / HR_Schoenfeld   |
//!
//! Zero targets take the shortcut of a zero rate (or, for power, the control hazard) without
//! root finding.

use crate::design::{DesignError, DesignRow, DesignTable};
use crate::hazard::SurvivalCurve;
use crate::multistate::{MultiStateCurve, MultiStateError, MultiStateModel};
use crate::quadrature::{QuadratureError, QuadratureOptions, integrate_piecewise};
use crate::roots::{Extend, RootError, RootOptions, find_root};
use crate::scenarios::{Endpoint, Scenario, ScenarioError, ScenarioFamily};
use crate::truth::{NumericalError, median};
use log::{debug, info};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

/// `exp(-36.8)` is below double-precision resolution of 1.
const EXPONENTIAL_TAIL: f64 = 36.8;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("target '{name}' must lie in [0, 1), found {value}")]
    InvalidTarget { name: &'static str, value: f64 },
    #[error("significance level must lie in (0, 1), found {0}")]
    InvalidAlpha(f64),
    #[error("'{name}' must be finite and positive for calibration, found {value}")]
    InvalidHorizon { name: &'static str, value: f64 },
    #[error("could not solve for '{parameter}': {source}")]
    Unsolved {
        parameter: &'static str,
        #[source]
        source: RootError,
    },
    #[error("row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: Box<RateError>,
    },
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    MultiState(#[from] MultiStateError),
    #[error(transparent)]
    Quadrature(#[from] QuadratureError),
    #[error(transparent)]
    Numerical(#[from] NumericalError),
    #[error("standard normal distribution unavailable: {0}")]
    Normal(String),
}

fn check_target(name: &'static str, value: f64) -> Result<(), RateError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(RateError::InvalidTarget { name, value })
    }
}

fn check_horizon(name: &'static str, value: f64) -> Result<(), RateError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(RateError::InvalidHorizon { name, value })
    }
}

fn solve<F: FnMut(f64) -> f64>(
    parameter: &'static str,
    f: F,
    upper: f64,
) -> Result<f64, RateError> {
    let options = RootOptions::default().extend(Extend::Up).floor(0.0);
    let root = find_root(f, 0.0, upper, options)
        .map_err(|source| RateError::Unsolved { parameter, source })?;
    debug!(
        "solved {parameter} = {} after {} iterations and {} bracket extensions",
        root.x, root.iterations, root.extensions
    );
    Ok(root.x)
}

/// Probability of having progressed by `horizon` in the illness–death model.
pub fn progression_proportion(
    hazard: f64,
    progression_rate: f64,
    hazard_after_progression: f64,
    horizon: f64,
) -> Result<f64, RateError> {
    let model = MultiStateModel::illness_death(hazard, progression_rate, hazard_after_progression)?
        .with_absorbing(&[1])?;
    Ok(model.absorption_into(horizon, &[1])?)
}

/// Progression rate giving `target` probability of progression by `horizon`.
pub fn progression_rate(
    hazard: f64,
    hazard_after_progression: f64,
    horizon: f64,
    target: f64,
) -> Result<f64, RateError> {
    check_target("prog_prop", target)?;
    check_horizon("followup", horizon)?;
    if target == 0.0 {
        return Ok(0.0);
    }
    solve(
        "prog_rate",
        |rate| {
            progression_proportion(hazard, rate, hazard_after_progression, horizon)
                .map(|p| p - target)
                .unwrap_or(f64::NAN)
        },
        1.0 / horizon,
    )
}

/// `P(W < T)` for `W ~ Exp(rate)` independent of the event time `T ~ curve`:
/// `∫ rate·exp(-rate·t)·S(t) dt`.
pub fn withdrawal_before_event(curve: &dyn SurvivalCurve, rate: f64) -> Result<f64, RateError> {
    if rate == 0.0 {
        return Ok(0.0);
    }
    let mut upper = EXPONENTIAL_TAIL / rate;
    if let Ok(tail) = curve.quantile(1.0 - 1e-12) {
        upper = upper.min(tail);
    }
    // Quantiles mark where the integrand's mass sits so the first panels do not straddle it.
    let mut cuts = curve.breakpoints();
    for p in [0.25, 0.5, 0.9, 0.99] {
        if let Ok(q) = curve.quantile(p) {
            cuts.push(q);
        }
    }
    cuts.push(1.0 / rate);
    let integral = integrate_piecewise(
        |t| rate * (-rate * t).exp() * curve.survival(t),
        0.0,
        upper,
        &cuts,
        QuadratureOptions::default(),
    )?;
    Ok(integral.value)
}

/// Share-weighted probability of random withdrawal before the event.
pub fn censoring_proportion(
    arms: &[(f64, &dyn SurvivalCurve)],
    rate: f64,
) -> Result<f64, RateError> {
    let mut total = 0.0;
    for &(share, curve) in arms {
        total += share * withdrawal_before_event(curve, rate)?;
    }
    Ok(total)
}

/// Withdrawal rate producing `target` overall censoring proportion.
pub fn censoring_rate(arms: &[(f64, &dyn SurvivalCurve)], target: f64) -> Result<f64, RateError> {
    check_target("censoring_prop", target)?;
    if target == 0.0 {
        return Ok(0.0);
    }
    solve(
        "random_withdrawal",
        |rate| {
            censoring_proportion(arms, rate)
                .map(|p| p - target)
                .unwrap_or(f64::NAN)
        },
        1.0,
    )
}

/// Probability that a patient recruited uniformly over `[0, recruitment]` has the event before
/// the calendar cutoff `followup`.
pub fn event_probability(
    curve: &dyn SurvivalCurve,
    recruitment: f64,
    followup: f64,
) -> Result<f64, RateError> {
    check_horizon("followup", followup)?;
    if recruitment == 0.0 {
        return Ok(1.0 - curve.survival(followup));
    }
    let lower = followup - recruitment;
    let integral = integrate_piecewise(
        |s| 1.0 - curve.survival(s),
        lower,
        followup,
        &curve.breakpoints(),
        QuadratureOptions::default(),
    )?;
    Ok(integral.value / recruitment)
}

/// Hazard ratio detectable with `power` by a two-sided level-`alpha` log-rank test after
/// `events` events, with treatment share `share_trt`: `exp(-(z_{1-α/2} + z_power) / sqrt(p(1-p)d))`.
/// Zero power is the null ratio 1.
pub fn schoenfeld_hazard_ratio(
    power: f64,
    alpha: f64,
    share_trt: f64,
    events: f64,
) -> Result<f64, RateError> {
    check_target("target_power_ph", power)?;
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(RateError::InvalidAlpha(alpha));
    }
    if power == 0.0 {
        return Ok(1.0);
    }
    let information = share_trt * (1.0 - share_trt) * events;
    if !(information > 0.0) {
        return Err(RateError::InvalidHorizon {
            name: "expected events",
            value: information,
        });
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| RateError::Normal(e.to_string()))?;
    let z = normal.inverse_cdf(1.0 - alpha / 2.0) + normal.inverse_cdf(power);
    Ok((-z / information.sqrt()).exp())
}

/// Parameters of the progression family needed to translate a target power into a treatment
/// hazard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerDesign {
    pub n_ctrl: usize,
    pub n_trt: usize,
    pub hazard_ctrl: f64,
    pub prog_rate_ctrl: f64,
    pub prog_rate_trt: f64,
    pub hazard_after_prog: f64,
    pub recruitment: f64,
    pub followup: f64,
}

/// Result of the power calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerCalibration {
    pub hazard_ratio: f64,
    pub hazard_trt: f64,
}

impl PowerDesign {
    fn from_row(row: &DesignRow) -> Result<Self, DesignError> {
        Ok(Self {
            n_ctrl: row.require_count("n_ctrl")?,
            n_trt: row.require_count("n_trt")?,
            hazard_ctrl: row.require_non_negative("hazard_ctrl")?,
            prog_rate_ctrl: row.require_non_negative("prog_rate_ctrl")?,
            prog_rate_trt: row.require_non_negative("prog_rate_trt")?,
            hazard_after_prog: row.require_non_negative("hazard_after_prog")?,
            recruitment: row.require_non_negative("recruitment")?,
            followup: row.require_time("followup")?,
        })
    }

    /// Pre-progression treatment hazard matching the Schoenfeld hazard ratio by median OS.
    pub fn calibrate(&self, power: f64, alpha: f64) -> Result<PowerCalibration, RateError> {
        check_target("target_power_ph", power)?;
        if power == 0.0 && self.prog_rate_trt == self.prog_rate_ctrl {
            return Ok(PowerCalibration {
                hazard_ratio: 1.0,
                hazard_trt: self.hazard_ctrl,
            });
        }

        let control =
            MultiStateModel::illness_death(self.hazard_ctrl, self.prog_rate_ctrl, self.hazard_after_prog)?;
        let control_curve = MultiStateCurve::overall(&control);
        let total = self.n_ctrl + self.n_trt;
        let events = total as f64 * event_probability(&control_curve, self.recruitment, self.followup)?;
        let share_trt = if total == 0 {
            0.5
        } else {
            self.n_trt as f64 / total as f64
        };
        let hazard_ratio = schoenfeld_hazard_ratio(power, alpha, share_trt, events)?;
        let target_median = median(&control_curve)? / hazard_ratio;

        let (prog_rate_trt, hazard_after_prog) = (self.prog_rate_trt, self.hazard_after_prog);
        let hazard_trt = solve(
            "hazard_trt",
            |hazard| {
                MultiStateModel::illness_death(hazard, prog_rate_trt, hazard_after_prog)
                    .map(|model| MultiStateCurve::overall(&model).survival(target_median) - 0.5)
                    .unwrap_or(f64::NAN)
            },
            if self.hazard_ctrl > 0.0 {
                2.0 * self.hazard_ctrl
            } else {
                1.0
            },
        )?;
        Ok(PowerCalibration {
            hazard_ratio,
            hazard_trt,
        })
    }
}

fn per_row<F>(design: &DesignTable, what: &str, f: F) -> Result<DesignTable, RateError>
where
    F: Fn(&DesignRow) -> Result<Vec<(&'static str, f64)>, RateError> + Sync,
{
    info!("calibrating {what} for {} design rows", design.len());
    let rows = design
        .rows()
        .par_iter()
        .enumerate()
        .map(|(row, input)| {
            let solved = f(input).map_err(|source| RateError::Row {
                row,
                source: Box::new(source),
            })?;
            let mut output = input.clone();
            for (name, value) in solved {
                output.set(name, value);
            }
            Ok(output)
        })
        .collect::<Result<Vec<DesignRow>, RateError>>()?;
    Ok(DesignTable::from_rows_with_columns(design.columns(), rows))
}

/// Adds `prog_rate_ctrl` and `prog_rate_trt` from `prog_prop_ctrl` and `prog_prop_trt`, with
/// `followup` as the horizon.
pub fn calibrate_progression(design: &DesignTable) -> Result<DesignTable, RateError> {
    per_row(design, "progression rates", |row| {
        let horizon = row.require_time("followup")?;
        let after = row.require_non_negative("hazard_after_prog")?;
        let ctrl = progression_rate(
            row.require_non_negative("hazard_ctrl")?,
            after,
            horizon,
            row.require("prog_prop_ctrl")?,
        )?;
        let trt = progression_rate(
            row.require_non_negative("hazard_trt")?,
            after,
            horizon,
            row.require("prog_prop_trt")?,
        )?;
        Ok(vec![("prog_rate_ctrl", ctrl), ("prog_rate_trt", trt)])
    })
}

/// Adds `random_withdrawal` from `censoring_prop` for scenarios of `family`.
pub fn calibrate_censoring(
    design: &DesignTable,
    family: ScenarioFamily,
) -> Result<DesignTable, RateError> {
    per_row(design, "random withdrawal rates", |row| {
        let target = row.require("censoring_prop")?;
        let scenario = Scenario::from_row(family, row)?;
        let (share_ctrl, share_trt) = scenario.arm_shares();
        let (control, treatment) = scenario.curves(Endpoint::Overall)?;
        let arms = [(share_ctrl, control.as_ref()), (share_trt, treatment.as_ref())];
        Ok(vec![("random_withdrawal", censoring_rate(&arms, target)?)])
    })
}

/// Adds `hr_ph` and `hazard_trt` from `target_power_ph` for progression scenarios.
pub fn calibrate_ph_power(design: &DesignTable, alpha: f64) -> Result<DesignTable, RateError> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(RateError::InvalidAlpha(alpha));
    }
    per_row(design, "treatment hazards from target power", |row| {
        let power = row.require("target_power_ph")?;
        let solved = PowerDesign::from_row(row)?.calibrate(power, alpha)?;
        Ok(vec![("hr_ph", solved.hazard_ratio), ("hazard_trt", solved.hazard_trt)])
    })
}
