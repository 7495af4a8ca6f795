//! Scenario families.
//!
//! A family turns one design row into a pair of per-arm event-time models plus the optional
//! censoring plan. Each family reads a fixed set of columns; see
//! [`ScenarioFamily::required_columns`].

use crate::design::{DesignError, DesignRow};
use crate::hazard::{HazardError, PiecewiseHazard, SurvivalCurve, SurvivalMixture};
use crate::multistate::{MultiStateCurve, MultiStateError, MultiStateModel};
use crate::simulate::{
    CensoringPlan, EventTimeModel, Intercurrent, SimulateError, SimulatedDataset, generate,
};
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("unknown scenario family '{given}'; accepted values are: {accepted}")]
    UnknownFamily { given: String, accepted: String },
    #[error("the {endpoint} endpoint requires a multi-state scenario, but the {family} family has none")]
    EndpointUnavailable {
        endpoint: Endpoint,
        family: ScenarioFamily,
    },
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error("invalid hazard parameters: {0}")]
    Hazard(#[from] HazardError),
    #[error("invalid multi-state parameters: {0}")]
    MultiState(#[from] MultiStateError),
    #[error(transparent)]
    Simulate(#[from] SimulateError),
}

const COMMON_COLUMNS: [&str; 2] = ["n_trt", "n_ctrl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioFamily {
    DelayedEffect,
    CrossingHazards,
    Subgroup,
    Progression,
}

impl ScenarioFamily {
    pub const ALL: [ScenarioFamily; 4] = [
        ScenarioFamily::DelayedEffect,
        ScenarioFamily::CrossingHazards,
        ScenarioFamily::Subgroup,
        ScenarioFamily::Progression,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScenarioFamily::DelayedEffect => "delayed-effect",
            ScenarioFamily::CrossingHazards => "crossing-hazards",
            ScenarioFamily::Subgroup => "subgroup",
            ScenarioFamily::Progression => "progression",
        }
    }

    /// Model columns, in addition to `n_trt` and `n_ctrl`.
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            ScenarioFamily::DelayedEffect => &["delay", "hazard_ctrl", "hazard_trt"],
            ScenarioFamily::CrossingHazards => &[
                "crossing",
                "hazard_ctrl",
                "hazard_trt_before",
                "hazard_trt_after",
            ],
            ScenarioFamily::Subgroup => {
                &["prevalence", "hazard_ctrl", "hazard_trt", "hazard_subgroup"]
            }
            ScenarioFamily::Progression => &[
                "hazard_ctrl",
                "hazard_trt",
                "prog_rate_ctrl",
                "prog_rate_trt",
                "hazard_after_prog",
            ],
        }
    }

    pub fn is_multistate(self) -> bool {
        self == ScenarioFamily::Progression
    }
}

impl fmt::Display for ScenarioFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioFamily {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|family| family.name() == normalised)
            .ok_or_else(|| ScenarioError::UnknownFamily {
                given: s.to_string(),
                accepted: Self::ALL.map(ScenarioFamily::name).join(", "),
            })
    }
}

/// Which event process a curve describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Absorption (death from any cause).
    Overall,
    /// Absorption or entry into the intercurrent state, whichever comes first.
    ProgressionFree,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Overall => f.write_str("overall survival"),
            Endpoint::ProgressionFree => f.write_str("progression-free survival"),
        }
    }
}

/// Event-time model of one arm.
#[derive(Debug, Clone, PartialEq)]
pub enum ArmModel {
    Piecewise(PiecewiseHazard),
    Mixture(SurvivalMixture),
    MultiState(MultiStateModel),
}

impl ArmModel {
    /// Survival curve of `endpoint`, or `None` when this model has no such process.
    pub fn curve(&self, endpoint: Endpoint) -> Result<Option<Box<dyn SurvivalCurve>>, MultiStateError> {
        Ok(match (self, endpoint) {
            (ArmModel::Piecewise(h), Endpoint::Overall) => Some(Box::new(h.clone())),
            (ArmModel::Mixture(m), Endpoint::Overall) => Some(Box::new(m.clone())),
            (ArmModel::MultiState(m), Endpoint::Overall) => {
                Some(Box::new(MultiStateCurve::overall(m)))
            }
            (ArmModel::MultiState(m), Endpoint::ProgressionFree) => {
                Some(Box::new(MultiStateCurve::progression_free(m)?))
            }
            (_, Endpoint::ProgressionFree) => None,
        })
    }

    pub fn multistate(&self) -> Option<&MultiStateModel> {
        match self {
            ArmModel::MultiState(m) => Some(m),
            _ => None,
        }
    }
}

impl EventTimeModel for ArmModel {
    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<(f64, Option<Intercurrent>), SimulateError> {
        match self {
            ArmModel::Piecewise(h) => h.draw(rng, discrete),
            ArmModel::Mixture(m) => m.draw(rng, discrete),
            ArmModel::MultiState(m) => m.draw(rng, discrete),
        }
    }
}

/// Reads the optional censoring block. Absent columns leave the step out.
pub fn censoring_plan(row: &DesignRow) -> Result<CensoringPlan, DesignError> {
    let optional = |name: &str, finite: bool| -> Result<Option<f64>, DesignError> {
        if !row.contains(name) {
            return Ok(None);
        }
        let value = if finite {
            row.require_non_negative(name)?
        } else {
            row.require_time(name)?
        };
        Ok(Some(value))
    };
    Ok(CensoringPlan {
        recruitment: optional("recruitment", true)?,
        random_withdrawal: optional("random_withdrawal", true)?,
        followup: optional("followup", false)?,
        target_events: None,
    })
}

/// A fully specified scenario: arm sizes, per-arm models and censoring.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub family: ScenarioFamily,
    pub n_ctrl: usize,
    pub n_trt: usize,
    pub control: ArmModel,
    pub treatment: ArmModel,
    pub censoring: CensoringPlan,
}

impl Scenario {
    /// Parses a design row. Every required column is checked before any model is built.
    pub fn from_row(family: ScenarioFamily, row: &DesignRow) -> Result<Self, ScenarioError> {
        for name in COMMON_COLUMNS.iter().chain(family.required_columns()) {
            row.require(name)?;
        }
        let n_trt = row.require_count("n_trt")?;
        let n_ctrl = row.require_count("n_ctrl")?;
        let (control, treatment) = match family {
            ScenarioFamily::DelayedEffect => delayed_effect(row)?,
            ScenarioFamily::CrossingHazards => crossing_hazards(row)?,
            ScenarioFamily::Subgroup => subgroup(row)?,
            ScenarioFamily::Progression => progression(row)?,
        };
        Ok(Self {
            family,
            n_ctrl,
            n_trt,
            control,
            treatment,
            censoring: censoring_plan(row)?,
        })
    }

    pub fn arm_shares(&self) -> (f64, f64) {
        let total = (self.n_ctrl + self.n_trt) as f64;
        if total == 0.0 {
            return (0.5, 0.5);
        }
        (self.n_ctrl as f64 / total, self.n_trt as f64 / total)
    }

    /// Control and treatment curves of `endpoint`.
    pub fn curves(
        &self,
        endpoint: Endpoint,
    ) -> Result<(Box<dyn SurvivalCurve>, Box<dyn SurvivalCurve>), ScenarioError> {
        let unavailable = || ScenarioError::EndpointUnavailable {
            endpoint,
            family: self.family,
        };
        let control = self.control.curve(endpoint)?.ok_or_else(unavailable)?;
        let treatment = self.treatment.curve(endpoint)?.ok_or_else(unavailable)?;
        Ok((control, treatment))
    }

    /// Draws a dataset with no censoring.
    pub fn generate_uncensored<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<SimulatedDataset, ScenarioError> {
        Ok(generate(
            self.n_ctrl,
            &self.control,
            self.n_trt,
            &self.treatment,
            rng,
            discrete,
        )?)
    }

    /// Draws a dataset and applies the scenario's censoring plan.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<SimulatedDataset, ScenarioError> {
        let data = self.generate_uncensored(rng, discrete)?;
        Ok(self.censoring.apply(data, rng)?)
    }
}

fn rate(row: &DesignRow, name: &str) -> Result<f64, DesignError> {
    row.require_non_negative(name)
}

fn delayed_effect(row: &DesignRow) -> Result<(ArmModel, ArmModel), ScenarioError> {
    let delay = rate(row, "delay")?;
    let hazard_ctrl = rate(row, "hazard_ctrl")?;
    let hazard_trt = rate(row, "hazard_trt")?;
    let control = PiecewiseHazard::constant(hazard_ctrl)?;
    let treatment = if delay > 0.0 {
        PiecewiseHazard::new(&[0.0, delay], &[hazard_ctrl, hazard_trt])?
    } else {
        PiecewiseHazard::constant(hazard_trt)?
    };
    Ok((ArmModel::Piecewise(control), ArmModel::Piecewise(treatment)))
}

fn crossing_hazards(row: &DesignRow) -> Result<(ArmModel, ArmModel), ScenarioError> {
    let crossing = rate(row, "crossing")?;
    let hazard_ctrl = rate(row, "hazard_ctrl")?;
    let before = rate(row, "hazard_trt_before")?;
    let after = rate(row, "hazard_trt_after")?;
    let control = PiecewiseHazard::constant(hazard_ctrl)?;
    let treatment = if crossing > 0.0 {
        PiecewiseHazard::new(&[0.0, crossing], &[before, after])?
    } else {
        PiecewiseHazard::constant(after)?
    };
    Ok((ArmModel::Piecewise(control), ArmModel::Piecewise(treatment)))
}

fn subgroup(row: &DesignRow) -> Result<(ArmModel, ArmModel), ScenarioError> {
    let prevalence = row.require_probability("prevalence")?;
    let control = PiecewiseHazard::constant(rate(row, "hazard_ctrl")?)?;
    let rest = PiecewiseHazard::constant(rate(row, "hazard_trt")?)?;
    let responders = PiecewiseHazard::constant(rate(row, "hazard_subgroup")?)?;
    let treatment = SurvivalMixture::new(vec![1.0 - prevalence, prevalence], vec![rest, responders])?;
    Ok((ArmModel::Piecewise(control), ArmModel::Mixture(treatment)))
}

fn progression(row: &DesignRow) -> Result<(ArmModel, ArmModel), ScenarioError> {
    let after = rate(row, "hazard_after_prog")?;
    let control = MultiStateModel::illness_death(
        rate(row, "hazard_ctrl")?,
        rate(row, "prog_rate_ctrl")?,
        after,
    )?;
    let treatment = MultiStateModel::illness_death(
        rate(row, "hazard_trt")?,
        rate(row, "prog_rate_trt")?,
        after,
    )?;
    Ok((ArmModel::MultiState(control), ArmModel::MultiState(treatment)))
}
