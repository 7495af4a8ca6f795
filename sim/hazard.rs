//! # Piecewise-Constant Hazards
//!
//! A [`PiecewiseHazard`] partitions time into intervals `[t_i, t_{i+1})` starting at zero,
//! with a constant non-negative rate on each and the last interval unbounded. Every derived
//! quantity is closed form:
//!
//! - cumulative hazard `H(t) = H(t_i) + λ_i (t - t_i)` on interval `i`,
//! - survival `S(t) = exp(-H(t))` and density `f(t) = λ(t) S(t)`,
//! - quantile `Q(p) = H⁻¹(-ln(1 - p))`, solved linearly inside the interval whose cumulative
//!   hazard range contains the target.
//!
//! A zero rate makes the cumulative hazard flat on its interval. When the last rate is zero
//! the survival curve levels off above zero and quantiles beyond that plateau (and the samples
//! that would land there) are `+∞`.
//!
//! [`SurvivalCurve`] is the interface the truth engine integrates against. Besides the
//! piecewise model it is implemented by [`SurvivalMixture`] and by the absorption view of a
//! multi-state model.

use crate::quadrature::{QuadratureError, QuadratureOptions, integrate_piecewise};
use crate::roots::{Extend, RootError, RootOptions, find_root};
use ndarray::Array1;
use rand::Rng;
use rand::distributions::Open01;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HazardError {
    #[error("a piecewise hazard needs at least one interval")]
    Empty,
    #[error("number of rates ({rates}) must equal number of interval starts ({starts})")]
    LengthMismatch { starts: usize, rates: usize },
    #[error("the first interval must start at 0, found {0}")]
    FirstStartNotZero(f64),
    #[error("interval starts must be finite and strictly increasing (violated at index {index})")]
    StartsNotIncreasing { index: usize },
    #[error("hazard rate at index {index} must be finite and non-negative, found {value}")]
    InvalidRate { index: usize, value: f64 },
    #[error("probability {0} is outside [0, 1)")]
    ProbabilityOutOfRange(f64),
    #[error("mixture weights must be positive, finite and sum to 1 (sum was {sum})")]
    InvalidMixtureWeights { sum: f64 },
    #[error("quantile search failed: {0}")]
    Root(#[from] RootError),
}

/// Common interface of every event-time distribution the truth engine integrates.
///
/// Implementations must be cheap to evaluate pointwise; the engine calls them a few thousand
/// times per statistic.
pub trait SurvivalCurve: Send + Sync {
    fn hazard(&self, t: f64) -> f64;

    fn survival(&self, t: f64) -> f64;

    fn cumulative_hazard(&self, t: f64) -> f64 {
        -self.survival(t).ln()
    }

    fn density(&self, t: f64) -> f64 {
        self.hazard(t) * self.survival(t)
    }

    /// Interior times at which the curve's derivatives may jump.
    fn breakpoints(&self) -> Vec<f64>;

    /// Smallest `t` with `1 - S(t) >= p`; `+∞` when the curve never falls that far.
    fn quantile(&self, p: f64) -> Result<f64, HazardError> {
        check_probability(p)?;
        if p == 0.0 {
            return Ok(0.0);
        }
        let target = 1.0 - p;
        let options = RootOptions::default().extend(Extend::Up);
        match find_root(|t| self.survival(t) - target, 0.0, 1.0, options) {
            Ok(root) => Ok(root.x),
            Err(RootError::NoSignChange { f_upper, .. }) if f_upper > 0.0 => Ok(f64::INFINITY),
            Err(err) => Err(err.into()),
        }
    }

    /// `∫₀^cutoff S(t) dt`.
    fn restricted_mean(&self, cutoff: f64) -> Result<f64, QuadratureError> {
        let integral = integrate_piecewise(
            |t| self.survival(t),
            0.0,
            cutoff,
            &self.breakpoints(),
            QuadratureOptions::default(),
        )?;
        Ok(integral.value)
    }

    fn hazard_at(&self, times: &Array1<f64>) -> Array1<f64> {
        times.mapv(|t| self.hazard(t))
    }

    fn survival_at(&self, times: &Array1<f64>) -> Array1<f64> {
        times.mapv(|t| self.survival(t))
    }

    fn density_at(&self, times: &Array1<f64>) -> Array1<f64> {
        times.mapv(|t| self.density(t))
    }

    fn cumulative_hazard_at(&self, times: &Array1<f64>) -> Array1<f64> {
        times.mapv(|t| self.cumulative_hazard(t))
    }
}

fn check_probability(p: f64) -> Result<(), HazardError> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(HazardError::ProbabilityOutOfRange(p))
    }
}

/// Draws `E ~ Exp(1)` as `-ln U` with `U` uniform on the open unit interval.
#[inline]
pub(crate) fn standard_exponential<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u: f64 = rng.sample(Open01);
    -u.ln()
}

/// Hazard that is constant between consecutive interval starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseHazard {
    starts: Vec<f64>,
    rates: Vec<f64>,
    /// `H(starts[i])`, cached so evaluation is a binary search plus one multiply-add.
    cumulative: Vec<f64>,
}

impl PiecewiseHazard {
    pub fn new(starts: &[f64], rates: &[f64]) -> Result<Self, HazardError> {
        if starts.is_empty() {
            return Err(HazardError::Empty);
        }
        if starts.len() != rates.len() {
            return Err(HazardError::LengthMismatch {
                starts: starts.len(),
                rates: rates.len(),
            });
        }
        if starts[0] != 0.0 {
            return Err(HazardError::FirstStartNotZero(starts[0]));
        }
        for index in 1..starts.len() {
            if !starts[index].is_finite() || starts[index] <= starts[index - 1] {
                return Err(HazardError::StartsNotIncreasing { index });
            }
        }
        for (index, &value) in rates.iter().enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(HazardError::InvalidRate { index, value });
            }
        }

        let mut cumulative = Vec::with_capacity(starts.len());
        cumulative.push(0.0);
        for i in 1..starts.len() {
            let previous = cumulative[i - 1];
            cumulative.push(previous + rates[i - 1] * (starts[i] - starts[i - 1]));
        }

        Ok(Self {
            starts: starts.to_vec(),
            rates: rates.to_vec(),
            cumulative,
        })
    }

    /// Exponential model with a single unbounded interval.
    pub fn constant(rate: f64) -> Result<Self, HazardError> {
        Self::new(&[0.0], &[rate])
    }

    pub fn starts(&self) -> &[f64] {
        &self.starts
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// Index of the interval containing `t` (clamped to the first interval for `t < 0`).
    #[inline]
    fn interval(&self, t: f64) -> usize {
        self.starts.partition_point(|&s| s <= t).saturating_sub(1)
    }

    /// Inverts the cumulative hazard: the smallest `t` with `H(t) >= target`.
    pub fn inverse_cumulative_hazard(&self, target: f64) -> f64 {
        if target.is_nan() {
            return f64::NAN;
        }
        if target <= 0.0 {
            return 0.0;
        }
        let i = self.cumulative.partition_point(|&h| h < target) - 1;
        let rate = self.rates[i];
        if rate == 0.0 {
            // Only the unbounded last interval can be flat and still short of `target`.
            return f64::INFINITY;
        }
        self.starts[i] + (target - self.cumulative[i]) / rate
    }

    /// Exact inverse of the distribution function.
    pub fn quantile_exact(&self, p: f64) -> Result<f64, HazardError> {
        check_probability(p)?;
        if p == 0.0 {
            return Ok(0.0);
        }
        Ok(self.inverse_cumulative_hazard(-(-p).ln_1p()))
    }

    /// Draws one event time. With `discrete`, times are rounded up to the next whole time unit,
    /// so an event drawn at 3.2 is reported at 4 and every event lands on a positive integer.
    pub fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R, discrete: bool) -> f64 {
        let t = self.inverse_cumulative_hazard(standard_exponential(rng));
        if discrete { t.ceil() } else { t }
    }

    /// Draws an event time conditional on no event before `start`.
    pub fn sample_after<R: Rng + ?Sized>(&self, start: f64, rng: &mut R) -> f64 {
        let target = self.cumulative_hazard(start) + standard_exponential(rng);
        self.inverse_cumulative_hazard(target).max(start)
    }

    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R, discrete: bool) -> Vec<f64> {
        (0..n).map(|_| self.sample_one(rng, discrete)).collect()
    }

    fn restricted_mean_exact(&self, cutoff: f64) -> f64 {
        if !(cutoff > 0.0) {
            return 0.0;
        }
        let mut total = 0.0;
        for i in 0..self.starts.len() {
            let start = self.starts[i];
            if start >= cutoff {
                break;
            }
            let end = self
                .starts
                .get(i + 1)
                .copied()
                .unwrap_or(f64::INFINITY)
                .min(cutoff);
            let width = end - start;
            let survival_start = (-self.cumulative[i]).exp();
            let rate = self.rates[i];
            total += if rate == 0.0 {
                survival_start * width
            } else {
                survival_start * -(-rate * width).exp_m1() / rate
            };
        }
        total
    }
}

impl SurvivalCurve for PiecewiseHazard {
    fn hazard(&self, t: f64) -> f64 {
        if t < 0.0 {
            return 0.0;
        }
        self.rates[self.interval(t)]
    }

    fn cumulative_hazard(&self, t: f64) -> f64 {
        if t.is_nan() {
            return f64::NAN;
        }
        if t <= 0.0 {
            return 0.0;
        }
        let i = self.interval(t);
        let rate = self.rates[i];
        if rate == 0.0 {
            return self.cumulative[i];
        }
        self.cumulative[i] + rate * (t - self.starts[i])
    }

    fn survival(&self, t: f64) -> f64 {
        (-self.cumulative_hazard(t)).exp()
    }

    fn density(&self, t: f64) -> f64 {
        if t < 0.0 {
            return 0.0;
        }
        let rate = self.hazard(t);
        if rate == 0.0 {
            return 0.0;
        }
        rate * self.survival(t)
    }

    fn breakpoints(&self) -> Vec<f64> {
        self.starts[1..].to_vec()
    }

    fn quantile(&self, p: f64) -> Result<f64, HazardError> {
        self.quantile_exact(p)
    }

    fn restricted_mean(&self, cutoff: f64) -> Result<f64, QuadratureError> {
        if !cutoff.is_finite() || cutoff < 0.0 {
            return Err(QuadratureError::InvalidInterval {
                lower: 0.0,
                upper: cutoff,
            });
        }
        Ok(self.restricted_mean_exact(cutoff))
    }
}

/// Finite mixture of piecewise hazards: with probability `weights[k]` a patient follows
/// `components[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalMixture {
    weights: Vec<f64>,
    components: Vec<PiecewiseHazard>,
}

impl SurvivalMixture {
    pub fn new(weights: Vec<f64>, components: Vec<PiecewiseHazard>) -> Result<Self, HazardError> {
        if components.is_empty() {
            return Err(HazardError::Empty);
        }
        if weights.len() != components.len() {
            return Err(HazardError::LengthMismatch {
                starts: components.len(),
                rates: weights.len(),
            });
        }
        let sum: f64 = weights.iter().sum();
        let valid = weights.iter().all(|w| w.is_finite() && *w >= 0.0);
        if !valid || (sum - 1.0).abs() > 1e-12 {
            return Err(HazardError::InvalidMixtureWeights { sum });
        }
        Ok(Self {
            weights,
            components,
        })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn components(&self) -> &[PiecewiseHazard] {
        &self.components
    }

    /// Picks a component by weight, then draws from it.
    pub fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R, discrete: bool) -> f64 {
        let u: f64 = rng.sample(Open01);
        let mut acc = 0.0;
        let last = self.components.len() - 1;
        for (k, (w, component)) in self.weights.iter().zip(&self.components).enumerate() {
            acc += w;
            if u < acc || k == last {
                return component.sample_one(rng, discrete);
            }
        }
        self.components[last].sample_one(rng, discrete)
    }
}

impl SurvivalCurve for SurvivalMixture {
    fn hazard(&self, t: f64) -> f64 {
        let survival = self.survival(t);
        if survival > 0.0 {
            return self.density(t) / survival;
        }
        // Past underflow the mixture hazard tends to its smallest component hazard.
        self.components
            .iter()
            .map(|c| c.hazard(t))
            .fold(f64::INFINITY, f64::min)
    }

    fn survival(&self, t: f64) -> f64 {
        self.weights
            .iter()
            .zip(&self.components)
            .map(|(w, c)| w * c.survival(t))
            .sum()
    }

    fn density(&self, t: f64) -> f64 {
        self.weights
            .iter()
            .zip(&self.components)
            .map(|(w, c)| w * c.density(t))
            .sum()
    }

    fn breakpoints(&self) -> Vec<f64> {
        let mut points: Vec<f64> = self
            .components
            .iter()
            .flat_map(|c| c.breakpoints())
            .collect();
        points.sort_by(f64::total_cmp);
        points.dedup();
        points
    }

    fn restricted_mean(&self, cutoff: f64) -> Result<f64, QuadratureError> {
        let mut total = 0.0;
        for (w, component) in self.weights.iter().zip(&self.components) {
            total += w * component.restricted_mean(cutoff)?;
        }
        Ok(total)
    }
}
