//! # Multi-State Models
//!
//! Continuous-time Markov models on a finite state space with piecewise-constant transition
//! intensities. Piece `k` covers `[s_k, s_{k+1})` and carries a generator `Q_k` whose
//! off-diagonal entries are instantaneous transition rates and whose diagonal is the negative
//! row sum. State occupation probabilities are propagated exactly, piece by piece:
//!
//! `p(t) = p(s_k) · exp(Q_k (t - s_k))`,
//!
//! using the scaling-and-squaring Padé exponential from [`crate::linalg`], which stays accurate
//! for 3×3 generators whose rates span several orders of magnitude.
//!
//! The overall event of a patient is absorption into any absorbing state, so
//! `1 - S(t) = Σ_{absorbing} p_i(t)`. The progression-free view is obtained by additionally
//! making the intermediate (progressed) state absorbing, see
//! [`MultiStateModel::with_absorbing`].
//!
//! Paths are sampled transition by transition: from the current state, every outgoing
//! transition gets a latent time drawn by inverting its own piecewise cumulative intensity from
//! the current time, and the earliest one fires. Ties, which only arise when times are rounded
//! to whole units, go to the absorbing destination, so an intermediate transition counts only
//! when it is strictly earlier than the competing absorption.

use crate::hazard::{HazardError, PiecewiseHazard, SurvivalCurve};
use crate::linalg::{LinalgError, expm};
use ndarray::{Array1, Array2, array};
use rand::Rng;
use rand::distributions::Open01;
use thiserror::Error;

const PROBABILITY_TOLERANCE: f64 = 1e-9;
/// Upper bound on transitions along a single sampled path.
const MAX_PATH_TRANSITIONS: usize = 100_000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MultiStateError {
    #[error("a multi-state model needs at least one state")]
    NoStates,
    #[error("intensity matrix for piece {piece} is {rows}x{cols}, expected {states}x{states}")]
    Dimension {
        piece: usize,
        rows: usize,
        cols: usize,
        states: usize,
    },
    #[error("piece starts must begin at 0 and increase strictly (violated at piece {piece})")]
    PieceStarts { piece: usize },
    #[error("number of piece starts ({starts}) must equal number of intensity matrices ({matrices})")]
    PieceCount { starts: usize, matrices: usize },
    #[error(
        "transition intensity {from}->{to} on piece {piece} must be finite and non-negative, found {value}"
    )]
    InvalidIntensity {
        piece: usize,
        from: usize,
        to: usize,
        value: f64,
    },
    #[error(
        "diagonal entry {state} on piece {piece} is {value}; it must be 0 or the negative row sum {expected}"
    )]
    InvalidDiagonal {
        piece: usize,
        state: usize,
        value: f64,
        expected: f64,
    },
    #[error("initial distribution must be non-negative and sum to 1 (sum was {sum})")]
    InvalidInitial { sum: f64 },
    #[error("state {state} is out of range for a model with {states} states")]
    UnknownState { state: usize, states: usize },
    #[error("at least one absorbing state is required")]
    NoAbsorbingState,
    #[error("state {state} is declared absorbing but has outgoing intensity on piece {piece}")]
    AbsorbingWithExit { state: usize, piece: usize },
    #[error("model has no intercurrent state to derive an event-free process from")]
    NoIntercurrentState,
    #[error("sampled path exceeded {0} transitions")]
    TransitionLimit(usize),
    #[error("matrix exponential failed: {0}")]
    Linalg(#[from] LinalgError),
    #[error("transition intensity table is invalid: {0}")]
    Hazard(#[from] HazardError),
}

/// Outcome of one simulated patient path.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledPath {
    /// Time of first absorption, `+∞` when the path never absorbs.
    pub absorption_time: f64,
    pub absorbed_in: Option<usize>,
    /// `(state, entry time)` for every state visited, starting with the initial state at 0.
    pub visits: Vec<(usize, f64)>,
}

impl SampledPath {
    /// Entry time into `state`, if the path visited it.
    pub fn entry_time(&self, state: usize) -> Option<f64> {
        self.visits
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, t)| *t)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiStateModel {
    starts: Vec<f64>,
    generators: Vec<Array2<f64>>,
    initial: Array1<f64>,
    absorbing: Vec<bool>,
    intercurrent: Option<usize>,
    /// Occupation probabilities at each piece start.
    entry_occupancy: Vec<Array1<f64>>,
    /// `transitions[i][j]`: piecewise intensity of the jump `i -> j`, when ever positive.
    transitions: Vec<Vec<Option<PiecewiseHazard>>>,
}

impl MultiStateModel {
    /// Builds a model from piece starts, one intensity matrix per piece, the initial
    /// distribution and the designated absorbing states.
    ///
    /// Diagonal entries may be given as zero, in which case they are filled in as the negative
    /// off-diagonal row sum; any other diagonal value must already equal that sum.
    pub fn new(
        starts: &[f64],
        intensities: Vec<Array2<f64>>,
        initial: Array1<f64>,
        absorbing_states: &[usize],
    ) -> Result<Self, MultiStateError> {
        let states = initial.len();
        if states == 0 {
            return Err(MultiStateError::NoStates);
        }
        if starts.len() != intensities.len() || starts.is_empty() {
            return Err(MultiStateError::PieceCount {
                starts: starts.len(),
                matrices: intensities.len(),
            });
        }
        if starts[0] != 0.0 {
            return Err(MultiStateError::PieceStarts { piece: 0 });
        }
        for piece in 1..starts.len() {
            if !starts[piece].is_finite() || starts[piece] <= starts[piece - 1] {
                return Err(MultiStateError::PieceStarts { piece });
            }
        }

        let sum = initial.sum();
        if initial.iter().any(|p| !p.is_finite() || *p < 0.0)
            || (sum - 1.0).abs() > PROBABILITY_TOLERANCE
        {
            return Err(MultiStateError::InvalidInitial { sum });
        }

        let mut generators = Vec::with_capacity(intensities.len());
        for (piece, mut q) in intensities.into_iter().enumerate() {
            let (rows, cols) = q.dim();
            if rows != states || cols != states {
                return Err(MultiStateError::Dimension {
                    piece,
                    rows,
                    cols,
                    states,
                });
            }
            for from in 0..states {
                let mut row_sum = 0.0;
                for to in 0..states {
                    if from == to {
                        continue;
                    }
                    let value = q[(from, to)];
                    if !value.is_finite() || value < 0.0 {
                        return Err(MultiStateError::InvalidIntensity {
                            piece,
                            from,
                            to,
                            value,
                        });
                    }
                    row_sum += value;
                }
                let diagonal = q[(from, from)];
                let expected = -row_sum;
                let scale = row_sum.max(f64::MIN_POSITIVE);
                if diagonal != 0.0 && (diagonal - expected).abs() > PROBABILITY_TOLERANCE * scale {
                    return Err(MultiStateError::InvalidDiagonal {
                        piece,
                        state: from,
                        value: diagonal,
                        expected,
                    });
                }
                q[(from, from)] = expected;
            }
            generators.push(q);
        }

        if absorbing_states.is_empty() {
            return Err(MultiStateError::NoAbsorbingState);
        }
        let mut absorbing = vec![false; states];
        for &state in absorbing_states {
            if state >= states {
                return Err(MultiStateError::UnknownState { state, states });
            }
            for (piece, q) in generators.iter().enumerate() {
                if q[(state, state)] != 0.0 {
                    return Err(MultiStateError::AbsorbingWithExit { state, piece });
                }
            }
            absorbing[state] = true;
        }

        let mut model = Self {
            starts: starts.to_vec(),
            generators,
            initial,
            absorbing,
            intercurrent: None,
            entry_occupancy: Vec::new(),
            transitions: Vec::new(),
        };
        model.precompute()?;
        Ok(model)
    }

    /// Three-state illness–death model with constant rates: state 0 is alive without
    /// progression, state 1 is progressed, state 2 is death. State 1 is reported as the
    /// intercurrent event.
    pub fn illness_death(
        hazard: f64,
        progression_rate: f64,
        hazard_after_progression: f64,
    ) -> Result<Self, MultiStateError> {
        let q = array![
            [0.0, progression_rate, hazard],
            [0.0, 0.0, hazard_after_progression],
            [0.0, 0.0, 0.0],
        ];
        let model = Self::new(&[0.0], vec![q], Array1::from(vec![1.0, 0.0, 0.0]), &[2])?;
        model.with_intercurrent(1)
    }

    /// Marks `state` as the intercurrent event whose entry time is reported by samplers.
    pub fn with_intercurrent(mut self, state: usize) -> Result<Self, MultiStateError> {
        if state >= self.n_states() {
            return Err(MultiStateError::UnknownState {
                state,
                states: self.n_states(),
            });
        }
        self.intercurrent = Some(state);
        Ok(self)
    }

    /// Copy of the model in which `states` are additionally absorbing: their outgoing
    /// intensities are removed, so absorption into them means "reached at least once".
    pub fn with_absorbing(&self, states: &[usize]) -> Result<Self, MultiStateError> {
        let mut model = self.clone();
        for &state in states {
            if state >= model.n_states() {
                return Err(MultiStateError::UnknownState {
                    state,
                    states: model.n_states(),
                });
            }
            for q in model.generators.iter_mut() {
                q.row_mut(state).fill(0.0);
            }
            model.absorbing[state] = true;
        }
        model.precompute()?;
        Ok(model)
    }

    fn precompute(&mut self) -> Result<(), MultiStateError> {
        let mut occupancy = Vec::with_capacity(self.starts.len());
        let mut current = self.initial.clone();
        occupancy.push(current.clone());
        for k in 0..self.starts.len() - 1 {
            let width = self.starts[k + 1] - self.starts[k];
            let propagator = expm(&(&self.generators[k] * width))?;
            current = current.dot(&propagator);
            occupancy.push(current.clone());
        }
        self.entry_occupancy = occupancy;

        let states = self.n_states();
        let mut transitions = vec![vec![None; states]; states];
        for (from, row) in transitions.iter_mut().enumerate() {
            for (to, slot) in row.iter_mut().enumerate() {
                if from == to {
                    continue;
                }
                let rates: Vec<f64> = self.generators.iter().map(|q| q[(from, to)]).collect();
                if rates.iter().any(|&r| r > 0.0) {
                    *slot = Some(PiecewiseHazard::new(&self.starts, &rates)?);
                }
            }
        }
        self.transitions = transitions;
        Ok(())
    }

    pub fn n_states(&self) -> usize {
        self.initial.len()
    }

    pub fn absorbing_states(&self) -> Vec<usize> {
        (0..self.n_states()).filter(|&s| self.absorbing[s]).collect()
    }

    pub fn intercurrent_state(&self) -> Option<usize> {
        self.intercurrent
    }

    pub fn piece_starts(&self) -> &[f64] {
        &self.starts
    }

    #[inline]
    fn piece(&self, t: f64) -> usize {
        self.starts.partition_point(|&s| s <= t).saturating_sub(1)
    }

    /// Generator in force at time `t`.
    pub fn generator_at(&self, t: f64) -> &Array2<f64> {
        &self.generators[self.piece(t.max(0.0))]
    }

    /// State occupation probabilities at time `t` (the initial distribution for `t <= 0`).
    pub fn occupancy(&self, t: f64) -> Result<Array1<f64>, MultiStateError> {
        if t <= 0.0 {
            return Ok(self.initial.clone());
        }
        let k = self.piece(t);
        let elapsed = t - self.starts[k];
        let propagator = expm(&(&self.generators[k] * elapsed))?;
        Ok(self.entry_occupancy[k].dot(&propagator))
    }

    /// Probability of having been absorbed in any absorbing state by `t`.
    pub fn cumulative_absorption(&self, t: f64) -> Result<f64, MultiStateError> {
        let absorbing = self.absorbing_states();
        self.absorption_into(t, &absorbing)
    }

    /// Occupancy summed over `states`.
    pub fn absorption_into(&self, t: f64, states: &[usize]) -> Result<f64, MultiStateError> {
        let p = self.occupancy(t)?;
        let mut total = 0.0;
        for &state in states {
            total += *p.get(state).ok_or(MultiStateError::UnknownState {
                state,
                states: self.n_states(),
            })?;
        }
        Ok(total)
    }

    /// Instantaneous absorption rate density: `Σ_i p_i(t) Σ_{j absorbing} q_ij(t)`.
    pub fn absorption_density(&self, t: f64) -> Result<f64, MultiStateError> {
        if t < 0.0 {
            return Ok(0.0);
        }
        let p = self.occupancy(t)?;
        let q = self.generator_at(t);
        let mut density = 0.0;
        for from in 0..self.n_states() {
            if self.absorbing[from] {
                continue;
            }
            let into_absorbing: f64 = (0..self.n_states())
                .filter(|&to| to != from && self.absorbing[to])
                .map(|to| q[(from, to)])
                .sum();
            density += p[from] * into_absorbing;
        }
        Ok(density)
    }

    fn initial_state<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.sample(Open01);
        let mut acc = 0.0;
        for (state, p) in self.initial.iter().enumerate() {
            acc += p;
            if u < acc {
                return state;
            }
        }
        // Rounding in the cumulative sum: fall back to the last state with positive mass.
        self.initial
            .iter()
            .rposition(|&p| p > 0.0)
            .unwrap_or(0)
    }

    /// Simulates one path until absorption.
    ///
    /// With `discrete`, every latent transition time is rounded up to a whole time unit before
    /// the competing transitions are compared.
    pub fn sample_path<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<SampledPath, MultiStateError> {
        let mut state = self.initial_state(rng);
        let mut now = 0.0;
        let mut visits = vec![(state, 0.0)];

        for _ in 0..MAX_PATH_TRANSITIONS {
            if self.absorbing[state] {
                return Ok(SampledPath {
                    absorption_time: now,
                    absorbed_in: Some(state),
                    visits,
                });
            }

            let mut next: Option<(usize, f64)> = None;
            for (to, transition) in self.transitions[state].iter().enumerate() {
                let Some(intensity) = transition else {
                    continue;
                };
                let mut latent = intensity.sample_after(now, rng);
                if discrete {
                    latent = latent.ceil();
                }
                let wins = match next {
                    None => true,
                    Some((best, best_time)) => {
                        latent < best_time
                            || (latent == best_time && self.absorbing[to] && !self.absorbing[best])
                    }
                };
                if wins {
                    next = Some((to, latent));
                }
            }

            match next {
                Some((to, time)) if time.is_finite() => {
                    state = to;
                    now = time;
                    visits.push((state, now));
                }
                _ => {
                    return Ok(SampledPath {
                        absorption_time: f64::INFINITY,
                        absorbed_in: None,
                        visits,
                    });
                }
            }
        }
        Err(MultiStateError::TransitionLimit(MAX_PATH_TRANSITIONS))
    }

    pub fn sample_paths<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
        discrete: bool,
    ) -> Result<Vec<SampledPath>, MultiStateError> {
        (0..n).map(|_| self.sample_path(rng, discrete)).collect()
    }
}

/// Event-time view of a multi-state model: the event is absorption.
///
/// Evaluation failures of the matrix exponential surface as `NaN`, which the truth engine
/// reports per statistic.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStateCurve {
    model: MultiStateModel,
}

impl MultiStateCurve {
    /// All-cause event: absorption into the model's absorbing states.
    pub fn overall(model: &MultiStateModel) -> Self {
        Self {
            model: model.clone(),
        }
    }

    /// Event-free view: leaving the initial state through the intercurrent state also counts.
    pub fn progression_free(model: &MultiStateModel) -> Result<Self, MultiStateError> {
        let intercurrent = model
            .intercurrent_state()
            .ok_or(MultiStateError::NoIntercurrentState)?;
        Ok(Self {
            model: model.with_absorbing(&[intercurrent])?,
        })
    }

    pub fn model(&self) -> &MultiStateModel {
        &self.model
    }
}

impl SurvivalCurve for MultiStateCurve {
    fn hazard(&self, t: f64) -> f64 {
        let survival = self.survival(t);
        if survival > 0.0 {
            self.density(t) / survival
        } else {
            f64::NAN
        }
    }

    fn survival(&self, t: f64) -> f64 {
        self.model
            .cumulative_absorption(t)
            .map(|absorbed| (1.0 - absorbed).clamp(0.0, 1.0))
            .unwrap_or(f64::NAN)
    }

    fn density(&self, t: f64) -> f64 {
        self.model.absorption_density(t).unwrap_or(f64::NAN)
    }

    fn breakpoints(&self) -> Vec<f64> {
        self.model.piece_starts()[1..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn progression() -> MultiStateModel {
        MultiStateModel::illness_death(0.02, 0.05, 0.1).unwrap()
    }

    #[test]
    fn occupancy_is_a_probability_vector() {
        let model = progression();
        for t in [0.0, 0.5, 10.0, 100.0, 5000.0] {
            let p = model.occupancy(t).unwrap();
            assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
            assert!(p.iter().all(|&x| x >= -1e-14));
        }
    }

    #[test]
    fn overall_survival_matches_closed_form() {
        let (h, r, h2): (f64, f64, f64) = (0.02, 0.05, 0.1);
        let model = progression();
        let curve = MultiStateCurve::overall(&model);
        for t in [1.0, 7.5, 40.0] {
            let stay = (-(h + r) * t).exp();
            let progressed = r / (h + r - h2) * ((-h2 * t).exp() - stay);
            assert_abs_diff_eq!(curve.survival(t), stay + progressed, epsilon = 1e-12);
            // Death density from both living states.
            let density = stay * h + progressed * h2;
            assert_abs_diff_eq!(curve.density(t), density, epsilon = 1e-12);
        }
    }

    #[test]
    fn progression_free_survival_is_initial_occupancy() {
        let model = progression();
        let pfs = MultiStateCurve::progression_free(&model).unwrap();
        for t in [0.3, 12.0, 60.0] {
            assert_abs_diff_eq!(pfs.survival(t), (-0.07f64 * t).exp(), epsilon = 1e-12);
            assert_abs_diff_eq!(pfs.hazard(t), 0.07, epsilon = 1e-10);
        }
    }

    #[test]
    fn absorption_is_monotone_and_reaches_one() {
        let model = progression();
        let mut previous = 0.0;
        for i in 0..60 {
            let t = i as f64 * 10.0;
            let absorbed = model.cumulative_absorption(t).unwrap();
            assert!(absorbed + 1e-14 >= previous);
            previous = absorbed;
        }
        assert_abs_diff_eq!(model.cumulative_absorption(1e4).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn piecewise_generators_chain_exactly() {
        let q1 = array![[0.0, 0.1], [0.0, 0.0]];
        let q2 = array![[0.0, 0.4], [0.0, 0.0]];
        let model =
            MultiStateModel::new(&[0.0, 2.0], vec![q1, q2], array![1.0, 0.0], &[1]).unwrap();
        let expected = (-(0.1 * 2.0 + 0.4 * 3.0f64)).exp();
        assert_abs_diff_eq!(model.occupancy(5.0).unwrap()[0], expected, epsilon = 1e-13);
    }

    #[test]
    fn rejects_malformed_generators() {
        let bad = array![[0.0, -0.1], [0.0, 0.0]];
        assert!(matches!(
            MultiStateModel::new(&[0.0], vec![bad], array![1.0, 0.0], &[1]).unwrap_err(),
            MultiStateError::InvalidIntensity { .. }
        ));
        let leaky = array![[0.0, 0.1], [0.2, 0.0]];
        assert!(matches!(
            MultiStateModel::new(&[0.0], vec![leaky], array![1.0, 0.0], &[1]).unwrap_err(),
            MultiStateError::AbsorbingWithExit { state: 1, .. }
        ));
        let wrong_diagonal = array![[-0.5, 0.1], [0.0, 0.0]];
        assert!(matches!(
            MultiStateModel::new(&[0.0], vec![wrong_diagonal], array![1.0, 0.0], &[1])
                .unwrap_err(),
            MultiStateError::InvalidDiagonal { .. }
        ));
        let q = array![[0.0, 0.1], [0.0, 0.0]];
        assert!(matches!(
            MultiStateModel::new(&[0.0], vec![q], array![0.6, 0.6], &[1]).unwrap_err(),
            MultiStateError::InvalidInitial { .. }
        ));
    }

    #[test]
    fn sampled_paths_end_in_absorbing_state() {
        let model = progression();
        let mut rng = StdRng::seed_from_u64(2024);
        let paths = model.sample_paths(500, &mut rng, false).unwrap();
        for path in &paths {
            assert_eq!(path.absorbed_in, Some(2));
            assert!(path.absorption_time.is_finite());
            if let Some(t_prog) = path.entry_time(1) {
                assert!(t_prog < path.absorption_time);
            }
        }
        let progressed = paths.iter().filter(|p| p.entry_time(1).is_some()).count() as f64;
        // P(progression before death) = r / (r + h) = 5/7.
        assert!((progressed / 500.0 - 5.0 / 7.0).abs() < 0.06);
    }

    #[test]
    fn discrete_paths_resolve_ties_towards_absorption() {
        let model = progression();
        let mut rng = StdRng::seed_from_u64(99);
        for path in model.sample_paths(300, &mut rng, true).unwrap() {
            assert_eq!(path.absorption_time.fract(), 0.0);
            if let Some(t_prog) = path.entry_time(1) {
                assert!(t_prog < path.absorption_time);
            }
        }
    }
}
