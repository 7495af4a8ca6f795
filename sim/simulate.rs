//! # Patient-Level Sampling and Censoring
//!
//! A replicate is produced in a fixed sequence of pure transformations:
//!
//! 1. [`generate`] draws every patient's event time (and intercurrent-event time, when the
//!    model tracks one) with all outcomes observed.
//! 2. [`apply_recruitment`] assigns calendar entry times uniformly over the recruitment window.
//! 3. [`apply_random_censoring`] censors at independent exponential withdrawal times.
//! 4. [`apply_admin_censoring`] censors at the administrative cutoff, measured in calendar time,
//!    so that a patient entering at `e` is followed for at most `cutoff - e`.
//!
//! Each step takes the dataset by value and returns the transformed one. [`CensoringPlan`]
//! applies the optional steps in that order.

use crate::hazard::{PiecewiseHazard, SurvivalMixture};
use crate::multistate::{MultiStateError, MultiStateModel};
use log::{debug, warn};
use rand::Rng;
use rand_distr::{Distribution, Exp, Uniform};
use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulateError {
    #[error("parameter '{name}' must be finite and non-negative, found {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("the number of events triggering the analysis must be positive")]
    ZeroEventTarget,
    #[error("multi-state sampling failed: {0}")]
    MultiState(#[from] MultiStateError),
    #[error("failed to write dataset: {0}")]
    Csv(#[from] csv::Error),
}

fn check_non_negative(name: &'static str, value: f64) -> Result<(), SimulateError> {
    if value.is_nan() || value < 0.0 {
        Err(SimulateError::InvalidParameter { name, value })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm {
    Control,
    Treatment,
}

impl Arm {
    /// Treatment indicator as written to disk.
    pub fn indicator(self) -> u8 {
        match self {
            Arm::Control => 0,
            Arm::Treatment => 1,
        }
    }
}

/// Secondary transition observed before the event, e.g. disease progression.
///
/// `time` is the earlier of the transition and the event (later, of censoring), and `observed`
/// is true only when the transition itself was seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intercurrent {
    pub time: f64,
    pub observed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatientRecord {
    pub arm: Arm,
    /// Follow-up time from entry to event or censoring.
    pub time: f64,
    pub event: bool,
    /// Calendar time of study entry.
    pub entry: f64,
    pub intercurrent: Option<Intercurrent>,
}

impl PatientRecord {
    fn censor_at(&mut self, limit: f64) {
        if self.time > limit {
            self.time = limit;
            self.event = false;
        }
        if let Some(ice) = self.intercurrent.as_mut() {
            if ice.time > limit {
                ice.time = limit;
                ice.observed = false;
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct DatasetRow {
    replicate: usize,
    t: f64,
    evt: u8,
    trt: u8,
    entry: f64,
    t_ice: Option<f64>,
    ice: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimulatedDataset {
    records: Vec<PatientRecord>,
}

impl SimulatedDataset {
    pub fn from_records(records: Vec<PatientRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[PatientRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PatientRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn n_events(&self) -> usize {
        self.records.iter().filter(|r| r.event).count()
    }

    pub fn arm(&self, arm: Arm) -> impl Iterator<Item = &PatientRecord> {
        self.records.iter().filter(move |r| r.arm == arm)
    }

    /// Writes one CSV row per patient, tagged with `replicate`.
    pub fn write_csv<W: io::Write>(
        &self,
        writer: &mut csv::Writer<W>,
        replicate: usize,
    ) -> Result<(), SimulateError> {
        for record in &self.records {
            writer.serialize(DatasetRow {
                replicate,
                t: record.time,
                evt: u8::from(record.event),
                trt: record.arm.indicator(),
                entry: record.entry,
                t_ice: record.intercurrent.map(|ice| ice.time),
                ice: record.intercurrent.map(|ice| u8::from(ice.observed)),
            })?;
        }
        Ok(())
    }
}

/// A per-arm event-time distribution that can be sampled patient by patient.
pub trait EventTimeModel: Sync {
    /// Event time and, for models with an intercurrent state, the intercurrent record.
    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<(f64, Option<Intercurrent>), SimulateError>;
}

impl EventTimeModel for PiecewiseHazard {
    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<(f64, Option<Intercurrent>), SimulateError> {
        Ok((self.sample_one(rng, discrete), None))
    }
}

impl EventTimeModel for SurvivalMixture {
    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<(f64, Option<Intercurrent>), SimulateError> {
        Ok((self.sample_one(rng, discrete), None))
    }
}

impl EventTimeModel for MultiStateModel {
    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        discrete: bool,
    ) -> Result<(f64, Option<Intercurrent>), SimulateError> {
        let path = self.sample_path(rng, discrete)?;
        let event = path.absorption_time;
        let intercurrent = self.intercurrent_state().map(|state| match path.entry_time(state) {
            Some(entered) if entered < event => Intercurrent {
                time: entered,
                observed: true,
            },
            _ => Intercurrent {
                time: event,
                observed: false,
            },
        });
        Ok((event, intercurrent))
    }
}

fn draw_arm<M: EventTimeModel, R: Rng + ?Sized>(
    records: &mut Vec<PatientRecord>,
    arm: Arm,
    n: usize,
    model: &M,
    rng: &mut R,
    discrete: bool,
) -> Result<(), SimulateError> {
    for _ in 0..n {
        let (time, intercurrent) = model.draw(rng, discrete)?;
        records.push(PatientRecord {
            arm,
            time,
            event: true,
            entry: 0.0,
            intercurrent,
        });
    }
    Ok(())
}

/// Draws `n_ctrl` control patients followed by `n_trt` treatment patients, all uncensored.
pub fn generate<C, T, R>(
    n_ctrl: usize,
    control: &C,
    n_trt: usize,
    treatment: &T,
    rng: &mut R,
    discrete: bool,
) -> Result<SimulatedDataset, SimulateError>
where
    C: EventTimeModel,
    T: EventTimeModel,
    R: Rng + ?Sized,
{
    let mut records = Vec::with_capacity(n_ctrl + n_trt);
    draw_arm(&mut records, Arm::Control, n_ctrl, control, rng, discrete)?;
    draw_arm(&mut records, Arm::Treatment, n_trt, treatment, rng, discrete)?;
    Ok(SimulatedDataset { records })
}

/// Assigns each patient a calendar entry time uniform on `[0, window]`.
pub fn apply_recruitment<R: Rng + ?Sized>(
    data: SimulatedDataset,
    window: f64,
    rng: &mut R,
) -> Result<SimulatedDataset, SimulateError> {
    check_non_negative("recruitment", window)?;
    if !window.is_finite() {
        return Err(SimulateError::InvalidParameter {
            name: "recruitment",
            value: window,
        });
    }
    let mut records = data.records;
    if window == 0.0 {
        for record in records.iter_mut() {
            record.entry = 0.0;
        }
        return Ok(SimulatedDataset { records });
    }
    let entry = Uniform::new_inclusive(0.0, window);
    for record in records.iter_mut() {
        record.entry = entry.sample(rng);
    }
    Ok(SimulatedDataset { records })
}

/// Censors each patient at an independent `Exp(rate)` withdrawal time. A zero rate leaves the
/// data untouched and draws nothing.
pub fn apply_random_censoring<R: Rng + ?Sized>(
    data: SimulatedDataset,
    rate: f64,
    rng: &mut R,
) -> Result<SimulatedDataset, SimulateError> {
    check_non_negative("random_withdrawal", rate)?;
    if rate == 0.0 {
        return Ok(data);
    }
    let withdrawal = Exp::new(rate).map_err(|_| SimulateError::InvalidParameter {
        name: "random_withdrawal",
        value: rate,
    })?;
    let mut records = data.records;
    for record in records.iter_mut() {
        let w: f64 = withdrawal.sample(rng);
        record.censor_at(w);
    }
    Ok(SimulatedDataset { records })
}

/// Censors at calendar time `cutoff`: follow-up is capped at `max(cutoff - entry, 0)`.
/// Applying the same cutoff again changes nothing.
pub fn apply_admin_censoring(
    data: SimulatedDataset,
    cutoff: f64,
) -> Result<SimulatedDataset, SimulateError> {
    check_non_negative("followup", cutoff)?;
    let mut records = data.records;
    if cutoff.is_infinite() {
        return Ok(SimulatedDataset { records });
    }
    for record in records.iter_mut() {
        // Compared in calendar time so an event falling exactly on the cutoff stays observed.
        let limit = (cutoff - record.entry).max(0.0);
        if record.entry + record.time > cutoff {
            record.time = limit;
            record.event = false;
        }
        if let Some(ice) = record.intercurrent.as_mut() {
            if record.entry + ice.time > cutoff {
                ice.time = limit;
                ice.observed = false;
            }
        }
    }
    Ok(SimulatedDataset { records })
}

/// Calendar time at which the `n_events`-th event is observed, if that many events occur.
pub fn event_driven_cutoff(data: &SimulatedDataset, n_events: usize) -> Option<f64> {
    if n_events == 0 {
        return None;
    }
    let mut calendar: Vec<f64> = data
        .records
        .iter()
        .filter(|r| r.event)
        .map(|r| r.entry + r.time)
        .collect();
    if calendar.len() < n_events {
        return None;
    }
    calendar.sort_by(f64::total_cmp);
    Some(calendar[n_events - 1])
}

/// Administrative censoring at the calendar time of the `n_events`-th event. Returns the
/// censored data together with the cutoff used (`+∞` when too few events occur, in which case
/// nothing is censored).
pub fn apply_event_driven_cutoff(
    data: SimulatedDataset,
    n_events: usize,
) -> Result<(SimulatedDataset, f64), SimulateError> {
    if n_events == 0 {
        return Err(SimulateError::ZeroEventTarget);
    }
    match event_driven_cutoff(&data, n_events) {
        Some(cutoff) => {
            debug!("event-driven analysis after {n_events} events at calendar time {cutoff}");
            Ok((apply_admin_censoring(data, cutoff)?, cutoff))
        }
        None => {
            warn!(
                "only {} events observed, fewer than the {n_events} required; no administrative censoring applied",
                data.n_events()
            );
            Ok((data, f64::INFINITY))
        }
    }
}

/// Optional censoring steps applied in the order recruitment, random withdrawal, then
/// administrative cutoff. Absent steps are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CensoringPlan {
    pub recruitment: Option<f64>,
    pub random_withdrawal: Option<f64>,
    pub followup: Option<f64>,
    /// Analysis after this many events, applied after `followup`.
    pub target_events: Option<usize>,
}

impl CensoringPlan {
    pub fn apply<R: Rng + ?Sized>(
        &self,
        data: SimulatedDataset,
        rng: &mut R,
    ) -> Result<SimulatedDataset, SimulateError> {
        let mut data = data;
        if let Some(window) = self.recruitment {
            data = apply_recruitment(data, window, rng)?;
        }
        if let Some(rate) = self.random_withdrawal {
            data = apply_random_censoring(data, rate, rng)?;
        }
        if let Some(cutoff) = self.followup {
            data = apply_admin_censoring(data, cutoff)?;
        }
        if let Some(n_events) = self.target_events {
            data = apply_event_driven_cutoff(data, n_events)?.0;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::SurvivalCurve;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn exponential_trial(rng: &mut StdRng) -> SimulatedDataset {
        let ctrl = PiecewiseHazard::constant(2f64.ln() / 24.0).unwrap();
        let trt = PiecewiseHazard::new(&[0.0, 6.0], &[2f64.ln() / 24.0, 2f64.ln() / 36.0]).unwrap();
        generate(150, &ctrl, 100, &trt, rng, false).unwrap()
    }

    #[test]
    fn generated_data_is_uncensored_and_tagged() {
        let mut rng = StdRng::seed_from_u64(1);
        let data = exponential_trial(&mut rng);
        assert_eq!(data.len(), 250);
        assert_eq!(data.n_events(), 250);
        assert_eq!(data.arm(Arm::Control).count(), 150);
        assert_eq!(data.arm(Arm::Treatment).count(), 100);
        assert!(data.records().iter().all(|r| r.entry == 0.0 && r.intercurrent.is_none()));
    }

    #[test]
    fn zero_withdrawal_and_infinite_cutoff_censor_nothing() {
        let mut rng = StdRng::seed_from_u64(2);
        let data = exponential_trial(&mut rng);
        let data = apply_random_censoring(data, 0.0, &mut rng).unwrap();
        let data = apply_admin_censoring(data, f64::INFINITY).unwrap();
        assert!(data.records().iter().all(|r| r.event));
    }

    #[test]
    fn admin_censoring_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(3);
        let data = apply_recruitment(exponential_trial(&mut rng), 12.0, &mut rng).unwrap();
        let once = apply_admin_censoring(data, 30.0).unwrap();
        let twice = apply_admin_censoring(once.clone(), 30.0).unwrap();
        assert_eq!(once, twice);
        for record in once.records() {
            assert!(record.entry + record.time <= 30.0 + 1e-12);
        }
    }

    #[test]
    fn admin_censoring_caps_at_calendar_cutoff() {
        let record = PatientRecord {
            arm: Arm::Control,
            time: 20.0,
            event: true,
            entry: 15.0,
            intercurrent: Some(Intercurrent {
                time: 5.0,
                observed: true,
            }),
        };
        let data = SimulatedDataset::from_records(vec![record]);
        let censored = apply_admin_censoring(data, 25.0).unwrap();
        let r = censored.records()[0];
        assert_eq!(r.time, 10.0);
        assert!(!r.event);
        assert_eq!(r.intercurrent, Some(Intercurrent { time: 5.0, observed: true }));

        let late = PatientRecord { entry: 40.0, ..record };
        let censored = apply_admin_censoring(SimulatedDataset::from_records(vec![late]), 25.0).unwrap();
        assert_eq!(censored.records()[0].time, 0.0);
    }

    #[test]
    fn random_censoring_rate_matches_theory() {
        // With exponential events at rate a and withdrawal at rate b, P(censored) = b / (a + b).
        let model = PiecewiseHazard::constant(0.1).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let data = generate(4000, &model, 0, &model, &mut rng, false).unwrap();
        let data = apply_random_censoring(data, 0.05, &mut rng).unwrap();
        let censored = data.len() - data.n_events();
        assert_abs_diff_eq!(censored as f64 / 4000.0, 1.0 / 3.0, epsilon = 0.03);
    }

    #[test]
    fn recruitment_entries_lie_in_window() {
        let mut rng = StdRng::seed_from_u64(5);
        let data = apply_recruitment(exponential_trial(&mut rng), 18.0, &mut rng).unwrap();
        assert!(data.records().iter().all(|r| (0.0..=18.0).contains(&r.entry)));
        assert!(apply_recruitment(data, -1.0, &mut rng).is_err());
    }

    #[test]
    fn event_driven_cutoff_stops_at_target_event() {
        let mut rng = StdRng::seed_from_u64(6);
        let data = apply_recruitment(exponential_trial(&mut rng), 12.0, &mut rng).unwrap();
        let (censored, cutoff) = apply_event_driven_cutoff(data, 100).unwrap();
        assert!(cutoff.is_finite());
        assert_eq!(censored.n_events(), 100);

        let (untouched, cutoff) = apply_event_driven_cutoff(censored.clone(), 1000).unwrap();
        assert!(cutoff.is_infinite());
        assert_eq!(untouched, censored);
        assert!(matches!(
            apply_event_driven_cutoff(untouched, 0),
            Err(SimulateError::ZeroEventTarget)
        ));
    }

    #[test]
    fn progression_records_precede_events() {
        let model = MultiStateModel::illness_death(0.02, 0.05, 0.1).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let data = generate(300, &model, 300, &model, &mut rng, false).unwrap();
        for record in data.records() {
            let ice = record.intercurrent.unwrap();
            assert!(ice.time <= record.time);
            if !ice.observed {
                assert_eq!(ice.time, record.time);
            }
        }
        let plan = CensoringPlan {
            recruitment: Some(10.0),
            random_withdrawal: Some(0.01),
            followup: Some(40.0),
            target_events: None,
        };
        let censored = plan.apply(data, &mut rng).unwrap();
        for record in censored.records() {
            let ice = record.intercurrent.unwrap();
            assert!(ice.time <= record.time + 1e-12);
            assert!(record.entry + record.time <= 40.0 + 1e-12);
        }
    }

    #[test]
    fn empirical_median_tracks_model_median() {
        let model = PiecewiseHazard::new(&[0.0, 3.0], &[0.05, 0.2]).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let mut times = model.sample(20_001, &mut rng, false);
        times.sort_by(f64::total_cmp);
        let median = model.quantile(0.5).unwrap();
        assert_abs_diff_eq!(times[10_000], median, epsilon = 0.15);
    }

    #[test]
    fn writes_csv_with_intercurrent_columns() {
        let record = PatientRecord {
            arm: Arm::Treatment,
            time: 4.5,
            event: false,
            entry: 1.0,
            intercurrent: Some(Intercurrent {
                time: 2.0,
                observed: true,
            }),
        };
        let data = SimulatedDataset::from_records(vec![record]);
        let mut writer = csv::Writer::from_writer(Vec::new());
        data.write_csv(&mut writer, 3).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text, "replicate,t,evt,trt,entry,t_ice,ice\n3,4.5,0,1,1.0,2.0,1\n");
    }
}
