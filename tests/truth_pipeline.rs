use approx::{assert_abs_diff_eq, assert_relative_eq};
use nphsim::design::{DesignRow, DesignTable};
use nphsim::rates::{
    calibrate_censoring, calibrate_ph_power, calibrate_progression, progression_proportion,
};
use nphsim::scenarios::{Scenario, ScenarioFamily};
use nphsim::truth::{EndpointSelection, TruthError, TruthOptions, true_summary_statistics};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn proportional_design() -> DesignTable {
    DesignTable::from_rows(vec![
        DesignRow::new()
            .with("n_ctrl", 150.0)
            .with("n_trt", 150.0)
            .with("delay", 0.0)
            .with("hazard_ctrl", 2f64.ln() / 24.0)
            .with("hazard_trt", 2f64.ln() / 36.0),
        DesignRow::new()
            .with("n_ctrl", 150.0)
            .with("n_trt", 150.0)
            .with("delay", 6.0)
            .with("hazard_ctrl", 2f64.ln() / 24.0)
            .with("hazard_trt", 2f64.ln() / 36.0),
    ])
}

fn progression_row() -> DesignRow {
    DesignRow::new()
        .with("n_ctrl", 200.0)
        .with("n_trt", 200.0)
        .with("hazard_ctrl", 0.02)
        .with("hazard_trt", 0.015)
        .with("hazard_after_prog", 0.08)
        .with("recruitment", 12.0)
        .with("followup", 36.0)
}

#[test]
fn proportional_hazards_rows_report_exact_ratio() {
    let options = TruthOptions {
        cutoffs: vec![20.0],
        milestones: vec![12.0],
        ..TruthOptions::default()
    };
    let table = true_summary_statistics(&proportional_design(), ScenarioFamily::DelayedEffect, &options)
        .unwrap();
    assert_eq!(table.len(), 2);

    let ph = table.row(0).unwrap();
    assert_relative_eq!(ph.get("median_surv_ctrl").unwrap(), 24.0, max_relative = 1e-8);
    assert_relative_eq!(ph.get("median_surv_trt").unwrap(), 36.0, max_relative = 1e-8);
    for column in ["AHR_20", "gAHR_20", "AHRoc_20", "gAHRoc_20"] {
        assert_relative_eq!(ph.get(column).unwrap(), 2.0 / 3.0, max_relative = 1e-6);
    }
    assert_relative_eq!(
        ph.get("milestone_surv_ctrl_12").unwrap(),
        0.5f64.powf(0.5),
        max_relative = 1e-12
    );

    let delayed = table.row(1).unwrap();
    let gahr = delayed.get("gAHR_20").unwrap();
    assert!(gahr > 2.0 / 3.0 && gahr < 1.0, "delayed gAHR {gahr}");
    assert!(delayed.get("rmst_diff_20").unwrap() > 0.0);
    assert!(delayed.get("rmst_diff_20").unwrap() < ph.get("rmst_diff_20").unwrap());
}

#[test]
fn automatic_cutoff_is_reported() {
    let table = true_summary_statistics(
        &proportional_design(),
        ScenarioFamily::DelayedEffect,
        &TruthOptions::default(),
    )
    .unwrap();
    let row = table.row(0).unwrap();
    let cutoff = row.get("cutoff_auto").unwrap();
    let expected = -(1e-4f64).ln() / (2f64.ln() / 24.0);
    assert_relative_eq!(cutoff, expected, max_relative = 1e-6);
    assert!(row.contains("gAHR_auto"));
}

#[test]
fn progression_free_statistics_need_multistate_family() {
    let options = TruthOptions {
        cutoffs: vec![12.0],
        endpoints: EndpointSelection::Pfs,
        ..TruthOptions::default()
    };
    let err = true_summary_statistics(&proportional_design(), ScenarioFamily::DelayedEffect, &options)
        .unwrap_err();
    assert!(matches!(err, TruthError::Family(_)));
}

#[test]
fn both_endpoints_for_progression_scenarios() {
    let design = DesignTable::from_rows(vec![
        progression_row()
            .with("prog_rate_ctrl", 0.05)
            .with("prog_rate_trt", 0.03),
    ]);
    let options = TruthOptions {
        cutoffs: vec![24.0],
        endpoints: EndpointSelection::Both,
        ..TruthOptions::default()
    };
    let table = true_summary_statistics(&design, ScenarioFamily::Progression, &options).unwrap();
    let row = table.row(0).unwrap();
    let pfs_ctrl = row.get("pfs_median_surv_ctrl").unwrap();
    assert_relative_eq!(pfs_ctrl, 2f64.ln() / 0.07, max_relative = 1e-8);
    assert!(row.get("median_surv_ctrl").unwrap() > pfs_ctrl);
    assert!(row.get("pfs_rmst_diff_24").unwrap() > 0.0);
}

#[test]
fn calibrated_progression_rates_reproduce_targets() {
    let design = DesignTable::from_rows(vec![
        progression_row()
            .with("prog_prop_ctrl", 0.5)
            .with("prog_prop_trt", 0.3),
    ]);
    let table = calibrate_progression(&design).unwrap();
    let row = table.row(0).unwrap();
    for (arm_hazard, rate, target) in [
        ("hazard_ctrl", "prog_rate_ctrl", 0.5),
        ("hazard_trt", "prog_rate_trt", 0.3),
    ] {
        let proportion = progression_proportion(
            row.get(arm_hazard).unwrap(),
            row.get(rate).unwrap(),
            0.08,
            36.0,
        )
        .unwrap();
        assert_abs_diff_eq!(proportion, target, epsilon = 1e-6);
    }
}

#[test]
fn calibrated_withdrawal_matches_simulated_censoring() {
    let mut design_row = progression_row()
        .with("prog_rate_ctrl", 0.05)
        .with("prog_rate_trt", 0.03)
        .with("censoring_prop", 0.2)
        .with("followup", f64::INFINITY);
    design_row.set("n_ctrl", 3000.0);
    design_row.set("n_trt", 3000.0);
    let table = calibrate_censoring(&DesignTable::from_rows(vec![design_row]), ScenarioFamily::Progression)
        .unwrap();
    let row = table.row(0).unwrap();
    assert!(row.get("random_withdrawal").unwrap() > 0.0);

    let scenario = Scenario::from_row(ScenarioFamily::Progression, row).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let data = scenario.generate(&mut rng, false).unwrap();
    let censored = data.len() - data.n_events();
    let share = censored as f64 / data.len() as f64;
    assert_abs_diff_eq!(share, 0.2, epsilon = 0.02);
}

#[test]
fn zero_power_keeps_control_hazard() {
    let design = DesignTable::from_rows(vec![
        progression_row()
            .with("prog_rate_ctrl", 0.04)
            .with("prog_rate_trt", 0.04)
            .with("target_power_ph", 0.0),
    ]);
    let table = calibrate_ph_power(&design, 0.05).unwrap();
    let row = table.row(0).unwrap();
    assert_eq!(row.get("hr_ph"), Some(1.0));
    assert_eq!(row.get("hazard_trt"), Some(0.02));
}

#[test]
fn higher_power_needs_stronger_effect() {
    let rows = [0.5, 0.8, 0.9]
        .iter()
        .map(|&power| {
            progression_row()
                .with("prog_rate_ctrl", 0.04)
                .with("prog_rate_trt", 0.04)
                .with("target_power_ph", power)
        })
        .collect();
    let table = calibrate_ph_power(&DesignTable::from_rows(rows), 0.05).unwrap();
    let ratios: Vec<f64> = table.rows().iter().map(|r| r.get("hr_ph").unwrap()).collect();
    assert!(ratios.windows(2).all(|w| w[1] < w[0]), "{ratios:?}");
    assert!(
        table
            .rows()
            .iter()
            .all(|r| r.get("hazard_trt").unwrap() < 0.02)
    );
}

fn delayed_row(hazard_trt: f64) -> DesignRow {
    DesignRow::new()
        .with("n_ctrl", 100.0)
        .with("n_trt", 100.0)
        .with("delay", 6.0)
        .with("hazard_ctrl", 0.03)
        .with("hazard_trt", hazard_trt)
}

#[test]
fn numerical_failures_stay_in_their_row_and_statistic() {
    let design = DesignTable::from_rows(vec![delayed_row(0.02), delayed_row(0.0)]);
    let options = TruthOptions {
        cutoffs: vec![20.0],
        ..TruthOptions::default()
    };
    let table = true_summary_statistics(&design, ScenarioFamily::DelayedEffect, &options).unwrap();

    let healthy = table.row(0).unwrap();
    for column in [
        "median_surv_trt",
        "rmst_diff_20",
        "AHR_20",
        "gAHR_20",
        "AHRoc_20",
        "gAHRoc_20",
    ] {
        assert!(healthy.get(column).unwrap().is_finite(), "{column}");
    }

    // Treatment survival plateaus at exp(-0.18) > 0.5, so no median exists.
    let cured = table.row(1).unwrap();
    assert!(cured.get("median_surv_trt").unwrap().is_nan());
    assert!(cured.get("median_surv_ctrl").unwrap().is_finite());
    assert!(cured.get("rmst_diff_20").unwrap() > 0.0);
    let ahr = cured.get("AHR_20").unwrap();
    let ahr_oc = cured.get("AHRoc_20").unwrap();
    assert!(ahr > 0.0 && ahr < healthy.get("AHR_20").unwrap(), "AHR {ahr}");
    assert!(ahr_oc > 0.0 && ahr_oc < 1.0, "AHRoc {ahr_oc}");
    assert_eq!(cured.get("gAHR_20"), Some(0.0));
    assert_eq!(cured.get("gAHRoc_20"), Some(0.0));

    let strict = TruthOptions {
        strict: true,
        ..options
    };
    match true_summary_statistics(&design, ScenarioFamily::DelayedEffect, &strict) {
        Err(TruthError::Numerical { row, statistic, .. }) => {
            assert_eq!(row, 1);
            assert_eq!(statistic, "median_surv_trt");
        }
        other => panic!("expected a numerical failure in row 1, got {other:?}"),
    }
}

#[test]
fn header_only_design_round_trips_its_header() {
    let design = DesignTable::read_csv("n_ctrl,n_trt,delay,hazard_ctrl,hazard_trt\n".as_bytes()).unwrap();
    let options = TruthOptions {
        cutoffs: vec![12.0],
        ..TruthOptions::default()
    };
    let table = true_summary_statistics(&design, ScenarioFamily::DelayedEffect, &options).unwrap();
    assert!(table.is_empty());
    let mut out = Vec::new();
    table.write_csv(&mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "n_ctrl,n_trt,delay,hazard_ctrl,hazard_trt\n");
}
