use std::fs;
use std::process::Command;

use nphsim::design::DesignTable;
use tempfile::tempdir;

const DELAYED_DESIGN: &str = "n_ctrl,n_trt,delay,hazard_ctrl,hazard_trt,recruitment,followup\n\
100,100,0,0.0288811,0.0192541,12,36\n\
100,100,6,0.0288811,0.0192541,12,36\n";

#[test]
fn truth_command_appends_statistics() {
    let tmp = tempdir().expect("temporary directory");
    let design = tmp.path().join("design.csv");
    let out = tmp.path().join("truth.csv");
    fs::write(&design, DELAYED_DESIGN).expect("write design");

    let status = Command::new(env!("CARGO_BIN_EXE_nphsim"))
        .args(["truth", "--family", "delayed_effect", "--cutoff", "20", "--milestone", "12"])
        .arg("--design")
        .arg(&design)
        .arg("--out")
        .arg(&out)
        .status()
        .expect("run nphsim");
    assert!(status.success(), "CLI exited with status {status:?}");

    let table = DesignTable::from_path(&out).expect("read truth table");
    assert_eq!(table.len(), 2);
    let gahr = table.row(0).unwrap().get("gAHR_20").unwrap();
    assert!((gahr - 0.6667).abs() < 1e-3, "gAHR_20 = {gahr}");
    assert!(table.has_column("milestone_diff_12"));
}

#[test]
fn generate_command_writes_replicates() {
    let tmp = tempdir().expect("temporary directory");
    let design = tmp.path().join("design.csv");
    let out = tmp.path().join("data.csv");
    fs::write(&design, DELAYED_DESIGN).expect("write design");

    let status = Command::new(env!("CARGO_BIN_EXE_nphsim"))
        .args(["generate", "--family", "delayed-effect", "--row", "1"])
        .args(["--seed", "5", "--replicates", "3", "--target-events", "50"])
        .arg("--design")
        .arg(&design)
        .arg("--out")
        .arg(&out)
        .status()
        .expect("run nphsim");
    assert!(status.success(), "CLI exited with status {status:?}");

    let text = fs::read_to_string(&out).expect("read output");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("replicate,t,evt,trt,entry,t_ice,ice"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 600);
    for replicate in 0..3 {
        let events = rows
            .iter()
            .filter(|line| line.starts_with(&format!("{replicate},")))
            .filter(|line| line.split(',').nth(2) == Some("1"))
            .count();
        assert_eq!(events, 50);
    }
}

#[test]
fn unknown_family_is_rejected_with_accepted_values() {
    let tmp = tempdir().expect("temporary directory");
    let design = tmp.path().join("design.csv");
    fs::write(&design, DELAYED_DESIGN).expect("write design");

    let output = Command::new(env!("CARGO_BIN_EXE_nphsim"))
        .args(["truth", "--family", "cure-model"])
        .arg("--design")
        .arg(&design)
        .output()
        .expect("run nphsim");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown scenario family 'cure-model'"), "{stderr}");
    assert!(stderr.contains("delayed-effect"), "{stderr}");
}

#[test]
fn grid_command_builds_factorial_design() {
    let tmp = tempdir().expect("temporary directory");
    let config = tmp.path().join("grid.toml");
    let out = tmp.path().join("design.csv");
    fs::write(
        &config,
        "[[grid]]\nname = \"delay\"\nvalues = [0, 3, 6]\n\n[[grid]]\nname = \"n_trt\"\nvalues = [100, 200]\n",
    )
    .expect("write config");

    let status = Command::new(env!("CARGO_BIN_EXE_nphsim"))
        .arg("grid")
        .arg("--config")
        .arg(&config)
        .arg("--out")
        .arg(&out)
        .status()
        .expect("run nphsim");
    assert!(status.success());

    let table = DesignTable::from_path(&out).expect("read grid");
    assert_eq!(table.len(), 6);
    assert_eq!(table.row(5).unwrap().get("delay"), Some(6.0));
    assert_eq!(table.row(5).unwrap().get("n_trt"), Some(200.0));
}
