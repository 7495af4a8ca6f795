use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nphsim::design::{DesignRow, DesignTable};
use nphsim::linalg::expm;
use nphsim::multistate::MultiStateModel;
use nphsim::scenarios::ScenarioFamily;
use nphsim::truth::{EndpointSelection, TruthOptions, true_summary_statistics};

fn progression_design(rows: usize) -> DesignTable {
    DesignTable::from_rows(
        (0..rows)
            .map(|i| {
                DesignRow::new()
                    .with("n_ctrl", 200.0)
                    .with("n_trt", 200.0)
                    .with("hazard_ctrl", 0.02)
                    .with("hazard_trt", 0.01 + 0.001 * i as f64)
                    .with("prog_rate_ctrl", 0.05)
                    .with("prog_rate_trt", 0.03)
                    .with("hazard_after_prog", 0.08)
            })
            .collect(),
    )
}

fn benchmark_truth(c: &mut Criterion) {
    let options = TruthOptions {
        cutoffs: vec![12.0, 24.0],
        milestones: vec![12.0],
        endpoints: EndpointSelection::Both,
        strict: false,
    };

    let mut group = c.benchmark_group("true_summary_statistics");
    group.sample_size(10);
    for rows in [1_usize, 8, 32] {
        let design = progression_design(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("progression", rows), &design, |b, input| {
            b.iter(|| {
                let table = true_summary_statistics(black_box(input), ScenarioFamily::Progression, &options)
                    .expect("truth table");
                black_box(table);
            });
        });
    }
    group.finish();
}

fn benchmark_expm(c: &mut Criterion) {
    let model = MultiStateModel::illness_death(0.02, 0.05, 0.08).expect("model");
    let mut group = c.benchmark_group("expm");
    for t in [1.0_f64, 24.0, 240.0] {
        let scaled = model.generator_at(0.0) * t;
        group.bench_with_input(BenchmarkId::new("illness_death", t), &scaled, |b, input| {
            b.iter(|| {
                let transition = expm(black_box(input)).expect("matrix exponential");
                black_box(transition);
            });
        });
    }
    group.finish();
}

criterion_group!(truth_benchmark, benchmark_truth, benchmark_expm);
criterion_main!(truth_benchmark);
