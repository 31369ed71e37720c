//! Integration test: the kernel over a full preset, in both precisions.

use electromag_core::compare::{write_report_file, ResultComparator};
use electromag_core::init::{charge_extent, init_field_lines, init_point_charges, SeedPolicy};
use electromag_core::integrator::{nominal_flops, FieldIntegrator, IntegratorConfig, LineStats};
use electromag_core::params::SimulationParams;
use electromag_core::{FieldLines, Real, Vec3};
use tempfile::tempdir;

fn trace_preset<T: Real>(params: &SimulationParams, policy: SeedPolicy) -> (FieldLines<T>, LineStats) {
    let charges = init_point_charges::<T>(params.static_charges, policy);
    let mut lines = FieldLines::<T>::new(params.line_count(), params.steps).unwrap();
    init_field_lines(
        &mut lines,
        params.nx,
        params.ny,
        params.nz,
        charge_extent(params.static_charges),
        policy,
    )
    .unwrap();

    let integ = FieldIntegrator::new(&charges, &IntegratorConfig::default());
    let mut stats = LineStats::default();
    let mut out = vec![Vec3::zeros(); params.steps];
    for line in 0..lines.line_count() {
        stats.record(&integ.trace_line(lines.seed(line), &mut out));
        lines.write_line(line, &out);
    }
    (lines, stats)
}

#[test]
fn test_bogo_preset_traces_finite_lines() {
    let params = SimulationParams::preset("bogo").unwrap();
    let (lines, stats) = trace_preset::<f64>(&params, SeedPolicy::Deterministic);

    assert_eq!(lines.traced_count(), 256);
    assert!(lines.all_finite());
    assert_eq!(stats.lines, 256);
    assert!(nominal_flops(256, params.steps, params.static_charges) > 0);

    // Seeds survive integration.
    let seeded = {
        let mut l = FieldLines::<f64>::new(256, 2).unwrap();
        init_field_lines(&mut l, 16, 16, 1, charge_extent(50), SeedPolicy::Deterministic).unwrap();
        l
    };
    for line in [0, 17, 255] {
        assert_eq!(lines.seed(line), seeded.seed(line));
    }
}

#[test]
fn test_randomized_runs_are_reproducible() {
    let mut params = SimulationParams::preset("bogo").unwrap();
    params.steps = 50;
    let policy = SeedPolicy::Randomized { seed: 7 };
    let (a, _) = trace_preset::<f32>(&params, policy);
    let (b, _) = trace_preset::<f32>(&params, policy);
    let cmp = ResultComparator::new(0.0).compare(&a, &b).unwrap();
    assert!(cmp.is_clean());
    assert_eq!(cmp.lines_compared, 256);
}

#[test]
fn test_single_and_double_agree_early() {
    let mut params = SimulationParams::preset("bogo").unwrap();
    params.steps = 5;
    let (single, _) = trace_preset::<f32>(&params, SeedPolicy::Deterministic);
    let (double, _) = trace_preset::<f64>(&params, SeedPolicy::Deterministic);

    for line in 0..single.line_count() {
        for step in 0..params.steps {
            let s = single.get(step, line).cast::<f64>();
            let d = double.get(step, line);
            assert!(s.metric_distance(&d) < 1e-2, "line {} step {}", line, step);
        }
    }
}

#[test]
fn test_report_file_is_written() {
    let mut params = SimulationParams::preset("bogo").unwrap();
    params.steps = 20;
    let (a, _) = trace_preset::<f64>(&params, SeedPolicy::Deterministic);
    let mut b = a.clone();
    for step in 5..20 {
        b.set(step, 3, b.get(step, 3) + Vec3::new(1.0, 0.0, 0.0));
    }

    let cmp = ResultComparator::default().compare(&a, &b).unwrap();
    assert_eq!(cmp.records.len(), 1);

    let dir = tempdir().unwrap();
    let path = dir.path().join("reports").join("regression.txt");
    write_report_file(&cmp.records, &path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains(" good [3][4]"));
    assert!(text.contains(" bad  [3][5]"));
}
