//! Job execution: set up the problem, run it on the selected devices,
//! optionally cross-check against the CPU, and write the outputs.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use electromag_compute::{
    build_functors, BackendSelection, DeviceCatalog, FunctorScalar, Orchestrator,
    PartitionStatus, RunSummary,
};
use electromag_core::compare::{write_report_file, ResultComparator};
use electromag_core::init::{charge_extent, init_field_lines, init_point_charges};
use electromag_core::integrator::IntegratorConfig;
use electromag_core::perf::{AggregatePerf, PerformanceSample};
use electromag_core::{FieldLines, PointCharge, Precision};

use crate::config::{DevicesConfig, JobConfig};

const PROGRESS_POLL: Duration = Duration::from_millis(250);

/// One partition in the JSON summary.
#[derive(Debug, Serialize)]
pub struct PartitionJson {
    pub device: String,
    pub class: String,
    pub start: usize,
    pub end: usize,
    pub status: String,
    pub lines_traced: usize,
    pub kernel_s: f64,
    pub gflops: f64,
    pub errors: Vec<String>,
    pub phases: Vec<PerformanceSample>,
}

/// One orchestrated run in the JSON summary.
#[derive(Debug, Serialize)]
pub struct BackendReport {
    pub label: String,
    pub elapsed_s: f64,
    pub kernel_s: f64,
    pub total_flops: u64,
    pub gflops: f64,
    pub lines_traced: usize,
    /// Half-open `[start, end)` line ranges nobody delivered.
    pub missing: Vec<[usize; 2]>,
    pub partitions: Vec<PartitionJson>,
}

impl BackendReport {
    fn from_summary(label: &str, summary: &RunSummary) -> Self {
        Self {
            label: label.to_string(),
            elapsed_s: summary.elapsed.as_secs_f64(),
            kernel_s: summary.kernel_elapsed.as_secs_f64(),
            total_flops: summary.total_flops,
            gflops: summary.gflops,
            lines_traced: summary.lines_traced(),
            missing: summary.missing.iter().map(|r| [r.start, r.end]).collect(),
            partitions: summary
                .partitions
                .iter()
                .map(|p| PartitionJson {
                    device: p.device.clone(),
                    class: p.class.to_string(),
                    start: p.range.start,
                    end: p.range.end,
                    status: status_name(p.status).to_string(),
                    lines_traced: p.lines_traced,
                    kernel_s: p.kernel_elapsed.as_secs_f64(),
                    gflops: p.gflops,
                    errors: p.errors.clone(),
                    phases: p.samples.clone(),
                })
                .collect(),
        }
    }
}

/// Everything a job produced, as written to `summary.json`.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub preset: String,
    pub lines: usize,
    pub steps: usize,
    pub charges: usize,
    pub precision: Precision,
    pub runs: Vec<BackendReport>,
    /// CPU kernel time over the selected backend's kernel time.
    pub speedup: Option<f64>,
    pub lines_compared: Option<usize>,
    pub divergent_lines: Option<usize>,
}

fn status_name(status: PartitionStatus) -> &'static str {
    match status {
        PartitionStatus::Completed => "completed",
        PartitionStatus::Partial => "partial",
        PartitionStatus::Lost => "lost",
    }
}

/// Run a job and write its outputs under `output_dir`.
pub fn run_job(job: &JobConfig, output_dir: &Path) -> Result<JobSummary> {
    let summary = match job.simulation.precision {
        Precision::Single => run_typed::<f32>(job, output_dir)?,
        Precision::Double => run_typed::<f64>(job, output_dir)?,
    };

    if job.output.save_summary {
        write_summary_json(&summary, &output_dir.join("summary.json"))?;
    }
    Ok(summary)
}

fn run_typed<T: FunctorScalar>(job: &JobConfig, output_dir: &Path) -> Result<JobSummary> {
    let params = job.simulation.params()?;
    let config = job
        .curvature
        .integrator_config(job.simulation.resolution);
    let selection = job.devices.selection()?;
    let (charge_policy, seed_policy) = job.simulation.policies();

    println!(
        "Preset '{}': {} x {} x {} lines, {} steps, {} charges, {} precision",
        params.name,
        params.nx,
        params.ny,
        params.nz,
        params.steps,
        params.static_charges,
        job.simulation.precision
    );
    println!(
        "Field line buffer: {:.1} MB",
        (params.line_count() * params.steps * 3 * job.simulation.precision.bytes()) as f64
            / (1024.0 * 1024.0)
    );

    let charges: Arc<[PointCharge<T>]> =
        init_point_charges::<T>(params.static_charges, charge_policy).into();
    let mut seeded = FieldLines::<T>::new(params.line_count(), params.steps)
        .context("cannot allocate the field line buffer")?;
    init_field_lines(
        &mut seeded,
        params.nx,
        params.ny,
        params.nz,
        charge_extent(params.static_charges),
        seed_policy,
    )?;

    let catalog = DeviceCatalog::system();
    catalog.scan();
    log::info!("{} device(s) in the catalog", catalog.device_count());

    let mut runs = Vec::new();
    let mut lines = seeded.clone();
    let primary = execute(
        &format!("{} run", selection),
        &catalog,
        selection,
        &job.devices,
        &charges,
        config,
        &mut lines,
    )?;

    let mut speedup = None;
    let mut lines_compared = None;
    let mut divergent_lines = None;

    if job.compare.enabled {
        if selection == BackendSelection::Cpu {
            log::warn!("comparison requested but the selected backend is already the CPU");
        }
        let mut reference = seeded;
        let cpu = execute(
            "CPU reference",
            &catalog,
            BackendSelection::Cpu,
            &job.devices,
            &charges,
            config,
            &mut reference,
        )?;

        let cmp = ResultComparator::new(job.compare.threshold)
            .compare(&lines, &reference)
            .context("comparison failed")?;
        println!(
            "\nCompared {} lines ({} skipped): {} diverge beyond {}",
            cmp.lines_compared,
            cmp.lines_skipped,
            cmp.records.len(),
            job.compare.threshold
        );
        let report_path = output_dir.join(&job.compare.report);
        write_report_file(&cmp.records, &report_path)?;
        println!("Regression report written to: {}", report_path.display());

        if primary.kernel_s > 0.0 {
            let s = cpu.kernel_s / primary.kernel_s;
            println!("Speedup over CPU: {:.2}x", s);
            speedup = Some(s);
        }
        lines_compared = Some(cmp.lines_compared);
        divergent_lines = Some(cmp.records.len());
        runs.push(primary);
        runs.push(cpu);
    } else {
        runs.push(primary);
    }

    Ok(JobSummary {
        preset: params.name.clone(),
        lines: params.line_count(),
        steps: params.steps,
        charges: params.static_charges,
        precision: job.simulation.precision,
        runs,
        speedup,
        lines_compared,
        divergent_lines,
    })
}

/// One orchestrated run with a console progress monitor.
fn execute<T: FunctorScalar>(
    label: &str,
    catalog: &DeviceCatalog,
    selection: BackendSelection,
    devices: &DevicesConfig,
    charges: &Arc<[PointCharge<T>]>,
    config: IntegratorConfig,
    lines: &mut FieldLines<T>,
) -> Result<BackendReport> {
    println!("\n{}", label);
    let plan = build_functors::<T>(
        catalog,
        selection,
        &devices.platform,
        lines.line_count(),
        devices.cpu_threads,
    )?;
    for entry in &plan.entries {
        let range = entry.partition.range();
        println!(
            "  {} ({}): lines {}..{}",
            entry.descriptor.name, entry.descriptor.class, range.start, range.end
        );
    }

    let monitor = Arc::new(AggregatePerf::new(lines.line_count()));
    let result = with_progress(&monitor, || {
        Orchestrator::new(config).run(plan, charges.clone(), lines, &monitor)
    });
    let summary = result.with_context(|| format!("{} failed", label))?;

    print_summary(&summary);
    Ok(BackendReport::from_summary(label, &summary))
}

/// Stores `true` when dropped, so the watcher stops on unwind too.
struct DoneGuard<'a>(&'a AtomicBool);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Run `work` while a scoped thread prints `monitor`'s progress.
fn with_progress<R>(monitor: &AggregatePerf, work: impl FnOnce() -> R) -> R {
    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| watch_progress(monitor, &done));
        let _guard = DoneGuard(&done);
        work()
    })
}

fn watch_progress(monitor: &AggregatePerf, done: &AtomicBool) {
    let mut stdout = std::io::stdout();
    while !done.load(Ordering::Acquire) {
        print!("\r  progress: {:5.1}%", monitor.progress() * 100.0);
        let _ = stdout.flush();
        std::thread::sleep(PROGRESS_POLL);
    }
    println!("\r  progress: {:5.1}%", monitor.progress() * 100.0);
}

fn print_summary(summary: &RunSummary) {
    for p in &summary.partitions {
        println!(
            "  {} [{}..{}]: {:?}, {} lines, {:.3} s, {:.2} GFLOP/s",
            p.device,
            p.range.start,
            p.range.end,
            p.status,
            p.lines_traced,
            p.kernel_elapsed.as_secs_f64(),
            p.gflops
        );
        for sample in &p.samples {
            match sample.bandwidth {
                Some(bw) => println!(
                    "    {:<32} {:>10.3} ms  {:>10.1} MB/s",
                    sample.label,
                    sample.elapsed.as_secs_f64() * 1e3,
                    bw
                ),
                None => println!(
                    "    {:<32} {:>10.3} ms",
                    sample.label,
                    sample.elapsed.as_secs_f64() * 1e3
                ),
            }
        }
        for e in &p.errors {
            println!("    error: {}", e);
        }
    }
    println!(
        "  Total: {:.3} s ({:.3} s kernel), {:.2} GFLOP/s",
        summary.elapsed.as_secs_f64(),
        summary.kernel_elapsed.as_secs_f64(),
        summary.gflops
    );
    if !summary.is_complete() {
        println!(
            "  WARNING: {} lines were not computed: {:?}",
            summary.lines_missing(),
            summary.missing
        );
    }
}

/// Write the job summary as pretty-printed JSON.
pub fn write_summary_json(summary: &JobSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    std::fs::write(path, json)?;
    println!("Summary written to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_job() -> JobConfig {
        let mut job = JobConfig::for_preset("bogo");
        job.simulation.steps = Some(20);
        job.devices.backend = "cpu".into();
        job.devices.cpu_threads = 2;
        job
    }

    #[test]
    fn test_cpu_job_writes_summary() {
        let job = small_job();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("out");
        let summary = run_job(&job, &dir).unwrap();

        assert_eq!(summary.lines, 256);
        assert_eq!(summary.runs.len(), 1);
        assert_eq!(summary.runs[0].lines_traced, 256);
        assert!(summary.runs[0].missing.is_empty());
        assert!(summary.speedup.is_none());

        let text = std::fs::read_to_string(dir.join("summary.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["preset"], "bogo");
        assert_eq!(value["precision"], "single");
        assert_eq!(value["runs"][0]["partitions"][0]["status"], "completed");
    }

    #[test]
    fn test_compare_writes_empty_report_for_identical_runs() {
        let mut job = small_job();
        job.simulation.precision = Precision::Double;
        job.compare.enabled = true;
        job.output.save_summary = false;
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("out");
        let summary = run_job(&job, &dir).unwrap();

        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.lines_compared, Some(256));
        assert_eq!(summary.divergent_lines, Some(0));
        let report = std::fs::read_to_string(dir.join("regression.txt")).unwrap();
        assert!(report.is_empty());
        assert!(!dir.join("summary.json").exists());
    }

    #[test]
    fn test_progress_watcher_stops_when_work_panics() {
        let monitor = AggregatePerf::new(10);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_progress(&monitor, || -> usize { panic!("run aborted") })
        }));
        assert!(outcome.is_err());
        assert_eq!(with_progress(&monitor, || 7), 7);
    }
}
