//! Performance accounting.
//!
//! [`PerformanceRecorder`] collects per-phase timings for one functor and
//! derives GFLOP/s. [`AggregatePerf`] is the lock-free progress record a
//! monitor thread polls while a run is in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Highest progress value reported before a run is finished.
pub const PROGRESS_CEILING: f64 = 0.999;

/// Timing of one completed phase (allocation, kernel batch, readback, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub label: String,
    pub elapsed: Duration,
    /// Transfer bandwidth in MB/s, for phases that move data.
    pub bandwidth: Option<f64>,
}

/// Ordered phase timings of one functor.
#[derive(Debug, Clone, Default)]
pub struct PerformanceRecorder {
    samples: Vec<PerformanceSample>,
    gflops: Option<f64>,
}

impl PerformanceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed phase.
    pub fn record_phase(
        &mut self,
        label: impl Into<String>,
        elapsed: Duration,
        bandwidth: Option<f64>,
    ) {
        self.samples.push(PerformanceSample {
            label: label.into(),
            elapsed,
            bandwidth,
        });
    }

    /// Run `f`, recording its duration under `label`.
    pub fn time_phase<R>(&mut self, label: impl Into<String>, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record_phase(label, start.elapsed(), None);
        result
    }

    pub fn samples(&self) -> &[PerformanceSample] {
        &self.samples
    }

    /// Sum of all recorded phase durations.
    pub fn total_elapsed(&self) -> Duration {
        self.samples.iter().map(|s| s.elapsed).sum()
    }

    /// Derive and store throughput: `total_flops / elapsed / 1e9`.
    ///
    /// A zero elapsed time yields zero rather than infinity.
    pub fn finalize(&mut self, total_flops: u64, total_elapsed: Duration) -> f64 {
        let gflops = gflops(total_flops, total_elapsed);
        self.gflops = Some(gflops);
        gflops
    }

    /// Throughput stored by the last [`finalize`](Self::finalize).
    pub fn gflops(&self) -> Option<f64> {
        self.gflops
    }
}

/// GFLOP/s for `flops` operations over `elapsed`.
pub fn gflops(flops: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        flops as f64 / secs / 1e9
    } else {
        0.0
    }
}

/// Bandwidth in MB/s for a transfer of `bytes` taking `elapsed`.
pub fn bandwidth_mb_s(bytes: usize, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.0).then(|| bytes as f64 / secs / (1024.0 * 1024.0))
}

/// Live progress and throughput of a run.
///
/// Written by the functors (`advance`) and the orchestrator (`finish`);
/// read by any number of monitors without blocking.
#[derive(Debug)]
pub struct AggregatePerf {
    total_lines: usize,
    done_lines: AtomicUsize,
    finished: AtomicBool,
    elapsed_nanos: AtomicU64,
    gflops_bits: AtomicU64,
}

impl AggregatePerf {
    pub fn new(total_lines: usize) -> Self {
        Self {
            total_lines,
            done_lines: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            elapsed_nanos: AtomicU64::new(0),
            gflops_bits: AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Report `lines` more lines integrated.
    pub fn advance(&self, lines: usize) {
        self.done_lines.fetch_add(lines, Ordering::Relaxed);
    }

    /// Fraction of the run completed, in `[0, 1]`.
    ///
    /// Stays below 1.0 until [`finish`](Self::finish) is called, however
    /// many lines have been reported.
    pub fn progress(&self) -> f64 {
        if self.finished.load(Ordering::Acquire) {
            return 1.0;
        }
        if self.total_lines == 0 {
            return 0.0;
        }
        let done = self.done_lines.load(Ordering::Relaxed) as f64;
        (done / self.total_lines as f64).min(PROGRESS_CEILING)
    }

    /// Mark the run complete with its final timing and throughput.
    pub fn finish(&self, elapsed: Duration, gflops: f64) {
        self.elapsed_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.gflops_bits.store(gflops.to_bits(), Ordering::Relaxed);
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Relaxed))
    }

    pub fn gflops(&self) -> f64 {
        f64::from_bits(self.gflops_bits.load(Ordering::Relaxed))
    }
}
