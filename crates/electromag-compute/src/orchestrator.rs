//! Run orchestration.
//!
//! The [`Orchestrator`] drives every functor of a [`RunPlan`] through its
//! lifecycle: bind all, allocate all, dispatch all batches concurrently (one
//! thread per functor), wait for every thread, run the auxiliary pass,
//! collect results with `post_run`, release everything, and only then mark
//! the run finished.
//!
//! A functor that fails loses its partition, not the run. Lost lines stay
//! untraced in the output buffer and are listed in
//! [`RunSummary::missing`]. The run fails only when no functor survives.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use electromag_core::integrator::{nominal_flops, IntegratorConfig};
use electromag_core::perf::{gflops, AggregatePerf, PerformanceSample};
use electromag_core::{FieldLines, PointCharge, Real};

use crate::backend::{
    BindParams, ComputeError, ComputeFunctor, DeviceClass, DeviceDescriptor, ErrorKind,
};
use crate::partition::{partition_lines, Partition};

/// One functor of a run and the lines it owns.
pub struct PlannedFunctor<T> {
    pub partition: Partition,
    pub descriptor: DeviceDescriptor,
    /// The functor, or the reason it could not be built.
    pub functor: Result<Box<dyn ComputeFunctor<T>>, ComputeError>,
}

/// The functors of a run, their partitions tiling the line set in order.
pub struct RunPlan<T> {
    pub entries: Vec<PlannedFunctor<T>>,
}

impl<T: Real> RunPlan<T> {
    /// Partition `total_lines` across ready-made functors by their
    /// descriptors' capability.
    pub fn from_functors(
        total_lines: usize,
        functors: Vec<Box<dyn ComputeFunctor<T>>>,
    ) -> Result<Self, ComputeError> {
        let devices: Vec<DeviceDescriptor> =
            functors.iter().map(|f| f.descriptor().clone()).collect();
        let partitions = partition_lines(total_lines, &devices)?;
        let entries = partitions
            .into_iter()
            .zip(devices)
            .zip(functors)
            .map(|((partition, descriptor), functor)| PlannedFunctor {
                partition,
                descriptor,
                functor: Ok(functor),
            })
            .collect();
        Ok(Self { entries })
    }
}

/// How much of its partition a functor delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Completed,
    /// Some batches failed; the rest were delivered.
    Partial,
    Lost,
}

/// Outcome of one partition.
#[derive(Debug, Clone)]
pub struct PartitionReport {
    pub device: String,
    pub class: DeviceClass,
    pub range: Range<usize>,
    pub status: PartitionStatus,
    pub errors: Vec<String>,
    /// Phase timings recorded by the functor.
    pub samples: Vec<PerformanceSample>,
    /// Wall time of this functor's batches.
    pub kernel_elapsed: Duration,
    pub lines_traced: usize,
    pub flops: u64,
    pub gflops: f64,
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub partitions: Vec<PartitionReport>,
    /// Line ranges no functor delivered, sorted and merged.
    pub missing: Vec<Range<usize>>,
    /// Bind to release.
    pub elapsed: Duration,
    /// First dispatch to the barrier.
    pub kernel_elapsed: Duration,
    pub total_flops: u64,
    pub gflops: f64,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn lines_traced(&self) -> usize {
        self.partitions.iter().map(|p| p.lines_traced).sum()
    }

    pub fn lines_missing(&self) -> usize {
        self.missing.iter().map(|r| r.len()).sum()
    }
}

struct Slot<T> {
    partition: Partition,
    descriptor: DeviceDescriptor,
    functor: Option<Box<dyn ComputeFunctor<T>>>,
    errors: Vec<ComputeError>,
    failed_batches: Vec<Range<usize>>,
    kernel_elapsed: Duration,
    lost: bool,
}

impl<T: Real> Slot<T> {
    fn new(entry: PlannedFunctor<T>) -> Self {
        let mut slot = Self {
            partition: entry.partition,
            descriptor: entry.descriptor,
            functor: None,
            errors: Vec::new(),
            failed_batches: Vec::new(),
            kernel_elapsed: Duration::ZERO,
            lost: false,
        };
        match entry.functor {
            Ok(f) => slot.functor = Some(f),
            Err(e) => slot.lose(e),
        }
        slot
    }

    fn lose(&mut self, e: ComputeError) {
        log::error!(
            "{} lost lines {:?}: {}",
            self.descriptor.name,
            self.partition.range(),
            e
        );
        self.errors.push(e);
        self.lost = true;
    }

    /// Run one lifecycle step; an error loses the partition.
    fn apply(
        &mut self,
        op: impl FnOnce(&mut Box<dyn ComputeFunctor<T>>) -> Result<(), ComputeError>,
    ) {
        if self.lost {
            return;
        }
        let Some(f) = self.functor.as_mut() else {
            return;
        };
        if let Err(e) = op(f) {
            self.lose(e);
        }
    }

    /// Run every batch in order. Failed batches are recorded and skipped.
    fn dispatch(&mut self, device_index: usize) {
        let Some(f) = self.functor.as_mut() else {
            return;
        };
        let start = Instant::now();
        for i in 0..f.batch_count() {
            if let Err(e) = f.main_functor(i, device_index) {
                let range = f.batch_range(i);
                log::error!(
                    "{} batch {} (lines {:?}) failed: {}",
                    self.descriptor.name,
                    i,
                    range,
                    e
                );
                self.failed_batches.push(range);
                self.errors.push(e);
                if f.fail() {
                    break;
                }
            }
        }
        self.kernel_elapsed = start.elapsed();
    }

    fn missing(&self) -> Vec<Range<usize>> {
        if self.lost {
            return vec![self.partition.range()];
        }
        let mut ranges = self.failed_batches.clone();
        if let Some(f) = self.functor.as_ref() {
            ranges.extend(
                (0..f.batch_count())
                    .filter(|&i| f.fail_on_functor(i))
                    .map(|i| f.batch_range(i)),
            );
        }
        merge_ranges(ranges)
    }
}

/// Sort ranges and merge overlapping or adjacent ones; drop empty ranges.
fn merge_ranges(mut ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    merged
}

/// Drives a [`RunPlan`] to completion.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: IntegratorConfig,
}

impl Orchestrator {
    pub fn new(config: IntegratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    /// Integrate every line of `lines` with the functors of `plan`.
    ///
    /// Seeds are read from step 0 of `lines`; results are written back into
    /// it. `monitor` receives progress from the functors and is marked
    /// finished after every functor has completed `post_run`.
    pub fn run<T: Real>(
        &self,
        plan: RunPlan<T>,
        charges: Arc<[PointCharge<T>]>,
        lines: &mut FieldLines<T>,
        monitor: &Arc<AggregatePerf>,
    ) -> Result<RunSummary, ComputeError> {
        if plan.entries.is_empty() {
            return Err(ComputeError::invalid_argument("run plan has no functors"));
        }
        let line_count = lines.line_count();
        let steps = lines.steps();
        check_tiling(&plan, line_count)?;

        log::info!(
            "Integrating {} lines x {} steps over {} charges on {} device(s)",
            line_count,
            steps,
            charges.len(),
            plan.entries.len()
        );

        let run_start = Instant::now();
        let mut slots: Vec<Slot<T>> = plan.entries.into_iter().map(Slot::new).collect();

        for slot in slots.iter_mut() {
            let params = BindParams {
                charges: charges.clone(),
                line_count,
                range: slot.partition.range(),
                config: self.config,
                monitor: monitor.clone(),
            };
            slot.apply(|f| f.bind_data(lines, params));
        }
        for slot in slots.iter_mut() {
            slot.apply(|f| f.allocate_resources());
        }

        let kernel_start = Instant::now();
        let panicked: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = slots
                .iter_mut()
                .enumerate()
                .filter(|(_, slot)| !slot.lost)
                .map(|(i, slot)| (i, scope.spawn(move || slot.dispatch(i))))
                .collect();
            handles
                .into_iter()
                .filter_map(|(i, h)| h.join().is_err().then_some(i))
                .collect()
        });
        let kernel_elapsed = kernel_start.elapsed();

        for i in panicked {
            slots[i].lose(ComputeError::new(
                ErrorKind::ResourceExhausted,
                "dispatch thread panicked",
            ));
        }
        for slot in slots.iter_mut().filter(|s| !s.lost) {
            if slot.functor.as_ref().is_some_and(|f| f.fail()) {
                let e = slot.errors.pop().unwrap_or_else(|| {
                    ComputeError::new(ErrorKind::ResourceExhausted, "functor failed during dispatch")
                });
                slot.lose(e);
            }
        }

        for slot in slots.iter_mut().filter(|s| !s.lost) {
            if let Some(f) = slot.functor.as_mut() {
                if let Err(e) = f.aux_functor() {
                    log::warn!("{}: auxiliary pass failed: {}", slot.descriptor.name, e);
                }
            }
        }
        for slot in slots.iter_mut() {
            slot.apply(|f| f.post_run(lines));
        }
        for slot in slots.iter_mut() {
            if let Some(f) = slot.functor.as_mut() {
                f.release_resources();
            }
        }
        let elapsed = run_start.elapsed();

        if slots.iter().all(|s| s.lost) {
            let reasons: Vec<String> = slots
                .iter()
                .flat_map(|s| s.errors.iter().map(move |e| format!("{}: {}", s.descriptor.name, e)))
                .collect();
            return Err(ComputeError::new(
                ErrorKind::NoUsableBackend,
                reasons.join("; "),
            ));
        }

        let mut missing = Vec::new();
        let mut partitions = Vec::with_capacity(slots.len());
        let mut total_flops = 0;
        for slot in &slots {
            let slot_missing = slot.missing();
            let lines_missing: usize = slot_missing.iter().map(|r| r.len()).sum();
            let lines_traced = slot.partition.count - lines_missing;
            let flops = nominal_flops(lines_traced, steps, charges.len());
            total_flops += flops;

            let status = if slot.lost {
                PartitionStatus::Lost
            } else if lines_missing > 0 {
                PartitionStatus::Partial
            } else {
                PartitionStatus::Completed
            };

            let (samples, functor_gflops) = match slot.functor.as_ref() {
                Some(f) => {
                    let mut recorder = f.recorder().clone();
                    let g = recorder.finalize(flops, slot.kernel_elapsed);
                    (recorder.samples().to_vec(), g)
                }
                None => (Vec::new(), 0.0),
            };

            partitions.push(PartitionReport {
                device: slot.descriptor.name.clone(),
                class: slot.descriptor.class,
                range: slot.partition.range(),
                status,
                errors: slot.errors.iter().map(|e| e.to_string()).collect(),
                samples,
                kernel_elapsed: slot.kernel_elapsed,
                lines_traced,
                flops,
                gflops: functor_gflops,
            });
            missing.extend(slot_missing);
        }
        let missing = merge_ranges(missing);

        let run_gflops = gflops(total_flops, kernel_elapsed);
        monitor.finish(kernel_elapsed, run_gflops);

        if !missing.is_empty() {
            log::warn!(
                "{} of {} lines missing: {:?}",
                missing.iter().map(|r| r.len()).sum::<usize>(),
                line_count,
                missing
            );
        }
        log::info!(
            "Run finished in {:.3} s ({:.2} GFLOP/s)",
            elapsed.as_secs_f64(),
            run_gflops
        );

        Ok(RunSummary {
            partitions,
            missing,
            elapsed,
            kernel_elapsed,
            total_flops,
            gflops: run_gflops,
        })
    }
}

fn check_tiling<T>(plan: &RunPlan<T>, line_count: usize) -> Result<(), ComputeError> {
    let mut next = 0;
    for entry in &plan.entries {
        if entry.partition.start != next {
            return Err(ComputeError::invalid_argument(format!(
                "partition {:?} does not start at line {}",
                entry.partition.range(),
                next
            )));
        }
        next = entry.partition.end();
    }
    if next != line_count {
        return Err(ComputeError::invalid_argument(format!(
            "partitions cover {} lines, buffer has {}",
            next, line_count
        )));
    }
    Ok(())
}
