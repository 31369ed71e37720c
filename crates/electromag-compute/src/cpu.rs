//! CPU compute functor using Rayon for shared-memory parallelism.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use electromag_core::integrator::{FieldIntegrator, IntegratorConfig, LineStats};
use electromag_core::perf::{bandwidth_mb_s, AggregatePerf, PerformanceRecorder};
use electromag_core::{is_finite_point, FieldLines, PointCharge, Real, Vec3};
use rayon::prelude::*;

use crate::backend::{
    batch_count, batch_local_range, report_non_finite, BindParams, ComputeError, ComputeFunctor,
    DeviceDescriptor, FunctorState, Lifecycle,
};

/// Lines integrated per `main_functor` call.
pub const CPU_BATCH_LINES: usize = 1024;

struct Binding<T> {
    charges: Arc<[PointCharge<T>]>,
    seeds: Vec<Vec3<T>>,
    range: Range<usize>,
    steps: usize,
    config: IntegratorConfig,
    monitor: Arc<AggregatePerf>,
}

struct Resources<T> {
    pool: rayon::ThreadPool,
    /// Line-major results: `steps` consecutive points per line.
    scratch: Vec<Vec3<T>>,
    /// Batches whose kernel finished; only these are scattered back.
    completed: Vec<bool>,
}

/// Functor that integrates its partition on a dedicated Rayon pool.
pub struct CpuFunctor<T> {
    descriptor: DeviceDescriptor,
    threads: usize,
    lifecycle: Lifecycle,
    binding: Option<Binding<T>>,
    resources: Option<Resources<T>>,
    stats: LineStats,
    recorder: PerformanceRecorder,
}

impl<T: Real> CpuFunctor<T> {
    /// Create a CPU functor using all available threads.
    pub fn new() -> Self {
        Self::with_threads(rayon::current_num_threads())
    }

    /// Create a CPU functor with a specified thread count.
    pub fn with_threads(threads: usize) -> Self {
        Self::with_descriptor(DeviceDescriptor::host_cpu(threads))
    }

    /// Create a CPU functor for a catalog descriptor; its compute units set
    /// the thread count.
    pub fn with_descriptor(descriptor: DeviceDescriptor) -> Self {
        Self {
            threads: descriptor.compute_units.max(1) as usize,
            descriptor,
            lifecycle: Lifecycle::new(),
            binding: None,
            resources: None,
            stats: LineStats::default(),
            recorder: PerformanceRecorder::new(),
        }
    }

    /// Outcome counts over every line integrated so far.
    pub fn line_stats(&self) -> LineStats {
        self.stats
    }
}

impl<T: Real> Default for CpuFunctor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> ComputeFunctor<T> for CpuFunctor<T> {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> FunctorState {
        self.lifecycle.state()
    }

    fn bind_data(&mut self, lines: &FieldLines<T>, params: BindParams<T>) -> Result<(), ComputeError> {
        self.lifecycle.require("bind_data", &[FunctorState::Created])?;
        params.validate(lines)?;

        let count = params.range.len();
        self.binding = Some(Binding {
            seeds: lines.seeds(params.range.clone()),
            charges: params.charges,
            range: params.range,
            steps: lines.steps(),
            config: params.config,
            monitor: params.monitor,
        });
        self.lifecycle.set_batches(batch_count(count, CPU_BATCH_LINES));
        self.lifecycle
            .advance("bind_data", &[FunctorState::Created], FunctorState::Bound)
    }

    fn allocate_resources(&mut self) -> Result<(), ComputeError> {
        self.lifecycle.require("allocate_resources", &[FunctorState::Bound])?;
        let Some(binding) = self.binding.as_ref() else {
            return Err(ComputeError::precondition("allocate_resources without bound data"));
        };

        let start = Instant::now();
        let len = binding.range.len() * binding.steps;
        let mut scratch = Vec::new();
        if scratch.try_reserve_exact(len).is_err() {
            self.lifecycle.fail();
            return Err(ComputeError::resource_exhausted(format!(
                "{}: cannot allocate {} bytes of host scratch",
                self.descriptor.name,
                len * std::mem::size_of::<Vec3<T>>()
            )));
        }
        scratch.resize(len, Vec3::zeros());

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("electromag-cpu-{}", i))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                self.lifecycle.fail();
                return Err(ComputeError::resource_exhausted(format!(
                    "{}: cannot start thread pool: {}",
                    self.descriptor.name, e
                )));
            }
        };

        self.recorder
            .record_phase("host allocation", start.elapsed(), None);
        let completed = vec![false; batch_count(binding.range.len(), CPU_BATCH_LINES)];
        self.resources = Some(Resources {
            pool,
            scratch,
            completed,
        });
        self.lifecycle.advance(
            "allocate_resources",
            &[FunctorState::Bound],
            FunctorState::ResourcesAllocated,
        )
    }

    fn batch_count(&self) -> usize {
        self.binding
            .as_ref()
            .map_or(0, |b| batch_count(b.range.len(), CPU_BATCH_LINES))
    }

    fn batch_range(&self, index: usize) -> Range<usize> {
        match self.binding.as_ref() {
            Some(b) => {
                let local = batch_local_range(b.range.len(), CPU_BATCH_LINES, index);
                b.range.start + local.start..b.range.start + local.end
            }
            None => 0..0,
        }
    }

    fn main_functor(&mut self, index: usize, device_index: usize) -> Result<(), ComputeError> {
        self.lifecycle.require(
            "main_functor",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
        )?;
        let (Some(binding), Some(res)) = (self.binding.as_ref(), self.resources.as_mut()) else {
            return Err(ComputeError::precondition("main_functor without resources"));
        };
        let batches = batch_count(binding.range.len(), CPU_BATCH_LINES);
        if index >= batches {
            return Err(ComputeError::invalid_argument(format!(
                "batch {} out of range ({} batches)",
                index, batches
            )));
        }
        self.lifecycle.advance(
            "main_functor",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
            FunctorState::Running,
        )?;

        let start = Instant::now();
        let steps = binding.steps;
        let local = batch_local_range(binding.range.len(), CPU_BATCH_LINES, index);
        let integrator = FieldIntegrator::new(&binding.charges, &binding.config);
        let seeds = &binding.seeds[local.clone()];
        let out = &mut res.scratch[local.start * steps..local.end * steps];

        let stats = res.pool.install(|| {
            out.par_chunks_mut(steps)
                .zip(seeds.par_iter())
                .map(|(line, seed)| LineStats::from(integrator.trace_line(*seed, line)))
                .reduce(LineStats::default, LineStats::merge)
        });

        res.completed[index] = true;
        self.stats = self.stats.merge(stats);
        binding.monitor.advance(local.len());
        self.recorder.record_phase(
            format!("kernel batch {} (device {})", index, device_index),
            start.elapsed(),
            None,
        );
        Ok(())
    }

    fn aux_functor(&mut self) -> Result<(), ComputeError> {
        self.lifecycle.require(
            "aux_functor",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
        )?;
        if let Some(res) = self.resources.as_ref() {
            let non_finite = res
                .pool
                .install(|| res.scratch.par_iter().filter(|p| !is_finite_point(p)).count());
            report_non_finite(&self.descriptor, non_finite);
        }
        log::debug!(
            "{}: {} lines, {} terminated early, {} refinements, {} degenerate steps",
            self.descriptor.name,
            self.stats.lines,
            self.stats.terminated,
            self.stats.refinements,
            self.stats.degenerate_steps
        );
        Ok(())
    }

    fn post_run(&mut self, lines: &mut FieldLines<T>) -> Result<(), ComputeError> {
        self.lifecycle.require(
            "post_run",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
        )?;
        let (Some(binding), Some(res)) = (self.binding.as_ref(), self.resources.as_ref()) else {
            return Err(ComputeError::precondition("post_run without resources"));
        };
        if lines.steps() != binding.steps || lines.line_count() < binding.range.end {
            return Err(ComputeError::invalid_argument(format!(
                "post_run buffer is {} lines x {} steps, bound for lines {:?} x {} steps",
                lines.line_count(),
                lines.steps(),
                binding.range,
                binding.steps
            )));
        }

        let start = Instant::now();
        let steps = binding.steps;
        let mut written = 0;
        for (i, line) in res.scratch.chunks(steps).enumerate() {
            let batch = i / CPU_BATCH_LINES;
            if !res.completed[batch] || self.lifecycle.batch_failed(batch) {
                continue;
            }
            lines.write_line(binding.range.start + i, line);
            written += 1;
        }
        let elapsed = start.elapsed();
        let bytes = written * steps * std::mem::size_of::<Vec3<T>>();
        self.recorder
            .record_phase("result scatter", elapsed, bandwidth_mb_s(bytes, elapsed));

        self.lifecycle.advance(
            "post_run",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
            FunctorState::PostRun,
        )
    }

    fn release_resources(&mut self) {
        if let Some(res) = self.resources.take() {
            let start = Instant::now();
            drop(res);
            self.recorder.record_phase("release", start.elapsed(), None);
        }
        self.lifecycle.release();
    }

    fn fail(&self) -> bool {
        self.lifecycle.is_failed()
    }

    fn fail_on_functor(&self, index: usize) -> bool {
        self.lifecycle.batch_failed(index)
    }

    fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ErrorKind;
    use electromag_core::integrator::CurvatureConfig;

    fn params(lines: usize, range: Range<usize>) -> BindParams<f64> {
        BindParams {
            charges: vec![
                PointCharge::new(Vec3::new(-1.0, 0.0, 0.0), 1.0),
                PointCharge::new(Vec3::new(1.0, 0.0, 0.0), -1.0),
            ]
            .into(),
            line_count: lines,
            range,
            config: IntegratorConfig {
                resolution: 0.25,
                curvature: CurvatureConfig::disabled(),
                ..Default::default()
            },
            monitor: Arc::new(AggregatePerf::new(lines)),
        }
    }

    fn seeded(lines: usize, steps: usize) -> FieldLines<f64> {
        let mut buf = FieldLines::new(lines, steps).unwrap();
        for l in 0..lines {
            buf.set_seed(l, Vec3::new(l as f64 * 0.1 - 1.0, 0.5, 0.5));
        }
        buf
    }

    #[test]
    fn test_full_lifecycle_matches_sequential_kernel() {
        let mut lines = seeded(10, 20);
        let p = params(10, 2..8);
        let monitor = p.monitor.clone();
        let charges = p.charges.clone();
        let config = p.config;

        let mut f = CpuFunctor::<f64>::with_threads(2);
        f.bind_data(&lines, p).unwrap();
        f.allocate_resources().unwrap();
        assert_eq!(f.batch_count(), 1);
        assert_eq!(f.batch_range(0), 2..8);
        f.main_functor(0, 0).unwrap();
        f.aux_functor().unwrap();
        f.post_run(&mut lines).unwrap();
        f.release_resources();
        assert_eq!(f.state(), FunctorState::Released);
        assert_eq!(monitor.progress(), 0.6);

        assert_eq!(lines.traced_count(), 6);
        assert!(!lines.is_traced(1) && !lines.is_traced(8));

        let integ = FieldIntegrator::new(&charges, &config);
        let mut expected = vec![Vec3::zeros(); 20];
        integ.trace_line(lines.seed(5), &mut expected);
        assert_eq!(lines.line(5).to_vec(), expected);
    }

    #[test]
    fn test_out_of_order_calls_are_rejected() {
        let mut lines = seeded(4, 5);
        let mut f = CpuFunctor::<f64>::with_threads(1);
        assert_eq!(
            f.allocate_resources().unwrap_err().kind,
            ErrorKind::PreconditionViolation
        );
        assert_eq!(
            f.main_functor(0, 0).unwrap_err().kind,
            ErrorKind::PreconditionViolation
        );
        assert!(f.post_run(&mut lines).is_err());
        assert_eq!(f.state(), FunctorState::Created);

        f.bind_data(&lines, params(4, 0..4)).unwrap();
        assert_eq!(
            f.bind_data(&lines, params(4, 0..4)).unwrap_err().kind,
            ErrorKind::PreconditionViolation
        );
    }

    #[test]
    fn test_undersized_buffer_rejected_at_bind() {
        let lines = seeded(4, 5);
        let mut f = CpuFunctor::<f64>::with_threads(1);
        let err = f.bind_data(&lines, params(8, 0..8)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(f.state(), FunctorState::Created);
    }

    #[test]
    fn test_release_is_idempotent() {
        let lines = seeded(4, 5);
        let mut f = CpuFunctor::<f64>::with_threads(1);
        f.bind_data(&lines, params(4, 0..4)).unwrap();
        f.allocate_resources().unwrap();
        f.release_resources();
        f.release_resources();
        assert_eq!(f.state(), FunctorState::Released);
        assert!(!f.fail());
    }

    #[test]
    fn test_batches_split_large_partitions() {
        let n = CPU_BATCH_LINES * 2 + 3;
        let lines = seeded(n, 3);
        let mut f = CpuFunctor::<f64>::with_threads(2);
        f.bind_data(&lines, params(n, 0..n)).unwrap();
        f.allocate_resources().unwrap();
        assert_eq!(f.batch_count(), 3);
        assert_eq!(f.batch_range(2), 2 * CPU_BATCH_LINES..n);
        assert_eq!(
            f.main_functor(3, 0).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_post_run_skips_batches_that_never_ran() {
        let n = CPU_BATCH_LINES + 4;
        let mut lines = seeded(n, 3);
        let mut f = CpuFunctor::<f64>::with_threads(2);
        f.bind_data(&lines, params(n, 0..n)).unwrap();
        f.allocate_resources().unwrap();
        assert_eq!(f.batch_count(), 2);
        f.main_functor(1, 0).unwrap();
        f.post_run(&mut lines).unwrap();

        assert_eq!(lines.traced_count(), 4);
        assert!(!lines.is_traced(0));
        assert!(!lines.is_traced(CPU_BATCH_LINES - 1));
        assert!(lines.is_traced(CPU_BATCH_LINES));
    }
}
