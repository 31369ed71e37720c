//! End-to-end runs through the orchestrator on the CPU backend.

use std::ops::Range;
use std::sync::Arc;

use electromag_compute::backend::Lifecycle;
use electromag_compute::{
    build_functors, BackendSelection, BindParams, ComputeError, ComputeFunctor, CpuFunctor,
    DeviceCatalog, DeviceClass, DeviceDescriptor, DeviceFeatures, ErrorKind, FunctorState,
    Orchestrator, PartitionStatus, Platform, RunPlan, StaticProbe,
};
use electromag_core::init::{charge_extent, init_field_lines, init_point_charges, SeedPolicy};
use electromag_core::integrator::{FieldIntegrator, IntegratorConfig};
use electromag_core::perf::{AggregatePerf, PerformanceRecorder};
use electromag_core::{FieldLines, PointCharge, Real};

fn setup<T: Real>(nx: usize, ny: usize, charges: usize, steps: usize) -> (Arc<[PointCharge<T>]>, FieldLines<T>) {
    let charges: Vec<PointCharge<T>> = init_point_charges(charges, SeedPolicy::Deterministic);
    let mut lines = FieldLines::new(nx * ny, steps).unwrap();
    init_field_lines(
        &mut lines,
        nx,
        ny,
        1,
        charge_extent(charges.len()),
        SeedPolicy::Deterministic,
    )
    .unwrap();
    (charges.into(), lines)
}

fn config() -> IntegratorConfig {
    IntegratorConfig {
        resolution: 1.0,
        ..IntegratorConfig::default()
    }
}

/// A device that refuses every allocation.
struct RefusingFunctor {
    descriptor: DeviceDescriptor,
    lifecycle: Lifecycle,
    recorder: PerformanceRecorder,
}

impl RefusingFunctor {
    fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                id: 1,
                name: "Broken GPU".into(),
                vendor: String::new(),
                platform: "test".into(),
                class: DeviceClass::Accelerator,
                compute_units: 4,
                clock_mhz: 2000,
                vector_width: 4,
                memory_bytes: 0,
                max_work_group_size: 64,
                features: DeviceFeatures::default(),
                adapter_index: None,
            },
            lifecycle: Lifecycle::new(),
            recorder: PerformanceRecorder::new(),
        }
    }
}

impl ComputeFunctor<f64> for RefusingFunctor {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> FunctorState {
        self.lifecycle.state()
    }

    fn bind_data(&mut self, _: &FieldLines<f64>, _: BindParams<f64>) -> Result<(), ComputeError> {
        self.lifecycle
            .advance("bind_data", &[FunctorState::Created], FunctorState::Bound)
    }

    fn allocate_resources(&mut self) -> Result<(), ComputeError> {
        self.lifecycle.require("allocate_resources", &[FunctorState::Bound])?;
        self.lifecycle.fail();
        Err(ComputeError::resource_exhausted("Broken GPU: out of device memory"))
    }

    fn batch_count(&self) -> usize {
        0
    }

    fn batch_range(&self, _: usize) -> Range<usize> {
        0..0
    }

    fn main_functor(&mut self, _: usize, _: usize) -> Result<(), ComputeError> {
        self.lifecycle
            .require("main_functor", &[FunctorState::ResourcesAllocated])
    }

    fn post_run(&mut self, _: &mut FieldLines<f64>) -> Result<(), ComputeError> {
        self.lifecycle.require("post_run", &[FunctorState::Running])
    }

    fn release_resources(&mut self) {
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

#[test]
fn test_cpu_run_fills_every_line() {
    let (charges, mut lines) = setup::<f32>(16, 16, 256, 500);
    let catalog = DeviceCatalog::new(StaticProbe::empty());
    let plan = build_functors::<f32>(&catalog, BackendSelection::Accelerators, "", 256, 0).unwrap();
    let monitor = Arc::new(AggregatePerf::new(256));

    let summary = Orchestrator::new(config())
        .run(plan, charges, &mut lines, &monitor)
        .unwrap();

    assert_eq!(lines.line_count(), 256);
    assert_eq!(lines.steps(), 500);
    assert_eq!(lines.traced_count(), 256);
    assert!(lines.all_finite());
    assert!(summary.is_complete());
    assert_eq!(summary.lines_traced(), 256);
    assert_eq!(summary.partitions.len(), 1);
    assert_eq!(summary.partitions[0].class, DeviceClass::Cpu);
    assert!(summary.total_flops > 0);

    assert!(monitor.is_finished());
    assert_eq!(monitor.progress(), 1.0);
}

#[test]
fn test_progress_stays_below_one_without_finish() {
    let (charges, mut lines) = setup::<f64>(8, 8, 16, 50);
    let monitor = Arc::new(AggregatePerf::new(64));
    let mut f = CpuFunctor::<f64>::with_threads(2);
    f.bind_data(
        &lines,
        BindParams {
            charges,
            line_count: 64,
            range: 0..64,
            config: config(),
            monitor: monitor.clone(),
        },
    )
    .unwrap();
    f.allocate_resources().unwrap();
    for i in 0..f.batch_count() {
        f.main_functor(i, 0).unwrap();
    }
    f.post_run(&mut lines).unwrap();
    f.release_resources();

    assert_eq!(lines.traced_count(), 64);
    assert!(monitor.progress() < 1.0);
    assert!(!monitor.is_finished());
}

#[test]
fn test_split_run_matches_single_device() {
    let (charges, seeded) = setup::<f64>(12, 10, 64, 120);

    let mut single = seeded.clone();
    let plan = RunPlan::from_functors(
        120,
        vec![Box::new(CpuFunctor::<f64>::with_threads(2)) as Box<dyn ComputeFunctor<f64>>],
    )
    .unwrap();
    Orchestrator::new(config())
        .run(plan, charges.clone(), &mut single, &Arc::new(AggregatePerf::new(120)))
        .unwrap();

    let mut split = seeded.clone();
    let plan = RunPlan::from_functors(
        120,
        vec![
            Box::new(CpuFunctor::<f64>::with_threads(2)) as Box<dyn ComputeFunctor<f64>>,
            Box::new(CpuFunctor::<f64>::with_threads(1)),
        ],
    )
    .unwrap();
    assert_eq!(plan.entries[0].partition.count, 80);
    assert_eq!(plan.entries[1].partition.range(), 80..120);
    let summary = Orchestrator::new(config())
        .run(plan, charges.clone(), &mut split, &Arc::new(AggregatePerf::new(120)))
        .unwrap();

    assert!(summary.is_complete());
    assert_eq!(single.as_array(), split.as_array());

    // The parallel result equals the sequential kernel.
    let integ = FieldIntegrator::new(&charges, &config());
    let mut expected = vec![electromag_core::Vec3::zeros(); 120];
    integ.trace_line(seeded.seed(97), &mut expected);
    assert_eq!(split.line(97).to_vec(), expected);
}

#[test]
fn test_failed_partition_is_reported_missing() {
    let (charges, mut lines) = setup::<f64>(10, 10, 16, 40);
    let plan = RunPlan::from_functors(
        100,
        vec![
            Box::new(CpuFunctor::<f64>::with_threads(1)) as Box<dyn ComputeFunctor<f64>>,
            Box::new(RefusingFunctor::new()),
        ],
    )
    .unwrap();
    let lost = plan.entries[1].partition.range();
    assert!(!lost.is_empty());
    let monitor = Arc::new(AggregatePerf::new(100));

    let summary = Orchestrator::new(config())
        .run(plan, charges, &mut lines, &monitor)
        .unwrap();

    assert_eq!(summary.missing, vec![lost.clone()]);
    assert_eq!(summary.lines_missing(), lost.len());
    assert_eq!(summary.partitions[0].status, PartitionStatus::Completed);
    assert_eq!(summary.partitions[1].status, PartitionStatus::Lost);
    assert_eq!(summary.partitions[1].lines_traced, 0);
    assert!(summary.partitions[1].errors[0].contains("out of device memory"));

    assert_eq!(lines.untraced_lines(), vec![lost]);
    assert!(lines.all_finite());
    assert_eq!(monitor.progress(), 1.0);
}

#[test]
fn test_no_usable_backend_is_fatal() {
    let (charges, mut lines) = setup::<f64>(4, 4, 4, 10);
    let plan = RunPlan::from_functors(
        16,
        vec![Box::new(RefusingFunctor::new()) as Box<dyn ComputeFunctor<f64>>],
    )
    .unwrap();
    let monitor = Arc::new(AggregatePerf::new(16));
    let err = Orchestrator::new(config())
        .run(plan, charges, &mut lines, &monitor)
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::NoUsableBackend);
    assert!(err.context.contains("Broken GPU"));
    assert!(!monitor.is_finished());
    assert_eq!(lines.traced_count(), 0);
}

#[test]
fn test_auto_double_precision_runs_on_cpu() {
    let catalog = DeviceCatalog::new(StaticProbe::new(vec![Platform {
        name: "Vulkan".into(),
        vendor: String::new(),
        version: String::new(),
        devices: vec![RefusingFunctor::new().descriptor],
    }]));
    let (charges, mut lines) = setup::<f64>(4, 4, 4, 10);
    let selection: BackendSelection = "auto".parse().unwrap();
    let plan = build_functors::<f64>(&catalog, selection, "", 16, 1).unwrap();
    let monitor = Arc::new(AggregatePerf::new(16));

    let summary = Orchestrator::new(config())
        .run(plan, charges, &mut lines, &monitor)
        .unwrap();

    assert!(summary.is_complete());
    assert_eq!(summary.partitions.len(), 1);
    assert_eq!(summary.partitions[0].class, DeviceClass::Cpu);
    assert_eq!(lines.traced_count(), 16);
    assert!(monitor.is_finished());
}

#[test]
fn test_zero_devices_cannot_be_partitioned() {
    let err = RunPlan::<f64>::from_functors(16, Vec::new()).err().unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}
