//! # ElectroMag Compute
//!
//! Heterogeneous execution of the field-line kernel. This crate discovers
//! devices, splits the line set across them in proportion to their
//! capability, and drives one [`ComputeFunctor`](backend::ComputeFunctor)
//! per device through a fixed lifecycle.
//!
//! ## Available backends
//!
//! | Backend | Feature flag | Precision |
//! |---------|-------------|-----------|
//! | CPU (Rayon) | always | `f32`, `f64` |
//! | GPU (wgpu) | `gpu` | `f32` |
//!
//! ## Typical use
//!
//! ```no_run
//! use std::sync::Arc;
//! use electromag_compute::{build_functors, BackendSelection, DeviceCatalog, Orchestrator};
//! use electromag_core::integrator::IntegratorConfig;
//! use electromag_core::perf::AggregatePerf;
//! use electromag_core::{FieldLines, PointCharge, Vec3};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let charges: Arc<[PointCharge<f32>]> =
//!     vec![PointCharge::new(Vec3::zeros(), 1.0)].into();
//! let mut lines = FieldLines::<f32>::new(256, 100)?;
//! let catalog = DeviceCatalog::system();
//! let plan = build_functors(&catalog, BackendSelection::Accelerators, "", 256, 0)?;
//! let monitor = Arc::new(AggregatePerf::new(256));
//! let summary = Orchestrator::new(IntegratorConfig::default())
//!     .run(plan, charges, &mut lines, &monitor)?;
//! println!("{:.2} GFLOP/s", summary.gflops);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod catalog;
pub mod cpu;
pub mod orchestrator;
pub mod partition;
pub mod select;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use backend::{
    BindParams, ComputeError, ComputeFunctor, DeviceClass, DeviceDescriptor, DeviceFeatures,
    ErrorKind, FunctorState,
};
pub use catalog::{describe_catalog, DeviceCatalog, Platform, PlatformProbe, StaticProbe};
pub use cpu::CpuFunctor;
pub use orchestrator::{Orchestrator, PartitionReport, PartitionStatus, RunPlan, RunSummary};
pub use partition::{capability_score, partition_lines, Partition};
pub use select::{build_functors, select_devices, BackendSelection, FunctorScalar};

#[cfg(feature = "gpu")]
pub use gpu::{GpuFunctor, WgpuProbe};
