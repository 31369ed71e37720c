//! Backend selection: which devices take part in a run.

use std::fmt;
use std::str::FromStr;

use electromag_core::Real;

use crate::backend::{ComputeError, ComputeFunctor, DeviceClass, DeviceDescriptor};
use crate::catalog::DeviceCatalog;
use crate::cpu::CpuFunctor;
use crate::orchestrator::{PlannedFunctor, RunPlan};
use crate::partition::partition_lines;

/// Which devices a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// The host CPU only.
    Cpu,
    /// Every catalog accelerator, falling back to the CPU if there are none.
    Accelerators,
    /// Every catalog accelerator plus the host CPU.
    Hybrid,
}

impl FromStr for BackendSelection {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(BackendSelection::Cpu),
            "gpu" | "auto" | "accelerators" => Ok(BackendSelection::Accelerators),
            "hybrid" => Ok(BackendSelection::Hybrid),
            other => Err(ComputeError::invalid_argument(format!(
                "unknown backend '{}' (expected cpu, gpu, hybrid or auto)",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSelection::Cpu => f.write_str("cpu"),
            BackendSelection::Accelerators => f.write_str("accelerators"),
            BackendSelection::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Scalar types with an accelerator functor.
pub trait FunctorScalar: Real {
    /// Whether `descriptor` can run this precision's accelerator kernel.
    fn accelerator_supported(descriptor: &DeviceDescriptor) -> bool;

    fn accelerator_functor(
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn ComputeFunctor<Self>>, ComputeError>;
}

impl FunctorScalar for f32 {
    fn accelerator_supported(_descriptor: &DeviceDescriptor) -> bool {
        true
    }

    fn accelerator_functor(
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn ComputeFunctor<f32>>, ComputeError> {
        #[cfg(feature = "gpu")]
        {
            Ok(Box::new(crate::gpu::GpuFunctor::new(descriptor.clone())))
        }
        #[cfg(not(feature = "gpu"))]
        {
            Err(ComputeError::unavailable(format!(
                "{}: built without the `gpu` feature",
                descriptor.name
            )))
        }
    }
}

impl FunctorScalar for f64 {
    /// The WGSL kernel is single precision only, so no accelerator qualifies
    /// even when it reports `double_precision`.
    fn accelerator_supported(_descriptor: &DeviceDescriptor) -> bool {
        false
    }

    fn accelerator_functor(
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn ComputeFunctor<f64>>, ComputeError> {
        Err(ComputeError::invalid_argument(format!(
            "{}: accelerator kernels are single precision; use the CPU backend for double",
            descriptor.name
        )))
    }
}

/// Devices taking part in a run, in partition order.
///
/// Accelerators come from the catalog after `platform_filter` is applied,
/// minus those that cannot run `T`; the host CPU, when used, comes last.
/// Without a qualifying accelerator the run falls back to the host CPU.
pub fn select_devices<T: FunctorScalar>(
    catalog: &DeviceCatalog,
    selection: BackendSelection,
    platform_filter: &str,
    cpu_threads: usize,
) -> Vec<DeviceDescriptor> {
    let threads = if cpu_threads == 0 {
        rayon::current_num_threads()
    } else {
        cpu_threads
    };
    let host = DeviceDescriptor::host_cpu(threads);

    if selection == BackendSelection::Cpu {
        return vec![host];
    }

    let matched: Vec<DeviceDescriptor> = catalog
        .filter_by_name(platform_filter)
        .into_iter()
        .flat_map(|p| p.devices)
        .collect();
    let found = matched.len();
    let mut devices: Vec<DeviceDescriptor> = matched
        .into_iter()
        .filter(|d| {
            let ok = T::accelerator_supported(d);
            if !ok {
                log::info!("{}: no {} kernel; skipping", d.name, T::PRECISION);
            }
            ok
        })
        .collect();

    if devices.is_empty() {
        if found > 0 {
            log::warn!(
                "No accelerator runs {} precision; falling back to the CPU",
                T::PRECISION
            );
        } else if platform_filter.is_empty() {
            log::warn!("No accelerators found; falling back to the CPU");
        } else {
            log::warn!(
                "No accelerators match '{}'; falling back to the CPU",
                platform_filter
            );
        }
        return vec![host];
    }
    if selection == BackendSelection::Hybrid {
        devices.push(host);
    }
    devices
}

/// Partition `total_lines` across the selected devices and build one functor
/// per partition.
///
/// A functor that cannot be constructed is kept in the plan as an error so
/// the orchestrator reports its partition as lost.
pub fn build_functors<T: FunctorScalar>(
    catalog: &DeviceCatalog,
    selection: BackendSelection,
    platform_filter: &str,
    total_lines: usize,
    cpu_threads: usize,
) -> Result<RunPlan<T>, ComputeError> {
    let devices = select_devices::<T>(catalog, selection, platform_filter, cpu_threads);
    let partitions = partition_lines(total_lines, &devices)?;

    let entries = partitions
        .into_iter()
        .zip(devices)
        .map(|(partition, descriptor)| {
            let functor = match descriptor.class {
                DeviceClass::Cpu => Ok(Box::new(CpuFunctor::<T>::with_descriptor(descriptor.clone()))
                    as Box<dyn ComputeFunctor<T>>),
                DeviceClass::Accelerator => T::accelerator_functor(&descriptor),
            };
            PlannedFunctor {
                partition,
                descriptor,
                functor,
            }
        })
        .collect();

    Ok(RunPlan { entries })
}
