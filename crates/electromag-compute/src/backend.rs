//! Compute functor trait and device abstraction.
//!
//! A [`ComputeFunctor`] owns one partition of the line set on one device and
//! walks a fixed lifecycle:
//!
//! ```text
//! Created ─bind_data→ Bound ─allocate_resources→ ResourcesAllocated
//!     ─main_functor*→ Running ─aux_functor→ Running ─post_run→ PostRun
//!     ─release_resources→ Released
//! ```
//!
//! Any step may move the functor to `Failed`. Calling a step out of order is
//! a precondition violation and returns [`ErrorKind::PreconditionViolation`]
//! without changing state. Concurrent calls on one instance are ruled out by
//! `&mut self`; different instances run concurrently on different threads.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use electromag_core::integrator::IntegratorConfig;
use electromag_core::perf::{AggregatePerf, PerformanceRecorder};
use electromag_core::{FieldError, FieldLines, PointCharge, Real};
use thiserror::Error;

/// Category of a compute failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The platform query failed; the catalog degrades to no devices.
    DeviceScanFailure,
    /// Malformed parameters (undersized buffer, zero devices, bad index).
    InvalidArgument,
    /// The backend refused an allocation or failed to build its kernel.
    ResourceExhausted,
    /// Non-finite results. Logged by the functor that finds them, never
    /// returned from a run.
    NumericDegeneracy,
    /// A lifecycle step was called out of order.
    PreconditionViolation,
    /// The backend is not available in this build or on this machine.
    Unavailable,
    /// No partition of the run could be executed.
    NoUsableBackend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DeviceScanFailure => "Device scan failure",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::NumericDegeneracy => "Numeric degeneracy",
            ErrorKind::PreconditionViolation => "Precondition violation",
            ErrorKind::Unavailable => "Backend not available",
            ErrorKind::NoUsableBackend => "No usable backend",
        };
        f.write_str(s)
    }
}

/// Errors originating from compute backends.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {context}")]
pub struct ComputeError {
    pub kind: ErrorKind,
    pub context: String,
}

impl ComputeError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }

    pub fn invalid_argument(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, context)
    }

    pub fn resource_exhausted(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, context)
    }

    pub fn unavailable(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, context)
    }

    pub fn precondition(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionViolation, context)
    }
}

impl From<FieldError> for ComputeError {
    fn from(e: FieldError) -> Self {
        ComputeError::invalid_argument(e.to_string())
    }
}

/// The class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Cpu,
    Accelerator,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => f.write_str("CPU"),
            DeviceClass::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Optional device capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub double_precision: bool,
    /// Device memory is shared with the host.
    pub unified_memory: bool,
}

/// Nominal clock used to score the host CPU against accelerators.
pub const HOST_CPU_CLOCK_MHZ: u32 = 2000;

/// Static description of a compute device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Position in the catalog's enumeration order.
    pub id: usize,
    pub name: String,
    pub vendor: String,
    pub platform: String,
    pub class: DeviceClass,
    pub compute_units: u32,
    pub clock_mhz: u32,
    /// Preferred number of scalars processed per instruction.
    pub vector_width: u32,
    pub memory_bytes: u64,
    pub max_work_group_size: u32,
    pub features: DeviceFeatures,
    /// Index of the adapter in the platform API's enumeration, if any.
    pub adapter_index: Option<usize>,
}

impl DeviceDescriptor {
    /// The host CPU, treated as a single device with `threads` compute units.
    pub fn host_cpu(threads: usize) -> Self {
        Self {
            id: usize::MAX,
            name: format!("CPU ({} threads)", threads),
            vendor: String::new(),
            platform: "host".into(),
            class: DeviceClass::Cpu,
            compute_units: threads.max(1) as u32,
            clock_mhz: HOST_CPU_CLOCK_MHZ,
            vector_width: 4,
            memory_bytes: 0,
            max_work_group_size: 1,
            features: DeviceFeatures {
                double_precision: true,
                unified_memory: true,
            },
            adapter_index: None,
        }
    }
}

/// Lifecycle state of a functor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctorState {
    Created,
    Bound,
    ResourcesAllocated,
    Running,
    PostRun,
    Released,
    Failed,
}

/// State machine shared by functor implementations.
///
/// Tracks the functor state and which sub-batches failed.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: FunctorState,
    failed_batches: Vec<bool>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: FunctorState::Created,
            failed_batches: Vec::new(),
        }
    }

    pub fn state(&self) -> FunctorState {
        self.state
    }

    /// Check that `op` may run in the current state.
    pub fn require(&self, op: &str, allowed: &[FunctorState]) -> Result<(), ComputeError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ComputeError::precondition(format!(
                "{} called in state {:?} (expected one of {:?})",
                op, self.state, allowed
            )))
        }
    }

    /// Check `op` against `allowed`, then move to `next`.
    pub fn advance(
        &mut self,
        op: &str,
        allowed: &[FunctorState],
        next: FunctorState,
    ) -> Result<(), ComputeError> {
        self.require(op, allowed)?;
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.state = FunctorState::Failed;
    }

    pub fn is_failed(&self) -> bool {
        self.state == FunctorState::Failed
    }

    /// Reset the per-batch failure flags for `count` batches.
    pub fn set_batches(&mut self, count: usize) {
        self.failed_batches = vec![false; count];
    }

    pub fn fail_batch(&mut self, index: usize) {
        if let Some(flag) = self.failed_batches.get_mut(index) {
            *flag = true;
        }
    }

    /// True if batch `index` failed, does not exist, or the whole functor failed.
    pub fn batch_failed(&self, index: usize) -> bool {
        self.is_failed() || self.failed_batches.get(index).copied().unwrap_or(true)
    }

    /// Enter `Released`, unless the functor has failed (it stays `Failed`).
    pub fn release(&mut self) {
        if self.state != FunctorState::Failed {
            self.state = FunctorState::Released;
        }
    }
}

/// Number of batches of at most `batch_lines` lines covering `lines` lines.
pub fn batch_count(lines: usize, batch_lines: usize) -> usize {
    lines.div_ceil(batch_lines.max(1))
}

/// Partition-local line range of batch `index`.
pub fn batch_local_range(lines: usize, batch_lines: usize, index: usize) -> Range<usize> {
    let batch_lines = batch_lines.max(1);
    let start = (index * batch_lines).min(lines);
    start..(start + batch_lines).min(lines)
}

/// Log non-finite result points found on `device`.
///
/// The kernel's degeneracy policy keeps results finite, so any hit here is
/// worth a warning but does not fail the partition.
pub fn report_non_finite(device: &DeviceDescriptor, non_finite: usize) {
    if non_finite > 0 {
        let e = ComputeError::new(
            ErrorKind::NumericDegeneracy,
            format!("{}: {} non-finite points in results", device.name, non_finite),
        );
        log::warn!("{}", e);
    }
}

/// Everything a functor needs to run its partition.
#[derive(Debug, Clone)]
pub struct BindParams<T> {
    /// Point charges, shared read-only by every functor of the run.
    pub charges: Arc<[PointCharge<T>]>,
    /// Total number of lines in the run.
    pub line_count: usize,
    /// Global line indices assigned to this functor.
    pub range: Range<usize>,
    pub config: IntegratorConfig,
    /// Run-wide progress record.
    pub monitor: Arc<AggregatePerf>,
}

impl<T: Real> BindParams<T> {
    /// Check the parameters against the line buffer they will be used with.
    pub fn validate(&self, lines: &FieldLines<T>) -> Result<(), ComputeError> {
        let needed = self.line_count * lines.steps();
        if lines.capacity() < needed {
            return Err(ComputeError::invalid_argument(format!(
                "line buffer holds {} points, {} lines x {} steps need {}",
                lines.capacity(),
                self.line_count,
                lines.steps(),
                needed
            )));
        }
        if self.range.start > self.range.end || self.range.end > self.line_count {
            return Err(ComputeError::invalid_argument(format!(
                "line range {:?} outside 0..{}",
                self.range, self.line_count
            )));
        }
        if self.charges.is_empty() {
            return Err(ComputeError::invalid_argument("no point charges bound"));
        }
        if !(self.config.resolution.is_finite() && self.config.resolution > 0.0) {
            return Err(ComputeError::invalid_argument(format!(
                "resolution must be positive, got {}",
                self.config.resolution
            )));
        }
        Ok(())
    }
}

/// A unit of work bound to one device and one partition.
///
/// # Lifecycle
///
/// Methods must be called in the order `bind_data`, `allocate_resources`,
/// `main_functor` (once per batch), `aux_functor`, `post_run`,
/// `release_resources`. Out-of-order calls are precondition violations and
/// return an error. `release_resources` is the exception: it is valid in
/// every state, idempotent, and the only cleanup a failed functor needs.
/// Resources are also released when the functor is dropped.
pub trait ComputeFunctor<T: Real>: Send {
    /// The device this functor runs on.
    fn descriptor(&self) -> &DeviceDescriptor;

    fn state(&self) -> FunctorState;

    /// Validate the inputs and take what the functor needs from them.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if `lines` is too small for
    /// `params.line_count` lines or the range is out of bounds.
    fn bind_data(&mut self, lines: &FieldLines<T>, params: BindParams<T>) -> Result<(), ComputeError>;

    /// Acquire device buffers, queues and the compiled kernel.
    ///
    /// On refusal the functor enters `Failed` and returns
    /// [`ErrorKind::ResourceExhausted`].
    fn allocate_resources(&mut self) -> Result<(), ComputeError>;

    /// Number of sub-batches `main_functor` expects. Known after allocation.
    fn batch_count(&self) -> usize;

    /// Global line indices covered by batch `index`.
    fn batch_range(&self, index: usize) -> Range<usize>;

    /// Integrate batch `index`, blocking until it completes.
    fn main_functor(&mut self, index: usize, device_index: usize) -> Result<(), ComputeError>;

    /// Optional pass after all batches, before `post_run`.
    fn aux_functor(&mut self) -> Result<(), ComputeError> {
        Ok(())
    }

    /// Copy results into the shared buffer and record final timings.
    fn post_run(&mut self, lines: &mut FieldLines<T>) -> Result<(), ComputeError>;

    /// Release everything acquired in `allocate_resources`.
    fn release_resources(&mut self);

    /// True if the functor is in the `Failed` state.
    fn fail(&self) -> bool;

    /// True if batch `index` failed (or the whole functor did).
    fn fail_on_functor(&self, index: usize) -> bool;

    fn recorder(&self) -> &PerformanceRecorder;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_rejects_out_of_order_calls() {
        let mut lc = Lifecycle::new();
        let err = lc
            .advance("allocate_resources", &[FunctorState::Bound], FunctorState::ResourcesAllocated)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert_eq!(lc.state(), FunctorState::Created);

        lc.advance("bind_data", &[FunctorState::Created], FunctorState::Bound).unwrap();
        assert_eq!(lc.state(), FunctorState::Bound);
    }

    #[test]
    fn test_failed_state_survives_release() {
        let mut lc = Lifecycle::new();
        lc.set_batches(3);
        assert!(!lc.batch_failed(1));
        lc.fail_batch(1);
        assert!(lc.batch_failed(1));
        assert!(!lc.batch_failed(0));
        assert!(lc.batch_failed(7));

        lc.fail();
        lc.release();
        assert!(lc.is_failed());
        assert!(lc.batch_failed(0));
    }

    #[test]
    fn test_batch_ranges_cover_partition() {
        assert_eq!(batch_count(10, 4), 3);
        assert_eq!(batch_count(0, 4), 0);
        assert_eq!(batch_local_range(10, 4, 0), 0..4);
        assert_eq!(batch_local_range(10, 4, 2), 8..10);
        assert_eq!(batch_local_range(10, 4, 5), 10..10);
    }

    #[test]
    fn test_error_display_names_kind() {
        let e = ComputeError::resource_exhausted("GPU 0: out of memory");
        assert_eq!(e.to_string(), "Resource exhausted: GPU 0: out of memory");
    }

    #[test]
    fn test_bind_params_validation() {
        let lines = FieldLines::<f64>::new(8, 10).unwrap();
        let charges: Arc<[PointCharge<f64>]> =
            vec![PointCharge::new(electromag_core::Vec3::zeros(), 1.0)].into();
        let mut params = BindParams {
            charges,
            line_count: 8,
            range: 2..6,
            config: IntegratorConfig::default(),
            monitor: Arc::new(AggregatePerf::new(8)),
        };
        assert!(params.validate(&lines).is_ok());

        params.line_count = 9;
        assert_eq!(params.validate(&lines).unwrap_err().kind, ErrorKind::InvalidArgument);

        params.line_count = 8;
        params.range = 4..9;
        assert!(params.validate(&lines).is_err());
    }
}
