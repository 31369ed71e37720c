//! # ElectroMag Core
//!
//! The numerical backbone of ElectroMag. This crate traces electric field
//! lines through the superposed Coulomb field of a set of point charges and
//! provides everything a compute backend needs around that kernel, without
//! knowing anything about devices.
//!
//! ## Modules
//!
//! - [`types`]: Scalars, vectors, point charges and the `[step][line]`
//!   field-line buffer.
//! - [`params`]: Simulation sizes and the named presets.
//! - [`init`]: Charge placement and field-line seeding.
//! - [`integrator`]: The field-line integration kernel.
//! - [`perf`]: Phase timings, throughput and live progress.
//! - [`compare`]: Cross-backend divergence detection and reporting.

pub mod compare;
pub mod error;
pub mod init;
pub mod integrator;
pub mod params;
pub mod perf;
pub mod types;

pub use error::FieldError;
pub use types::{is_finite_point, real, FieldLines, PointCharge, PointDisplay, Precision, Real, Vec3};
