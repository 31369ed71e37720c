//! Core types shared across the ElectroMag engine.
//!
//! This module defines the scalar abstraction used to pick single or double
//! precision for a run, the 3-vector, point charges, and the field-line
//! buffer that every backend writes into.

use std::fmt;
use std::ops::Range;

use nalgebra::{RealField, Vector3};
use ndarray::{s, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// Floating-point precision of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    /// Size of one scalar in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Single => write!(f, "single"),
            Precision::Double => write!(f, "double"),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Scalar type of a run, implemented for `f32` and `f64` only.
///
/// Every buffer, charge set and kernel in a run shares one `Real`, so
/// comparing results of different precisions does not type-check.
pub trait Real: sealed::Sealed + RealField + Copy + Default {
    const PRECISION: Precision;

    fn to_f64(self) -> f64;
}

impl Real for f32 {
    const PRECISION: Precision = Precision::Single;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    const PRECISION: Precision = Precision::Double;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Convert an `f64` constant into the run's scalar type.
#[inline]
pub fn real<T: Real>(value: f64) -> T {
    nalgebra::convert(value)
}

/// A position or direction in 3D space (simulation length units).
pub type Vec3<T> = Vector3<T>;

/// True when all three components are finite.
#[inline]
pub fn is_finite_point<T: Real>(p: &Vec3<T>) -> bool {
    p.iter().all(|c| c.is_finite())
}

/// `Display` adapter printing a point as `x: .. y: .. z: ..`.
pub struct PointDisplay<'a, T>(pub &'a Vec3<T>);

impl<T: Real> fmt::Display for PointDisplay<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x: {:.6} y: {:.6} z: {:.6}",
            self.0.x.to_f64(),
            self.0.y.to_f64(),
            self.0.z.to_f64()
        )
    }
}

/// A fixed electric charge contributing to the field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: nalgebra::Scalar + Serialize",
    deserialize = "T: nalgebra::Scalar + Deserialize<'de>"
))]
pub struct PointCharge<T> {
    pub position: Vec3<T>,
    pub magnitude: T,
}

impl<T: Real> PointCharge<T> {
    pub fn new(position: Vec3<T>, magnitude: T) -> Self {
        Self { position, magnitude }
    }
}

/// Field-line buffer indexed `[step][line]`.
///
/// Step 0 of every line holds its seed. A line is marked traced once a
/// backend has written all of its steps; lines belonging to a failed
/// partition stay untraced so that consumers can tell missing coverage
/// apart from real data.
#[derive(Debug, Clone)]
pub struct FieldLines<T> {
    points: Array2<Vec3<T>>,
    traced: Vec<bool>,
}

impl<T: Real> FieldLines<T> {
    /// Allocate a zeroed buffer for `lines` lines of `steps` steps each.
    pub fn new(lines: usize, steps: usize) -> Result<Self, FieldError> {
        if steps == 0 {
            return Err(FieldError::InvalidArgument(
                "field lines need at least one step".into(),
            ));
        }
        Ok(Self {
            points: Array2::from_elem((steps, lines), Vec3::zeros()),
            traced: vec![false; lines],
        })
    }

    pub fn line_count(&self) -> usize {
        self.points.ncols()
    }

    pub fn steps(&self) -> usize {
        self.points.nrows()
    }

    /// Number of points the buffer can hold (`lines × steps`).
    pub fn capacity(&self) -> usize {
        self.points.len()
    }

    pub fn get(&self, step: usize, line: usize) -> Vec3<T> {
        self.points[[step, line]]
    }

    pub fn set(&mut self, step: usize, line: usize, point: Vec3<T>) {
        self.points[[step, line]] = point;
    }

    pub fn seed(&self, line: usize) -> Vec3<T> {
        self.points[[0, line]]
    }

    pub fn set_seed(&mut self, line: usize, point: Vec3<T>) {
        self.points[[0, line]] = point;
    }

    /// Seeds of a contiguous range of lines.
    pub fn seeds(&self, range: Range<usize>) -> Vec<Vec3<T>> {
        self.points.slice(s![0, range]).to_vec()
    }

    /// All steps of one line, in order.
    pub fn line(&self, line: usize) -> ArrayView1<'_, Vec3<T>> {
        self.points.column(line)
    }

    /// Store a complete line and mark it traced.
    ///
    /// # Panics
    /// Panics if `points.len()` differs from the step count.
    pub fn write_line(&mut self, line: usize, points: &[Vec3<T>]) {
        assert_eq!(
            points.len(),
            self.steps(),
            "line {} has {} points, buffer expects {}",
            line,
            points.len(),
            self.steps()
        );
        self.points
            .column_mut(line)
            .assign(&ArrayView1::from(points));
        self.traced[line] = true;
    }

    /// Copy lines `start..start + count` (points and traced flags) from
    /// another buffer of the same shape.
    pub fn copy_lines_from(
        &mut self,
        other: &FieldLines<T>,
        start: usize,
        count: usize,
    ) -> Result<(), FieldError> {
        if other.points.dim() != self.points.dim() {
            return Err(FieldError::InvalidArgument(format!(
                "shape mismatch: {:?} vs {:?}",
                self.points.dim(),
                other.points.dim()
            )));
        }
        let end = start + count;
        if end > self.line_count() {
            return Err(FieldError::InvalidArgument(format!(
                "line range {}..{} exceeds {} lines",
                start,
                end,
                self.line_count()
            )));
        }
        self.points
            .slice_mut(s![.., start..end])
            .assign(&other.points.slice(s![.., start..end]));
        self.traced[start..end].copy_from_slice(&other.traced[start..end]);
        Ok(())
    }

    pub fn mark_traced(&mut self, line: usize) {
        self.traced[line] = true;
    }

    pub fn is_traced(&self, line: usize) -> bool {
        self.traced[line]
    }

    pub fn traced_count(&self) -> usize {
        self.traced.iter().filter(|&&t| t).count()
    }

    /// Contiguous ranges of lines that no backend has written.
    pub fn untraced_lines(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut open: Option<usize> = None;
        for (i, &traced) in self.traced.iter().enumerate() {
            match (traced, open) {
                (false, None) => open = Some(i),
                (true, Some(start)) => {
                    ranges.push(start..i);
                    open = None;
                }
                _ => {}
            }
        }
        if let Some(start) = open {
            ranges.push(start..self.traced.len());
        }
        ranges
    }

    /// True when every point of every traced line is finite.
    pub fn all_finite(&self) -> bool {
        (0..self.line_count())
            .filter(|&l| self.traced[l])
            .all(|l| self.points.column(l).iter().all(is_finite_point))
    }

    /// The raw `(steps, lines)` array, for rendering and export.
    pub fn as_array(&self) -> &Array2<Vec3<T>> {
        &self.points
    }
}
