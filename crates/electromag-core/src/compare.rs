//! Cross-backend result comparison.
//!
//! Two backends fed the same charges and seeds should trace the same lines.
//! [`ResultComparator`] walks every line of two buffers step by step and
//! records the first step at which they drift apart by more than a
//! threshold. Partial divergence is expected (chaotic lines near charges
//! amplify rounding differences), so the output is a list of records rather
//! than a verdict.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::FieldError;
use crate::types::{FieldLines, PointDisplay, Real, Vec3};

/// Default divergence threshold, in simulation length units.
pub const DEFAULT_DIVERGENCE_THRESHOLD: f64 = 0.1;

/// The first divergence found on one line.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceRecord<T> {
    pub line: usize,
    /// First step whose points are farther apart than the threshold.
    pub step: usize,
    /// Points of both sets at `step - 1`.
    pub last_agreeing: (Vec3<T>, Vec3<T>),
    /// Points of both sets at `step`.
    pub diverging: (Vec3<T>, Vec3<T>),
    /// 3D offset at `step`.
    pub distance: f64,
    /// 3D offset at `step - 1`.
    pub prior_offset: f64,
}

/// Result of comparing two buffers.
#[derive(Debug, Clone)]
pub struct Comparison<T> {
    /// One record per diverging line, in line order.
    pub records: Vec<DivergenceRecord<T>>,
    /// Lines traced in both buffers and walked.
    pub lines_compared: usize,
    /// Lines missing from at least one buffer.
    pub lines_skipped: usize,
}

impl<T> Comparison<T> {
    pub fn is_clean(&self) -> bool {
        self.records.is_empty()
    }
}

/// Compares two field-line buffers point by point.
#[derive(Debug, Clone, Copy)]
pub struct ResultComparator {
    threshold: f64,
}

impl Default for ResultComparator {
    fn default() -> Self {
        Self::new(DEFAULT_DIVERGENCE_THRESHOLD)
    }
}

impl ResultComparator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Walk every line of `a` and `b` and report the first divergence per line.
    ///
    /// Step 0 is the shared seed, so the walk starts at step 1. Walking a
    /// line stops at its first divergence. Lines not traced in both buffers
    /// are skipped and counted.
    pub fn compare<T: Real>(
        &self,
        a: &FieldLines<T>,
        b: &FieldLines<T>,
    ) -> Result<Comparison<T>, FieldError> {
        if a.line_count() != b.line_count() || a.steps() != b.steps() {
            return Err(FieldError::InvalidArgument(format!(
                "cannot compare {} lines x {} steps with {} lines x {} steps",
                a.line_count(),
                a.steps(),
                b.line_count(),
                b.steps()
            )));
        }
        if self.threshold.is_nan() || self.threshold < 0.0 {
            return Err(FieldError::InvalidArgument(format!(
                "divergence threshold must be non-negative, got {}",
                self.threshold
            )));
        }

        let mut records = Vec::new();
        let mut lines_compared = 0;
        let mut lines_skipped = 0;

        for line in 0..a.line_count() {
            if !(a.is_traced(line) && b.is_traced(line)) {
                lines_skipped += 1;
                continue;
            }
            lines_compared += 1;

            for step in 1..a.steps() {
                let (pa, pb) = (a.get(step, line), b.get(step, line));
                let distance = pa.metric_distance(&pb).to_f64();
                // NaN on either side counts as divergence.
                if distance.is_nan() || distance > self.threshold {
                    let (qa, qb) = (a.get(step - 1, line), b.get(step - 1, line));
                    records.push(DivergenceRecord {
                        line,
                        step,
                        last_agreeing: (qa, qb),
                        diverging: (pa, pb),
                        distance,
                        prior_offset: qa.metric_distance(&qb).to_f64(),
                    });
                    break;
                }
            }
        }

        log::debug!(
            "compared {} lines ({} skipped): {} diverging",
            lines_compared,
            lines_skipped,
            records.len()
        );

        Ok(Comparison {
            records,
            lines_compared,
            lines_skipped,
        })
    }
}

/// Write one text block per divergence record, in the order given.
pub fn write_report<T: Real, W: Write>(
    records: &[DivergenceRecord<T>],
    mut out: W,
) -> io::Result<()> {
    for r in records {
        let prev = r.step - 1;
        writeln!(out, " good [{}][{}] {}", r.line, prev, PointDisplay(&r.last_agreeing.0))?;
        writeln!(out, " bad  [{}][{}] {}", r.line, prev, PointDisplay(&r.last_agreeing.1))?;
        writeln!(out, " 3D offset: {:.6}", r.prior_offset)?;
        writeln!(out, " good [{}][{}] {}", r.line, r.step, PointDisplay(&r.diverging.0))?;
        writeln!(out, " bad  [{}][{}] {}", r.line, r.step, PointDisplay(&r.diverging.1))?;
        writeln!(out, " 3D offset: {:.6}", r.distance)?;
        writeln!(out)?;
    }
    out.flush()
}

/// Write the divergence report to `path`, creating parent directories.
pub fn write_report_file<T: Real>(
    records: &[DivergenceRecord<T>],
    path: &Path,
) -> Result<(), FieldError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_report(records, BufWriter::new(file))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_lines(lines: usize, steps: usize) -> FieldLines<f64> {
        let mut buf = FieldLines::new(lines, steps).unwrap();
        for l in 0..lines {
            let pts: Vec<Vec3<f64>> = (0..steps)
                .map(|s| Vec3::new(l as f64, s as f64, 0.5))
                .collect();
            buf.write_line(l, &pts);
        }
        buf
    }

    #[test]
    fn test_identical_sets_report_nothing() {
        let a = straight_lines(8, 20);
        let cmp = ResultComparator::default().compare(&a, &a.clone()).unwrap();
        assert!(cmp.is_clean());
        assert_eq!(cmp.lines_compared, 8);
        assert_eq!(cmp.lines_skipped, 0);
    }

    #[test]
    fn test_single_divergence_is_located() {
        let a = straight_lines(8, 20);
        let mut b = a.clone();
        for step in 10..20 {
            let p = b.get(step, 5);
            b.set(step, 5, p + Vec3::new(0.5, 0.0, 0.0));
        }

        let cmp = ResultComparator::new(0.1).compare(&a, &b).unwrap();
        assert_eq!(cmp.records.len(), 1);
        let r = &cmp.records[0];
        assert_eq!((r.line, r.step), (5, 10));
        assert!((r.distance - 0.5).abs() < 1e-12);
        assert_eq!(r.prior_offset, 0.0);
        assert_eq!(r.last_agreeing.0, a.get(9, 5));
        assert_eq!(r.diverging.1, b.get(10, 5));
    }

    #[test]
    fn test_offset_below_threshold_is_ignored() {
        let a = straight_lines(2, 5);
        let mut b = a.clone();
        b.set(3, 1, b.get(3, 1) + Vec3::new(0.05, 0.0, 0.0));
        assert!(ResultComparator::new(0.1).compare(&a, &b).unwrap().is_clean());
    }

    #[test]
    fn test_untraced_lines_are_skipped() {
        let a = straight_lines(3, 5);
        let mut b = FieldLines::new(3, 5).unwrap();
        b.copy_lines_from(&a, 0, 2).unwrap();
        let cmp = ResultComparator::default().compare(&a, &b).unwrap();
        assert!(cmp.is_clean());
        assert_eq!(cmp.lines_compared, 2);
        assert_eq!(cmp.lines_skipped, 1);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let a = straight_lines(3, 5);
        let b = straight_lines(3, 6);
        assert!(matches!(
            ResultComparator::default().compare(&a, &b),
            Err(FieldError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_report_block_contains_both_pairs() {
        let a = straight_lines(2, 4);
        let mut b = a.clone();
        b.set(2, 1, Vec3::new(9.0, 9.0, 9.0));
        let cmp = ResultComparator::default().compare(&a, &b).unwrap();

        let mut text = Vec::new();
        write_report(&cmp.records, &mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains(" good [1][1]"));
        assert!(text.contains(" bad  [1][2] x: 9.000000 y: 9.000000 z: 9.000000"));
        assert_eq!(text.matches("3D offset").count(), 2);
    }
}
