//! Capability-weighted split of the line set across devices.

use std::ops::Range;

use crate::backend::{ComputeError, DeviceDescriptor};

/// A contiguous block of lines assigned to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Index into the device list the partition was computed for.
    pub device: usize,
    pub start: usize,
    pub count: usize,
}

impl Partition {
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Relative throughput weight: `compute_units × clock_mhz × vector_width`.
///
/// Each factor counts as at least 1, so every device gets a positive weight.
pub fn capability_score(device: &DeviceDescriptor) -> u64 {
    u64::from(device.compute_units.max(1))
        * u64::from(device.clock_mhz.max(1))
        * u64::from(device.vector_width.max(1))
}

/// Split `total_lines` lines across `devices` in proportion to their scores.
///
/// Each device first receives the floor of its exact share. The lines left
/// over (fewer than the number of devices) go one each to the highest
/// scoring devices, ties broken by position in `devices`. Partitions are
/// contiguous, in device order, and cover `0..total_lines` exactly once.
pub fn partition_lines(
    total_lines: usize,
    devices: &[DeviceDescriptor],
) -> Result<Vec<Partition>, ComputeError> {
    if devices.is_empty() {
        return Err(ComputeError::invalid_argument(format!(
            "cannot partition {} lines across zero devices",
            total_lines
        )));
    }

    let weights: Vec<u128> = devices.iter().map(|d| u128::from(capability_score(d))).collect();
    let weight_sum: u128 = weights.iter().sum();

    let mut counts: Vec<usize> = weights
        .iter()
        .map(|&w| (total_lines as u128 * w / weight_sum) as usize)
        .collect();
    let remainder = total_lines - counts.iter().sum::<usize>();

    let mut order: Vec<usize> = (0..devices.len()).collect();
    order.sort_by(|&a, &b| weights[b].cmp(&weights[a]).then(a.cmp(&b)));
    for &i in order.iter().take(remainder) {
        counts[i] += 1;
    }

    let mut start = 0;
    let partitions = counts
        .into_iter()
        .enumerate()
        .map(|(device, count)| {
            let p = Partition { device, start, count };
            start += count;
            p
        })
        .collect::<Vec<_>>();

    for (p, d) in partitions.iter().zip(devices) {
        log::debug!("{}: lines {:?} ({} lines)", d.name, p.range(), p.count);
    }
    Ok(partitions)
}
