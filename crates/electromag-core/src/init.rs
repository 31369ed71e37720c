//! Charge placement and field-line seeding.
//!
//! Both initialisers come in a deterministic and a randomised flavour. The
//! randomised flavour is reproducible: it draws from a `ChaCha8Rng` seeded
//! with the policy's seed, so two backends fed from the same policy see the
//! same inputs.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::FieldError;
use crate::types::{real, FieldLines, PointCharge, Real, Vec3};

/// Distance between neighbouring charges on the charge lattice.
pub const CHARGE_SPACING: f64 = 2.0;

/// Height of the first seed layer above the charge plane.
pub const SEED_HEIGHT: f64 = 0.5;

/// Distance between stacked seed layers (`nz > 1`).
pub const SEED_LAYER_SPACING: f64 = 1.0;

/// How charge positions and line seeds are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    Deterministic,
    Randomized { seed: u64 },
}

impl SeedPolicy {
    /// Randomised policy with a fresh seed drawn from the thread RNG.
    pub fn random() -> Self {
        SeedPolicy::Randomized { seed: rand::random() }
    }
}

/// Half-width of the square region covered by `count` charges.
pub fn charge_extent(count: usize) -> f64 {
    let side = lattice_side(count);
    0.5 * (side.saturating_sub(1)) as f64 * CHARGE_SPACING
}

fn lattice_side(count: usize) -> usize {
    let mut side = (count as f64).sqrt() as usize;
    while side * side < count {
        side += 1;
    }
    side.max(1)
}

/// Place `count` point charges in the z = 0 plane.
///
/// Deterministic charges sit on a square lattice with alternating ±1
/// magnitudes. Randomised charges are spread uniformly over the same square
/// with magnitudes of random sign in `[0.5, 1.5)`.
pub fn init_point_charges<T: Real>(count: usize, policy: SeedPolicy) -> Vec<PointCharge<T>> {
    let side = lattice_side(count);
    let half = charge_extent(count);

    match policy {
        SeedPolicy::Deterministic => (0..count)
            .map(|i| {
                let (ix, iy) = (i % side, i / side);
                let x = ix as f64 * CHARGE_SPACING - half;
                let y = iy as f64 * CHARGE_SPACING - half;
                let q = if (ix + iy) % 2 == 0 { 1.0 } else { -1.0 };
                PointCharge::new(Vec3::new(real(x), real(y), T::zero()), real(q))
            })
            .collect(),
        SeedPolicy::Randomized { seed } => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let span = half.max(CHARGE_SPACING);
            (0..count)
                .map(|_| {
                    let x = rng.gen_range(-span..=span);
                    let y = rng.gen_range(-span..=span);
                    let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
                    let q = sign * rng.gen_range(0.5..1.5);
                    PointCharge::new(Vec3::new(real(x), real(y), T::zero()), real(q))
                })
                .collect()
        }
    }
}

/// Write seeds for an `nx × ny × nz` lattice into step 0 of `lines`.
///
/// The lattice covers the square `[-extent, extent]²` in x and y, starting
/// at [`SEED_HEIGHT`] above the charge plane. Randomised seeds are jittered
/// inside their lattice cell.
pub fn init_field_lines<T: Real>(
    lines: &mut FieldLines<T>,
    nx: usize,
    ny: usize,
    nz: usize,
    extent: f64,
    policy: SeedPolicy,
) -> Result<(), FieldError> {
    let n = nx * ny * nz;
    if n != lines.line_count() {
        return Err(FieldError::InvalidArgument(format!(
            "seed lattice {}x{}x{} = {} does not match {} lines",
            nx,
            ny,
            nz,
            n,
            lines.line_count()
        )));
    }

    let cell = |count: usize| {
        if count > 1 {
            2.0 * extent / (count - 1) as f64
        } else {
            0.0
        }
    };
    let (dx, dy) = (cell(nx), cell(ny));
    let origin = |count: usize| if count > 1 { -extent } else { 0.0 };
    let (x0, y0) = (origin(nx), origin(ny));

    let mut rng = match policy {
        SeedPolicy::Randomized { seed } => Some(ChaCha8Rng::seed_from_u64(seed)),
        SeedPolicy::Deterministic => None,
    };

    for iz in 0..nz {
        for iy in 0..ny {
            for ix in 0..nx {
                let line = (iz * ny + iy) * nx + ix;
                let mut x = x0 + ix as f64 * dx;
                let mut y = y0 + iy as f64 * dy;
                let z = SEED_HEIGHT + iz as f64 * SEED_LAYER_SPACING;
                if let Some(rng) = rng.as_mut() {
                    x += (rng.gen::<f64>() - 0.5) * dx;
                    y += (rng.gen::<f64>() - 0.5) * dy;
                }
                lines.set_seed(line, Vec3::new(real(x), real(y), real(z)));
            }
        }
    }
    Ok(())
}
