//! Field-line integration kernel.
//!
//! Every line starts at its seed and is advanced step by step along the
//! normalised electric field
//!
//! $$
//! \mathbf{E}(\mathbf{r}) = \sum_k q_k \frac{\mathbf{r} - \mathbf{r}_k}{|\mathbf{r} - \mathbf{r}_k|^3}
//! $$
//!
//! Lines are independent of each other; steps within one line are strictly
//! sequential. Backends parallelise over lines only.
//!
//! # Edge-case policy
//!
//! - **Degenerate field** (magnitude below the configured floor, or
//!   non-finite): [`DegeneracyPolicy::HoldDirection`] keeps advancing along
//!   the previous direction; [`DegeneracyPolicy::Terminate`] ends the line.
//!   A seed sitting on a neutral point has no previous direction and always
//!   terminates.
//! - **Curvature**: the direction at the candidate next point is compared
//!   with the current direction. If the angle exceeds the configured
//!   maximum, [`CurvaturePolicy::Refine`] halves the advance and retries,
//!   accepting the shortest step once the refinements are used up, while
//!   [`CurvaturePolicy::Terminate`] ends the line.
//! - **Termination** pads the remaining steps with the last stored position.

use crate::types::{real, PointCharge, Real, Vec3};

/// Floating-point operations per charge per field evaluation.
pub const FLOPS_PER_CHARGE: u64 = 18;

/// Floating-point operations per step outside the charge loop
/// (normalisation, advance, curvature dot product).
pub const FLOPS_PER_STEP: u64 = 20;

/// Squared distance below which a charge is skipped as self-interaction.
pub const SELF_INTERACTION_EPS: f64 = 1e-12;

/// Default field magnitude below which the field counts as degenerate.
pub const DEFAULT_DEGENERATE_FIELD: f64 = 1e-6;

/// What to do when the field direction changes too sharply between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurvaturePolicy {
    /// Halve the advance distance and retry, at most `max_refinements` times.
    Refine { max_refinements: u32 },
    /// End the line and pad the remaining steps.
    Terminate,
}

/// Curvature tracking configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvatureConfig {
    pub enabled: bool,
    /// Maximum angle between successive directions (radians).
    pub max_angle: f64,
    pub policy: CurvaturePolicy,
}

impl Default for CurvatureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_angle: 30.0_f64.to_radians(),
            policy: CurvaturePolicy::Refine { max_refinements: 4 },
        }
    }
}

impl CurvatureConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// What to do when the field vanishes or becomes non-finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegeneracyPolicy {
    #[default]
    HoldDirection,
    Terminate,
}

/// Integration parameters shared by every backend of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegratorConfig {
    /// Advance distance per step (simulation length units).
    pub resolution: f64,
    pub curvature: CurvatureConfig,
    pub degeneracy: DegeneracyPolicy,
    /// Field magnitude floor for the degeneracy check.
    pub degenerate_field: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            curvature: CurvatureConfig::default(),
            degeneracy: DegeneracyPolicy::default(),
            degenerate_field: DEFAULT_DEGENERATE_FIELD,
        }
    }
}

/// What happened while tracing one line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineOutcome {
    /// First padded step, if the line ended early.
    pub terminated_at: Option<usize>,
    /// Number of step halvings performed.
    pub refinements: u32,
    /// Number of degenerate field evaluations encountered.
    pub degenerate_steps: u32,
}

/// Aggregated outcomes over many lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub lines: usize,
    pub terminated: usize,
    pub refinements: u64,
    pub degenerate_steps: u64,
}

impl LineStats {
    pub fn record(&mut self, outcome: &LineOutcome) {
        self.lines += 1;
        if outcome.terminated_at.is_some() {
            self.terminated += 1;
        }
        self.refinements += u64::from(outcome.refinements);
        self.degenerate_steps += u64::from(outcome.degenerate_steps);
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            lines: self.lines + other.lines,
            terminated: self.terminated + other.terminated,
            refinements: self.refinements + other.refinements,
            degenerate_steps: self.degenerate_steps + other.degenerate_steps,
        }
    }
}

impl From<LineOutcome> for LineStats {
    fn from(outcome: LineOutcome) -> Self {
        let mut stats = LineStats::default();
        stats.record(&outcome);
        stats
    }
}

/// Nominal floating-point work of a run, used for GFLOP/s accounting.
pub fn nominal_flops(lines: usize, steps: usize, charges: usize) -> u64 {
    let per_step = charges as u64 * FLOPS_PER_CHARGE + FLOPS_PER_STEP;
    lines as u64 * steps.saturating_sub(1) as u64 * per_step
}

/// The field-line kernel, bound to one charge set and configuration.
#[derive(Debug, Clone)]
pub struct FieldIntegrator<'a, T> {
    charges: &'a [PointCharge<T>],
    resolution: T,
    curvature: CurvatureConfig,
    cos_max: T,
    degeneracy: DegeneracyPolicy,
    degenerate_field: T,
    self_interaction: T,
}

impl<'a, T: Real> FieldIntegrator<'a, T> {
    pub fn new(charges: &'a [PointCharge<T>], config: &IntegratorConfig) -> Self {
        Self {
            charges,
            resolution: real(config.resolution),
            curvature: config.curvature,
            cos_max: real(config.curvature.max_angle.cos()),
            degeneracy: config.degeneracy,
            degenerate_field: real(config.degenerate_field),
            self_interaction: real(SELF_INTERACTION_EPS),
        }
    }

    /// Resultant field at `position` by Coulomb superposition.
    pub fn field_at(&self, position: Vec3<T>) -> Vec3<T> {
        let mut field = Vec3::zeros();
        for charge in self.charges {
            let r = position - charge.position;
            let r_sq = r.norm_squared();
            if r_sq < self.self_interaction {
                continue;
            }
            field += r * (charge.magnitude / (r_sq * r_sq.sqrt()));
        }
        field
    }

    /// Unit field direction, or `None` if the field is degenerate.
    pub fn direction_at(&self, position: Vec3<T>) -> Option<Vec3<T>> {
        let field = self.field_at(position);
        let len = field.norm();
        if !len.is_finite() || len < self.degenerate_field {
            return None;
        }
        Some(field / len)
    }

    /// Trace one line from `seed`, filling every slot of `out`.
    ///
    /// `out[0]` receives the seed; `out.len()` is the step count.
    pub fn trace_line(&self, seed: Vec3<T>, out: &mut [Vec3<T>]) -> LineOutcome {
        let mut outcome = LineOutcome::default();
        let Some(first) = out.first_mut() else {
            return outcome;
        };
        *first = seed;

        let mut pos = seed;
        let mut dir = match self.direction_at(seed) {
            Some(d) => d,
            None => {
                outcome.degenerate_steps += 1;
                pad(out, 1, pos, &mut outcome);
                return outcome;
            }
        };

        let half: T = real(0.5);
        for step in 1..out.len() {
            let mut h = self.resolution;
            let mut next = pos + dir * h;
            let mut next_dir = self.direction_at(next);

            if self.curvature.enabled {
                let mut refinements = 0;
                while let Some(nd) = next_dir {
                    if nd.dot(&dir) >= self.cos_max {
                        break;
                    }
                    match self.curvature.policy {
                        CurvaturePolicy::Terminate => {
                            pad(out, step, pos, &mut outcome);
                            return outcome;
                        }
                        CurvaturePolicy::Refine { max_refinements } => {
                            if refinements >= max_refinements {
                                break;
                            }
                            refinements += 1;
                            h = h * half;
                            next = pos + dir * h;
                            next_dir = self.direction_at(next);
                        }
                    }
                }
                outcome.refinements += refinements;
            }

            out[step] = next;
            pos = next;

            match next_dir {
                Some(d) => dir = d,
                None => {
                    outcome.degenerate_steps += 1;
                    if self.degeneracy == DegeneracyPolicy::Terminate {
                        pad(out, step + 1, pos, &mut outcome);
                        return outcome;
                    }
                }
            }
        }

        outcome
    }

    /// Trace consecutive lines into a line-major buffer.
    ///
    /// `out` holds `seeds.len()` chunks of `steps` points each.
    pub fn integrate_lines(&self, seeds: &[Vec3<T>], out: &mut [Vec3<T>], steps: usize) -> LineStats {
        let mut stats = LineStats::default();
        for (seed, line) in seeds.iter().zip(out.chunks_mut(steps)) {
            stats.record(&self.trace_line(*seed, line));
        }
        stats
    }
}

fn pad<T: Real>(out: &mut [Vec3<T>], from: usize, last: Vec3<T>, outcome: &mut LineOutcome) {
    if from < out.len() {
        out[from..].fill(last);
        outcome.terminated_at = Some(from);
    }
}
