//! Simulation sizes and the named presets.

use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// Size parameters of one run.
///
/// Field lines are seeded on an `nx × ny × nz` lattice, so the line count
/// is the product of the three extents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Preset the parameters came from (informational).
    pub name: String,
    /// Lines along x.
    pub nx: usize,
    /// Lines along y.
    pub ny: usize,
    /// Lines along z.
    pub nz: usize,
    /// Number of static point charges.
    pub static_charges: usize,
    /// Number of dynamic charge elements. Always zero.
    pub dynamic_charges: usize,
    /// Number of steps of every field line, seed included.
    pub steps: usize,
}

struct Preset {
    name: &'static str,
    nx: usize,
    ny: usize,
    nz: usize,
    static_charges: usize,
    steps: usize,
}

const PRESETS: &[Preset] = &[
    Preset { name: "default", nx: 128, ny: 128, nz: 1, static_charges: 1024, steps: 2500 },
    Preset { name: "enhanced", nx: 256, ny: 112, nz: 1, static_charges: 2048, steps: 5000 },
    Preset { name: "extreme", nx: 256, ny: 256, nz: 1, static_charges: 2048, steps: 5000 },
    Preset { name: "insane", nx: 512, ny: 512, nz: 1, static_charges: 2048, steps: 5000 },
    Preset { name: "colossal", nx: 1024, ny: 1024, nz: 1, static_charges: 5120, steps: 10000 },
    Preset { name: "cpu", nx: 64, ny: 64, nz: 1, static_charges: 1000, steps: 1000 },
    Preset { name: "micro", nx: 16, ny: 16, nz: 1, static_charges: 1000, steps: 1000 },
    Preset { name: "bogo", nx: 16, ny: 16, nz: 1, static_charges: 50, steps: 500 },
];

impl SimulationParams {
    /// Look up a named preset.
    pub fn preset(name: &str) -> Result<Self, FieldError> {
        PRESETS
            .iter()
            .find(|p| p.name == name)
            .map(|p| Self {
                name: p.name.to_string(),
                nx: p.nx,
                ny: p.ny,
                nz: p.nz,
                static_charges: p.static_charges,
                dynamic_charges: 0,
                steps: p.steps,
            })
            .ok_or_else(|| FieldError::UnknownPreset {
                name: name.to_string(),
                available: preset_names().join(", "),
            })
    }

    /// Total number of field lines.
    pub fn line_count(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Check that the parameters describe a runnable simulation.
    pub fn validate(&self) -> Result<(), FieldError> {
        if self.line_count() == 0 {
            return Err(FieldError::InvalidArgument(format!(
                "line lattice {}x{}x{} is empty",
                self.nx, self.ny, self.nz
            )));
        }
        if self.static_charges == 0 {
            return Err(FieldError::InvalidArgument(
                "at least one static charge is required".into(),
            ));
        }
        if self.dynamic_charges != 0 {
            return Err(FieldError::InvalidArgument(
                "dynamic charges are not supported".into(),
            ));
        }
        if self.steps < 2 {
            return Err(FieldError::InvalidArgument(format!(
                "step count must be at least 2, got {}",
                self.steps
            )));
        }
        Ok(())
    }
}

impl Default for SimulationParams {
    fn default() -> Self {
        let p = &PRESETS[0];
        Self {
            name: p.name.to_string(),
            nx: p.nx,
            ny: p.ny,
            nz: p.nz,
            static_charges: p.static_charges,
            dynamic_charges: 0,
            steps: p.steps,
        }
    }
}

/// Names of all presets, in table order.
pub fn preset_names() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.name).collect()
}

/// All presets, in table order.
pub fn presets() -> Vec<SimulationParams> {
    PRESETS
        .iter()
        .filter_map(|p| SimulationParams::preset(p.name).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_lookup() {
        let micro = SimulationParams::preset("micro").unwrap();
        assert_eq!(micro.line_count(), 256);
        assert_eq!(micro.static_charges, 1000);
        assert_eq!(micro.steps, 1000);
        assert_eq!(micro.dynamic_charges, 0);
    }

    #[test]
    fn test_largest_preset() {
        let p = SimulationParams::preset("colossal").unwrap();
        assert_eq!(p.line_count(), 1024 * 1024);
        assert_eq!(p.static_charges, 5120);
        assert_eq!(p.steps, 10000);
        assert!(p.validate().is_ok());
        let biggest = presets().into_iter().max_by_key(|p| p.line_count()).unwrap();
        assert_eq!(biggest.name, "colossal");
    }

    #[test]
    fn test_unknown_preset_lists_alternatives() {
        let err = SimulationParams::preset("huge").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'huge'"));
        assert!(msg.contains("bogo"));
    }

    #[test]
    fn test_default_is_first_preset() {
        assert_eq!(SimulationParams::default().name, "default");
        assert_eq!(presets().len(), preset_names().len());
    }

    #[test]
    fn test_validate_rejects_dynamic_charges() {
        let mut p = SimulationParams::preset("bogo").unwrap();
        assert!(p.validate().is_ok());
        p.dynamic_charges = 3;
        assert!(p.validate().is_err());
    }
}
