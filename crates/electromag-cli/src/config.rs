//! TOML configuration deserialisation for field-line jobs.

use anyhow::{Context, Result};
use serde::Deserialize;

use electromag_compute::BackendSelection;
use electromag_core::init::SeedPolicy;
use electromag_core::integrator::{
    CurvatureConfig, CurvaturePolicy, DegeneracyPolicy, IntegratorConfig, DEFAULT_DEGENERATE_FIELD,
};
use electromag_core::params::SimulationParams;
use electromag_core::Precision;

/// Top-level job configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub curvature: CurvatureSection,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub compare: CompareConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Problem size and numerics.
#[derive(Debug, Deserialize)]
pub struct SimulationConfig {
    /// Named preset the sizes start from (default: "default").
    #[serde(default = "default_preset")]
    pub preset: String,
    pub nx: Option<usize>,
    pub ny: Option<usize>,
    pub nz: Option<usize>,
    pub static_charges: Option<usize>,
    pub steps: Option<usize>,
    /// Advance distance per step (default: 1.0).
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    /// Scatter charges randomly instead of on a lattice.
    #[serde(default)]
    pub randomize_charges: bool,
    /// Jitter line seeds inside their lattice cells.
    #[serde(default)]
    pub randomize_seeds: bool,
    /// RNG seed for the randomised placements; drawn fresh if absent.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            nx: None,
            ny: None,
            nz: None,
            static_charges: None,
            steps: None,
            resolution: default_resolution(),
            precision: default_precision(),
            randomize_charges: false,
            randomize_seeds: false,
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// Preset sizes with the explicit overrides applied.
    pub fn params(&self) -> Result<SimulationParams> {
        let mut p = SimulationParams::preset(&self.preset)?;
        if let Some(nx) = self.nx {
            p.nx = nx;
        }
        if let Some(ny) = self.ny {
            p.ny = ny;
        }
        if let Some(nz) = self.nz {
            p.nz = nz;
        }
        if let Some(n) = self.static_charges {
            p.static_charges = n;
        }
        if let Some(steps) = self.steps {
            p.steps = steps;
        }
        p.validate()?;
        Ok(p)
    }

    /// Placement policies for charges and seeds.
    ///
    /// Both randomised policies share one seed so a job is reproducible from
    /// its configuration plus that seed.
    pub fn policies(&self) -> (SeedPolicy, SeedPolicy) {
        let seed = self.seed.unwrap_or_else(rand_seed);
        let pick = |randomize: bool| {
            if randomize {
                SeedPolicy::Randomized { seed }
            } else {
                SeedPolicy::Deterministic
            }
        };
        (pick(self.randomize_charges), pick(self.randomize_seeds))
    }
}

fn rand_seed() -> u64 {
    match SeedPolicy::random() {
        SeedPolicy::Randomized { seed } => seed,
        SeedPolicy::Deterministic => 0,
    }
}

fn default_preset() -> String {
    "default".into()
}
fn default_resolution() -> f64 {
    1.0
}
fn default_precision() -> Precision {
    Precision::Single
}

/// How the kernel reacts to sharp bends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurvatureMode {
    Refine,
    Terminate,
}

/// How the kernel reacts to a vanishing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegeneracyMode {
    Hold,
    Terminate,
}

/// Curvature and degeneracy handling.
#[derive(Debug, Deserialize)]
pub struct CurvatureSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_angle_deg")]
    pub max_angle_deg: f64,
    #[serde(default = "default_curvature_mode")]
    pub policy: CurvatureMode,
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
    #[serde(default = "default_degeneracy_mode")]
    pub degeneracy: DegeneracyMode,
    /// Field magnitude below which the field counts as degenerate.
    #[serde(default = "default_degenerate_field")]
    pub degenerate_field: f64,
}

impl Default for CurvatureSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_angle_deg: default_max_angle_deg(),
            policy: default_curvature_mode(),
            max_refinements: default_max_refinements(),
            degeneracy: default_degeneracy_mode(),
            degenerate_field: default_degenerate_field(),
        }
    }
}

impl CurvatureSection {
    pub fn integrator_config(&self, resolution: f64) -> IntegratorConfig {
        IntegratorConfig {
            resolution,
            curvature: CurvatureConfig {
                enabled: self.enabled,
                max_angle: self.max_angle_deg.to_radians(),
                policy: match self.policy {
                    CurvatureMode::Refine => CurvaturePolicy::Refine {
                        max_refinements: self.max_refinements,
                    },
                    CurvatureMode::Terminate => CurvaturePolicy::Terminate,
                },
            },
            degeneracy: match self.degeneracy {
                DegeneracyMode::Hold => DegeneracyPolicy::HoldDirection,
                DegeneracyMode::Terminate => DegeneracyPolicy::Terminate,
            },
            degenerate_field: self.degenerate_field,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_angle_deg() -> f64 {
    30.0
}
fn default_curvature_mode() -> CurvatureMode {
    CurvatureMode::Refine
}
fn default_max_refinements() -> u32 {
    4
}
fn default_degeneracy_mode() -> DegeneracyMode {
    DegeneracyMode::Hold
}
fn default_degenerate_field() -> f64 {
    DEFAULT_DEGENERATE_FIELD
}

/// Device selection.
#[derive(Debug, Deserialize)]
pub struct DevicesConfig {
    /// "auto", "cpu", "gpu" or "hybrid". Default: "auto".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Platform or device name substring; empty selects all.
    #[serde(default)]
    pub platform: String,
    /// CPU worker threads; 0 uses all cores.
    #[serde(default)]
    pub cpu_threads: usize,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            platform: String::new(),
            cpu_threads: 0,
        }
    }
}

impl DevicesConfig {
    pub fn selection(&self) -> Result<BackendSelection> {
        Ok(self.backend.parse::<BackendSelection>()?)
    }
}

fn default_backend() -> String {
    "auto".into()
}

/// Cross-checking the selected backend against the CPU.
#[derive(Debug, Deserialize)]
pub struct CompareConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Report file name, relative to the output directory.
    #[serde(default = "default_report")]
    pub report: String,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_threshold(),
            report: default_report(),
        }
    }
}

fn default_threshold() -> f64 {
    electromag_core::compare::DEFAULT_DIVERGENCE_THRESHOLD
}
fn default_report() -> String {
    "regression.txt".into()
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to write the JSON run summary (default: true).
    #[serde(default = "default_true")]
    pub save_summary: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_summary: true,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}

impl JobConfig {
    /// Default job for a named preset.
    pub fn for_preset(preset: &str) -> Self {
        let mut job = Self::default();
        job.simulation.preset = preset.to_string();
        job
    }

    /// Check everything that can be checked without running.
    pub fn validate(&self) -> Result<()> {
        self.simulation.params()?;
        self.devices.selection()?;
        let r = self.simulation.resolution;
        if !(r.is_finite() && r > 0.0) {
            anyhow::bail!("resolution must be positive, got {}", r);
        }
        let angle = self.curvature.max_angle_deg;
        if !(angle > 0.0 && angle < 180.0) {
            anyhow::bail!("max_angle_deg must be in (0, 180), got {}", angle);
        }
        if self.compare.threshold.is_nan() || self.compare.threshold < 0.0 {
            anyhow::bail!(
                "compare threshold must be non-negative, got {}",
                self.compare.threshold
            );
        }
        Ok(())
    }
}

/// Load, parse and validate a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let config: JobConfig =
        toml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let job: JobConfig = toml::from_str(
            r#"
            [simulation]
            preset = "micro"
            steps = 500
            resolution = 0.5
            precision = "double"
            randomize_charges = true
            seed = 1234

            [curvature]
            policy = "terminate"
            max_angle_deg = 45.0
            degeneracy = "terminate"

            [devices]
            backend = "hybrid"
            platform = "Vulkan"
            cpu_threads = 4

            [compare]
            enabled = true
            threshold = 0.05

            [output]
            directory = "out"
            save_summary = false
            "#,
        )
        .unwrap();
        job.validate().unwrap();

        let p = job.simulation.params().unwrap();
        assert_eq!((p.nx, p.ny, p.static_charges, p.steps), (16, 16, 1000, 500));
        assert_eq!(job.simulation.precision, Precision::Double);
        assert_eq!(
            job.simulation.policies(),
            (SeedPolicy::Randomized { seed: 1234 }, SeedPolicy::Deterministic)
        );

        let c = job.curvature.integrator_config(job.simulation.resolution);
        assert_eq!(c.resolution, 0.5);
        assert_eq!(c.curvature.policy, CurvaturePolicy::Terminate);
        assert_eq!(c.degeneracy, DegeneracyPolicy::Terminate);
        assert!((c.curvature.max_angle - 45.0_f64.to_radians()).abs() < 1e-12);

        assert_eq!(job.devices.selection().unwrap(), BackendSelection::Hybrid);
        assert_eq!(job.devices.cpu_threads, 4);
        assert!(job.compare.enabled);
        assert_eq!(job.compare.report, "regression.txt");
        assert!(!job.output.save_summary);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let job: JobConfig = toml::from_str("").unwrap();
        job.validate().unwrap();
        assert_eq!(job.simulation.preset, "default");
        assert_eq!(job.simulation.precision, Precision::Single);
        assert_eq!(job.devices.backend, "auto");
        assert_eq!(job.output.directory, "./output");

        let c = job.curvature.integrator_config(job.simulation.resolution);
        assert_eq!(c, IntegratorConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_preset = JobConfig::for_preset("huge");
        assert!(bad_preset.validate().is_err());

        let bad_backend: JobConfig = toml::from_str("[devices]\nbackend = \"fpga\"").unwrap();
        assert!(bad_backend.validate().is_err());

        let bad_steps: JobConfig = toml::from_str("[simulation]\nsteps = 1").unwrap();
        assert!(bad_steps.validate().is_err());

        assert!(toml::from_str::<JobConfig>("[curvature]\npolicy = \"bend\"").is_err());
    }
}
