//! ElectroMag command-line interface.
//!
//! Usage:
//!   electromag run config.toml
//!   electromag run --preset micro --backend cpu --compare
//!   electromag validate config.toml
//!   electromag devices
//!   electromag presets

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use electromag_compute::{describe_catalog, DeviceCatalog};
use electromag_core::params::presets;

mod config;
mod runner;

#[derive(Parser)]
#[command(
    name = "electromag",
    about = "Electric field-line tracer for CPUs and GPUs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trace field lines.
    Run {
        /// Path to TOML job configuration; defaults apply if omitted.
        config: Option<PathBuf>,
        /// Override output directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Override the simulation preset.
        #[arg(short, long)]
        preset: Option<String>,
        /// Override the backend: auto, cpu, gpu or hybrid.
        #[arg(short, long)]
        backend: Option<String>,
        /// Cross-check the result against a CPU run.
        #[arg(long)]
        compare: bool,
    },
    /// Validate a configuration file without running.
    Validate {
        /// Path to TOML job configuration.
        config: PathBuf,
    },
    /// List compute devices.
    Devices {
        /// Only show platforms or devices whose name contains this string.
        #[arg(short, long, default_value = "")]
        filter: String,
    },
    /// List simulation presets.
    Presets,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            preset,
            backend,
            compare,
        } => {
            let mut job = match &config {
                Some(path) => config::load_config(path)?,
                None => config::JobConfig::default(),
            };
            if let Some(preset) = preset {
                job.simulation.preset = preset;
            }
            if let Some(backend) = backend {
                job.devices.backend = backend;
            }
            job.compare.enabled |= compare;
            job.validate()?;

            let output_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));

            println!("ElectroMag Field Line Tracer");
            println!("============================");
            if let Some(path) = &config {
                println!("Config: {}", path.display());
            }
            println!("Backend: {}", job.devices.backend);

            let summary = runner::run_job(&job, &output_dir)?;
            let complete = summary
                .runs
                .first()
                .map(|r| r.missing.is_empty())
                .unwrap_or(false);
            if complete {
                println!("\nDone.");
            } else {
                println!("\nDone, with missing lines.");
            }
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            let params = job.simulation.params()?;
            println!("Configuration is valid.");
            println!(
                "  Preset: {} ({} lines x {} steps, {} charges)",
                params.name,
                params.line_count(),
                params.steps,
                params.static_charges
            );
            println!("  Precision: {}", job.simulation.precision);
            println!("  Backend: {}", job.devices.selection()?);
            println!(
                "  Curvature: {}",
                if job.curvature.enabled {
                    format!("{:?} at {} deg", job.curvature.policy, job.curvature.max_angle_deg)
                } else {
                    "off".to_string()
                }
            );
            println!("  Compare: {}", job.compare.enabled);
            println!("  Output: {}", job.output.directory);
        }
        Commands::Devices { filter } => {
            let catalog = DeviceCatalog::system();
            let platforms = catalog.filter_by_name(&filter);
            println!("Compute devices:");
            if platforms.is_empty() {
                println!("  (no accelerators found; the host CPU is always available)");
            } else {
                print!("{}", describe_catalog(&platforms));
            }
        }
        Commands::Presets => {
            println!("Simulation presets:");
            for p in presets() {
                println!(
                    "  {:<10} {:>4} x {:<4} lines  {:>5} steps  {:>5} charges",
                    p.name, p.nx, p.ny, p.steps, p.static_charges
                );
            }
        }
    }

    Ok(())
}
