//! AERIAL MCL SIM: replay driver for vision-based Monte Carlo localization experiments.
//!
//! The program localizes a recorded flight against a descriptor grid of the overflown area.
//! Each trial of the route file is replayed from a recording directory containing the camera
//! frames and the precomputed place-recognition descriptors, the particle filter fuses them with
//! the visual odometry it computes from the frames, and the estimates are written as CSV.
//!
//! You can run experiments either by:
//!   1. Loading all parameters from a configuration file (TOML/JSON/YAML)
//!   2. Specifying parameters via command-line flags (which override the configuration file)

mod common;
mod replay;

use aerialmcl::config::LocalizationConfig;
use aerialmcl::localizer::{LocalizerKind, Resources};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use common::{init_logger, validate_input_dir, validate_input_file, validate_output_path};
use log::info;
use std::path::PathBuf;

const LONG_ABOUT: &str = "AERIAL MCL SIM: replay driver for vision-based Monte Carlo localization experiments.

An aerial vehicle is localized over a pre-mapped area using only its downward-looking camera.
A particle filter propagates its particles with frame-to-frame visual odometry and weights
them by comparing the place-recognition descriptor of every frame with a grid of descriptors
covering the area.

Inputs:
  - a descriptor grid CSV (row,col,latitude,longitude,bin,d0,...)
  - a route CSV (trial,step,latitude,longitude,yaw) with the ground truth of every trial
  - a recording directory with trial_<k>/frame_<step>.png and trial_<k>/descriptors.csv

You can run experiments either by:
  1. Loading all parameters from a configuration file (TOML/JSON/YAML)
  2. Specifying parameters via command-line flags

Results are written to localisation-<experiment>-<area>-<seed>.csv in the output directory.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay driver for vision-based Monte Carlo localization experiments.", long_about = LONG_ABOUT)]
struct Cli {
    /// Load the localization parameters from a configuration file (TOML/JSON/YAML).
    /// Command-line flags take precedence over the file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Localize recorded flights",
        long_about = "Localize every selected trial of the route file by replaying its recorded frames and descriptors through the particle filter. Trials whose filter diverges are aborted and reported; the remaining trials still run."
    )]
    Run(RunArgs),

    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Descriptor grid CSV file
    #[arg(short, long)]
    grid: PathBuf,

    /// Route CSV file
    #[arg(short, long)]
    routes: PathBuf,

    /// Recording directory with per-trial frames and descriptors
    #[arg(long)]
    recording: PathBuf,

    /// Output directory for the results
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LocalizerKind::AerialParticleFilter)]
    localizer: LocalizerKind,

    /// Number of particles
    #[arg(short = 'n', long)]
    num_particles: Option<usize>,

    /// Particle noise standard deviations in meters (latitude longitude)
    #[arg(long, num_args = 2, value_names = ["LAT_M", "LON_M"])]
    particle_noise: Option<Vec<f64>>,

    /// Random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Comma separated trial indices to run (all routes if omitted)
    #[arg(long, value_delimiter = ',')]
    trials: Option<Vec<usize>>,

    /// Number of steps per trial (full route if omitted)
    #[arg(long)]
    steps: Option<usize>,

    /// Experiment name used in the result file name
    #[arg(long)]
    experiment: Option<String>,

    /// Area name used in the result file name
    #[arg(long)]
    area: Option<String>,

    /// Disable the scale variation of the sensed images
    #[arg(long)]
    no_scale: bool,

    /// Save the full particle population at every step
    #[arg(long)]
    states: bool,

    /// Do not write any results
    #[arg(long)]
    nosave: bool,

    /// Save visual odometry match images next to the results
    #[arg(long)]
    debug_images: bool,
}
impl RunArgs {
    /// Apply the command-line overrides on top of `config`.
    fn apply(&self, config: &mut LocalizationConfig) -> Result<()> {
        if let Some(n) = self.num_particles {
            config.num_particles = n;
        }
        if let Some(noise) = &self.particle_noise {
            match noise.as_slice() {
                [lat, lon] => config.particle_noise_m = [*lat, *lon],
                _ => bail!("--particle-noise expects two values"),
            }
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(trials) = &self.trials {
            config.trials = Some(trials.clone());
        }
        if let Some(steps) = self.steps {
            config.steps = Some(steps);
        }
        if let Some(experiment) = &self.experiment {
            config.experiment_name = experiment.clone();
        }
        if let Some(area) = &self.area {
            config.area_name = area.clone();
        }
        if let Some(output) = &self.output {
            config.results_dir = output.clone();
        }
        config.no_scale |= self.no_scale;
        config.save_states |= self.states;
        config.nosave |= self.nosave;
        config.odometry.debug_images |= self.debug_images;
        Ok(())
    }
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path of the configuration file (.toml, .json, .yaml)
    #[arg(short, long, default_value = "aerial-mcl.toml")]
    output: PathBuf,
}

fn run(args: &RunArgs, config_path: Option<&PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => LocalizationConfig::from_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => LocalizationConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate()?;

    validate_input_file(&args.grid)?;
    validate_input_file(&args.routes)?;
    validate_input_dir(&args.recording)?;
    if !config.nosave {
        validate_output_path(&config.results_dir)?;
    }
    info!(
        "Running {:?} with {} particles (seed {}) on {}",
        args.localizer,
        config.num_particles,
        config.seed,
        args.grid.display()
    );

    let resources = Resources::Files {
        grid: args.grid.clone(),
        routes: args.routes.clone(),
    };
    let mut localizer = args.localizer.create(config, resources);
    localizer
        .setup()
        .with_context(|| format!("loading {} and {}", args.grid.display(), args.routes.display()))?;
    let (mut sensor, encoder) = replay::open_recording(&args.recording);
    localizer.set_model(Box::new(encoder));
    let result = localizer.localize(&mut sensor)?;

    for trial in result.trials() {
        let estimates = result.estimates(trial);
        if let Some(last) = estimates.last() {
            info!(
                "Trial {}: {} steps, final estimate {}",
                trial,
                estimates.len(),
                last
            );
        }
    }
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs) -> Result<()> {
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    LocalizationConfig::default()
        .to_file(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!(
        "Configuration file successfully created: {}",
        args.output.display()
    );
    println!("\nYou can now run an experiment with:");
    println!(
        "  aerial-mcl-sim --config {} run --grid <GRID> --routes <ROUTES> --recording <DIR>",
        args.output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match cli.command {
        Some(Command::Run(args)) => run(&args, cli.config.as_ref()),
        Some(Command::CreateConfig(args)) => create_config_file(&args),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "aerial-mcl-sim",
            "run",
            "--grid",
            "grid.csv",
            "--routes",
            "routes.csv",
            "--recording",
            "rec",
            "-n",
            "1000",
            "--particle-noise",
            "5",
            "7.5",
            "--trials",
            "0,3",
            "--no-scale",
            "--nosave",
        ]);
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected the run command");
        };
        let mut config = LocalizationConfig::default();
        args.apply(&mut config).unwrap();
        assert_eq!(config.num_particles, 1000);
        assert_eq!(config.particle_noise_m, [5.0, 7.5]);
        assert_eq!(config.trials, Some(vec![0, 3]));
        assert!(config.no_scale);
        assert!(config.nosave);
        assert!(!config.save_states);
        assert_eq!(config.seed, aerialmcl::config::DEFAULT_SEED);
    }

    #[test]
    fn test_create_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = CreateConfigArgs {
            output: dir.path().join("configs").join("template.yaml"),
        };
        create_config_file(&args).unwrap();
        let config = LocalizationConfig::from_file(&args.output).unwrap();
        assert_eq!(config, LocalizationConfig::default());
    }
}
