//! sardine-batch CLI
//!
//! Batch processing of Sentinel-1 GRD inventories into ARD, time series,
//! timescans and mosaics.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use sardine_batch::core::{ArdStage, DeferredQueue, FailurePolicy, Pipeline, Stage, StageContext};
use sardine_batch::io::inventory::SceneId;
use sardine_batch::types::{AcquisitionGroup, SceneRecord, Track, DATE_FORMAT};
use sardine_batch::{build_processing_units, load_inventory, ProcessingConfig};

#[derive(Parser)]
#[command(name = "sardine-batch", version)]
#[command(about = "Batch processing of Sentinel-1 GRD inventories", long_about = None)]
struct Cli {
    /// Processing configuration (JSON)
    #[arg(short, long, default_value = "processing.json", global = true)]
    config: PathBuf,

    /// Scene inventory (JSON array of scene records)
    #[arg(short, long, global = true)]
    inventory: Option<PathBuf>,

    /// Append command descriptors to this file instead of running them
    #[arg(long, global = true)]
    defer: Option<PathBuf>,

    /// Stop the run at the first failed critical step
    #[arg(long, global = true)]
    fail_fast: bool,

    /// Parallel acquisition units
    #[arg(short, long, default_value_t = 1, global = true)]
    jobs: usize,

    /// Crop mosaics to the configured area of interest
    #[arg(long, global = true)]
    cut_to_aoi: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all stages
    Run,

    /// Convert acquisitions to analysis-ready products
    GrdToArd,

    /// Build per-track time series
    Timeseries,

    /// Compute per-track timescans
    Timescan,

    /// Mosaic time series and timescans across tracks
    Mosaic,

    /// Convert a single acquisition (target of deferred ARD commands)
    UnitArd {
        #[arg(long)]
        track: u32,

        /// Acquisition date, YYYYMMDD
        #[arg(long)]
        date: String,

        /// Scene identifiers of the acquisition
        #[arg(required = true)]
        scenes: Vec<String>,
    },

    /// Validate the configuration
    Validate,

    /// Print the processing groups of the inventory
    Groups,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match &cli.command {
        Commands::Run => run_stages(&cli, &Stage::ALL),
        Commands::GrdToArd => run_stages(&cli, &[Stage::Ard]),
        Commands::Timeseries => run_stages(&cli, &[Stage::Timeseries]),
        Commands::Timescan => run_stages(&cli, &[Stage::Timescan]),
        Commands::Mosaic => run_stages(&cli, &[Stage::MosaicTimeseries, Stage::MosaicTimescan]),
        Commands::UnitArd { track, date, scenes } => unit_ard(&cli, Track(*track), date, scenes),
        Commands::Validate => validate(&cli),
        Commands::Groups => groups(&cli),
    }
}

fn load_config(cli: &Cli) -> Result<ProcessingConfig> {
    let mut config = ProcessingConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    if cli.cut_to_aoi {
        config.parameters.mosaic.cut_to_aoi = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_scenes(cli: &Cli) -> Result<Vec<SceneRecord>> {
    let Some(inventory) = &cli.inventory else {
        bail!("--inventory is required for this command");
    };

    load_inventory(inventory).with_context(|| format!("Failed to load inventory {}", inventory.display()))
}

fn context(cli: &Cli, config: ProcessingConfig) -> StageContext {
    let policy = if cli.fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::Continue
    };

    let mut ctx = StageContext::from_config(Arc::new(config))
        .with_policy(policy)
        .with_jobs(cli.jobs);

    if let Some(exec_file) = &cli.defer {
        log::info!("Deferred mode: writing commands to {}", exec_file.display());
        ctx = ctx.with_deferred(Arc::new(DeferredQueue::with_exec_file(exec_file)));
    }
    ctx
}

fn run_stages(cli: &Cli, stages: &[Stage]) -> Result<()> {
    let config = load_config(cli)?;
    let scenes = load_scenes(cli)?;

    let pipeline = Pipeline::new(context(cli, config), &scenes);
    let report = pipeline.run(stages)?;

    for stage in &report.stages {
        println!("{}", stage);
    }

    if let Some(queue) = &pipeline.context().deferred {
        println!("{} command(s) deferred", queue.len());
    }

    if report.has_failures() {
        bail!("Processing finished with failures; re-run the same command to resume");
    }
    Ok(())
}

fn unit_ard(cli: &Cli, track: Track, date: &str, identifiers: &[String]) -> Result<()> {
    let config = load_config(cli)?;
    let acquisition_date = NaiveDate::parse_from_str(date, DATE_FORMAT)
        .with_context(|| format!("Invalid acquisition date {}", date))?;

    let scenes: Vec<SceneRecord> = identifiers
        .iter()
        .map(|identifier| SceneRecord {
            identifier: identifier.clone(),
            track,
            acquisition_date,
            polarizations: SceneId::parse(identifier)
                .map(|id| id.polarizations)
                .unwrap_or_default(),
        })
        .collect();
    let group = AcquisitionGroup { track, scenes };

    // Executed by the external scheduler; never defer again
    let mut ctx = context(cli, config);
    ctx.deferred = None;

    let state = ArdStage::new(&ctx).process_group(&group)?;
    println!("Track {} acquisition {}: {:?}", track, date, state);

    if state.is_failure() {
        bail!("Acquisition {} of track {} failed", date, track);
    }
    Ok(())
}

fn validate(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    println!("Configuration {} is valid", cli.config.display());
    println!("  download dir:   {}", config.download_dir.display());
    println!("  processing dir: {}", config.processing_dir.display());
    println!("  temp dir:       {}", config.temp_dir().display());
    println!("  gpt:            {}", config.toolchain.gpt_path().display());
    Ok(())
}

fn groups(cli: &Cli) -> Result<()> {
    let scenes = load_scenes(cli)?;

    for unit in build_processing_units(&scenes) {
        println!("Track {} ({} acquisitions)", unit.track, unit.groups.len());
        for group in &unit.groups {
            println!("  {} {}", group.date_token(), group.identifiers().join(" "));
        }
    }
    Ok(())
}
