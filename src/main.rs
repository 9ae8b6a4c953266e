//! Standard Sequencer CLI
//!
//! Turns event logs into fixed-length training sequences.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use standard_sequencer::{
    config::Config,
    core::{FeatureSpec, MethodRegistry, StandardSequencer},
    error::PolicyStage,
    export::{export_file_name, export_to_file, ExportBatch, ExportFormat},
    runner::{self, RunOptions},
    stats::{create_shared_log_with_persistence, PersistedStats},
    JsonlReader, VERSION,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const STATS_FILE: &str = "run_stats.json";

#[derive(Parser)]
#[command(name = "sequencer")]
#[command(version = VERSION)]
#[command(about = "Session-windowed resampling and sequence extraction", long_about = None)]
struct Cli {
    /// Log engine progress (repeat for more detail)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build sequences from a JSON Lines event file
    Run {
        /// Events, one JSON object per line
        input: PathBuf,

        /// Feature spec (JSON object of feature name to dtype)
        #[arg(long, short)]
        schema: PathBuf,

        /// Output file (defaults to a new file under the export path)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Export format (json or jsonl)
        #[arg(long, default_value = "jsonl")]
        format: String,

        /// Timestamp column
        #[arg(long)]
        timestamp_column: Option<String>,

        /// Category column
        #[arg(long)]
        category_column: Option<String>,

        /// Grid period in milliseconds
        #[arg(long)]
        rate: Option<u64>,

        /// Session gap threshold in milliseconds
        #[arg(long)]
        gap: Option<u64>,

        /// Rows per sequence
        #[arg(long)]
        length: Option<usize>,

        /// Rows between sequence starts
        #[arg(long)]
        shift: Option<usize>,

        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,

        /// Skip unreadable or unkeyable events instead of failing
        #[arg(long)]
        skip_invalid: bool,

        /// Close windows once the input is this far (ms) past them
        #[arg(long)]
        allowed_lateness: Option<u64>,
    },

    /// Show the resolved per-feature policies for a feature spec
    Policies {
        /// Feature spec (JSON object of feature name to dtype)
        #[arg(long, short)]
        schema: PathBuf,
    },

    /// List the available resampling and filling methods
    Methods,

    /// Show configuration
    Config {
        /// Write the current (or default) configuration to the config file
        #[arg(long)]
        init: bool,
    },

    /// Show statistics accumulated over previous runs
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Run {
            input,
            schema,
            output,
            format,
            timestamp_column,
            category_column,
            rate,
            gap,
            length,
            shift,
            workers,
            skip_invalid,
            allowed_lateness,
        } => {
            let mut config = load_config(&config_path)?;
            let seq = &mut config.sequencer;
            if let Some(column) = timestamp_column {
                seq.timestamp_column = column;
            }
            if let Some(column) = category_column {
                seq.category_column = Some(column);
            }
            if let Some(ms) = rate {
                seq.resampling_rate = std::time::Duration::from_millis(ms);
            }
            if let Some(ms) = gap {
                seq.gap_threshold = std::time::Duration::from_millis(ms);
            }
            if let Some(length) = length {
                seq.sequence_length = length;
            }
            if let Some(shift) = shift {
                seq.sequence_shift = shift;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }

            let allowed_lateness = allowed_lateness
                .map(|ms| {
                    i64::try_from(ms)
                        .ok()
                        .and_then(Duration::try_milliseconds)
                        .with_context(|| format!("Allowed lateness of {ms} ms is out of range"))
                })
                .transpose()?;
            let options = RunOptions {
                workers: config.workers,
                skip_invalid,
                allowed_lateness,
            };
            cmd_run(&config, &input, &schema, output, &format, &options)
        }
        Commands::Policies { schema } => cmd_policies(&load_config(&config_path)?, &schema),
        Commands::Methods => {
            cmd_methods();
            Ok(())
        }
        Commands::Config { init } => cmd_config(&config_path, init),
        Commands::Stats => cmd_stats(&load_config(&config_path)?),
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("standard_sequencer={default_level},sequencer={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_from(path).with_context(|| format!("Failed to load configuration from {path:?}"))
}

fn cmd_run(
    config: &Config,
    input: &Path,
    schema: &Path,
    output: Option<PathBuf>,
    format: &str,
    options: &RunOptions,
) -> Result<()> {
    let format: ExportFormat = format.parse()?;
    let features = FeatureSpec::load(schema)
        .with_context(|| format!("Failed to read feature spec {schema:?}"))?;
    let sequencer = StandardSequencer::new(config.sequencer.clone(), &features)
        .context("Invalid sequencer configuration")?;

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    let log = create_shared_log_with_persistence(config.data_path.join(STATS_FILE));

    println!("Standard Sequencer v{VERSION}");
    println!("Run ID: {}", log.run_id());
    println!("  Input: {input:?}");
    println!("  Features resampled: {}", sequencer.policies().len());
    println!("  Workers: {}", options.workers);
    println!();

    let reader =
        JsonlReader::open(input).with_context(|| format!("Failed to open events {input:?}"))?;
    let sequences = runner::run(&sequencer, reader, options, &log)?;

    let output_path = output.unwrap_or_else(|| {
        config
            .export_path
            .join(export_file_name(log.run_id(), format))
    });
    let batch = ExportBatch::new(log.run_id(), sequencer.config(), sequences);
    export_to_file(&output_path, format, &batch)
        .with_context(|| format!("Failed to write {output_path:?}"))?;
    info!(sequences = batch.sequences.len(), path = ?output_path, "Export written");

    if let Err(e) = log.save() {
        eprintln!("Warning: Could not save run statistics: {e}");
    }

    println!("{}", log.summary());
    println!();
    println!("Exported {} sequences to {output_path:?}", batch.sequences.len());
    Ok(())
}

fn cmd_policies(config: &Config, schema: &Path) -> Result<()> {
    let features = FeatureSpec::load(schema)
        .with_context(|| format!("Failed to read feature spec {schema:?}"))?;
    let sequencer = StandardSequencer::new(config.sequencer.clone(), &features)
        .context("Invalid sequencer configuration")?;

    println!("Resolved Policies");
    println!("=================");
    println!();
    println!(
        "{:<24} {:<12} {:<10} {:<10} {:<10}",
        "feature", "kind", "resample", "output", "fill"
    );
    for (feature, policy) in sequencer.policies().iter() {
        println!(
            "{:<24} {:<12} {:<10} {:<10} {:<10}",
            feature,
            policy
                .kind
                .map_or_else(|| "-".to_string(), |k| k.to_string()),
            policy.resample.name(),
            policy.output.to_string(),
            policy.fill.as_ref().map_or("-", |f| f.name()),
        );
    }

    let dropped: Vec<&str> = sequencer
        .schema()
        .iter()
        .map(|(name, _)| name)
        .filter(|name| sequencer.policies().get(name).is_none())
        .collect();
    if !dropped.is_empty() {
        println!();
        println!("Not resampled: {}", dropped.join(", "));
    }
    Ok(())
}

fn cmd_methods() {
    for (title, stage) in [
        ("Resampling methods", PolicyStage::Resampling),
        ("Filling methods", PolicyStage::Filling),
    ] {
        println!("{title}");
        println!("{}", "=".repeat(title.len()));
        for info in MethodRegistry::methods(stage) {
            let mut line = format!("  {:<10} {}", info.name, info.description);
            if info.numeric_only {
                line.push_str(" [numeric only]");
            }
            println!("{line}");
            if !info.aliases.is_empty() {
                println!("  {:<10} aliases: {}", "", info.aliases.join(", "));
            }
            if !info.parameters.is_empty() {
                println!("  {:<10} parameters: {}", "", info.parameters.join(", "));
            }
        }
        println!();
    }
}

fn cmd_config(path: &Path, init: bool) -> Result<()> {
    let config = load_config(path)?;

    if init {
        if path.exists() {
            bail!("Configuration already exists at {path:?}");
        }
        config
            .save_to(path)
            .with_context(|| format!("Failed to write configuration to {path:?}"))?;
        println!("Wrote configuration to {path:?}");
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_stats(config: &Config) -> Result<()> {
    let path = config.data_path.join(STATS_FILE);
    if !path.exists() {
        println!("No previous run data found.");
        return Ok(());
    }

    let stats = PersistedStats::read(&path)
        .with_context(|| format!("Failed to read statistics from {path:?}"))?;

    println!("Cumulative Statistics");
    println!("=====================");
    println!("  Runs: {}", stats.runs);
    println!("  Events read: {}", stats.events_read);
    println!("  Events rejected: {}", stats.events_rejected);
    println!("  Windows completed: {}", stats.windows_completed);
    println!("  Sequences emitted: {}", stats.sequences_emitted);
    if let Some(run_id) = stats.last_run_id {
        println!("  Last run: {run_id}");
    }
    if let Some(updated) = stats.last_updated {
        println!("  Last updated: {}", updated.to_rfc3339());
    }
    Ok(())
}
