//! OFT merge tool
//!
//! `oft_merge merge --config merge.yaml` bakes an OFT adapter into a base
//! checkpoint; `oft_merge inspect adapter.safetensors` prints the block layout
//! and norm clamp state of each adapter layer.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;

use eri_oft_merge::config::{load_config, parse_device};
use eri_oft_merge::loaders::load_adapter;
use eri_oft_merge::{inspect_adapter, merge_checkpoint};

#[derive(Parser)]
#[command(name = "oft_merge", about = "Merge OFT adapters into diffusion checkpoints")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge an adapter into a checkpoint as described by a YAML config
    Merge {
        #[arg(short, long)]
        config: PathBuf,
        /// Override the configured multiplier
        #[arg(short, long, allow_negative_numbers = true)]
        multiplier: Option<f64>,
        /// Override the configured output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print per-layer block layout and norm clamp state of an adapter
    Inspect {
        adapter: PathBuf,
        #[arg(long, default_value = "cpu")]
        device: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    eri_oft_merge::logging::init_logger_with_level(level);

    match cli.command {
        Command::Merge { config, multiplier, output } => {
            let mut merge_config = load_config(&config)?;
            if let Some(multiplier) = multiplier {
                merge_config.multiplier = multiplier;
            }
            if let Some(output) = output {
                merge_config.output = output;
            }

            info!("Starting merge with config: {}", config.display());
            let report = merge_checkpoint(&merge_config)?;
            info!(
                "Merge completed: {} layers written to {}",
                report.merged.len(),
                merge_config.output.display()
            );
        }
        Command::Inspect { adapter, device, json } => {
            let device = parse_device(&device)?;
            let adapter = load_adapter(&adapter, &device)?;
            let summaries = inspect_adapter(&adapter)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                println!(
                    "{:<60} {:>7} {:>6} {:>10} {:>12} {:>6}",
                    "layer", "blocks", "size", "alpha", "norm", "clamp"
                );
                for s in &summaries {
                    println!(
                        "{:<60} {:>7} {:>6} {:>10.4e} {:>12.6} {:>6}",
                        s.name,
                        s.num_blocks,
                        s.block_size,
                        s.alpha,
                        s.norm,
                        if s.clamp_active() { "yes" } else { "no" }
                    );
                }
            }
        }
    }

    Ok(())
}
