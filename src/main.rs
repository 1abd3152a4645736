// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use scanflow::PipelineConfig;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "scanflow")]
#[command(about = "Run scanned image data through processing pipelines")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Pipeline config file (default: the per-user config, if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a raw image through padding removal and an optional helper
    Run {
        /// Raw image file
        #[arg(short, long)]
        input: PathBuf,

        /// Pixels per line
        #[arg(long)]
        width: u32,

        /// Lines (omit if unknown)
        #[arg(long)]
        height: Option<u32>,

        /// Bits per sample
        #[arg(short, long, default_value = "8")]
        depth: u8,

        /// Samples per pixel
        #[arg(long, default_value = "1")]
        components: u8,

        /// Padding octets at the end of every line
        #[arg(long, default_value = "0")]
        padding_octets: u32,

        /// Resolution in dpi
        #[arg(long)]
        resolution: Option<u32>,

        /// Lines are stored bottom line first
        #[arg(long)]
        bottom_up: bool,

        /// Helper command line the image is piped through
        #[arg(long)]
        helper: Option<String>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check whether a helper program can be run
    Probe {
        /// Program name or path
        program: String,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=scanflow=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::load_or_default()?,
    };

    match cli.command {
        Commands::Run {
            input,
            width,
            height,
            depth,
            components,
            padding_octets,
            resolution,
            bottom_up,
            helper,
            output,
        } => cli::run_raw(
            config,
            cli::RawImage {
                input,
                width,
                height,
                depth,
                components,
                padding_octets,
                resolution,
                bottom_up,
            },
            helper,
            output,
        ),
        Commands::Probe { program } => cli::probe(&program),
        Commands::Config => cli::print_config(&config),
    }
}
