//! FaceNet CLI - Command line interface for the Inception-ResNet V1 model
//!
//! Builds the network, fetches its pre-trained weights and computes
//! embeddings for face images.

use clap::{Parser, Subcommand};
use colored::*;
use facenet_cli::{
    commands::*,
    config::CliConfig,
    output::{print_error, print_success, OutputFormat},
    utils::setup_logging,
};
use std::process;

#[derive(Parser)]
#[command(name = "facenet")]
#[command(about = "Inception-ResNet V1 (FaceNet) CLI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = "Build, inspect and run the Inception-ResNet V1 face embedding network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "facenet.toml")]
    config: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "pretty")]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the layer table of the network
    Summary(SummaryCommand),

    /// Download the pre-trained weights
    Pull(PullCommand),

    /// Compute embeddings for images
    Embed(EmbedCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet).unwrap_or_else(|e| {
        eprintln!("{} Failed to setup logging: {}", "Error:".red().bold(), e);
        process::exit(1);
    });

    let config = match CliConfig::load(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Failed to load config: {}", "Error:".red().bold(), e);
            process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{} Invalid config {}: {}", "Error:".red().bold(), cli.config, e);
        process::exit(1);
    }

    let result = match cli.command {
        Commands::Summary(cmd) => summary::execute(cmd, config, cli.format).await,
        Commands::Pull(cmd) => pull::execute(cmd, config).await,
        Commands::Embed(cmd) => embed::execute(cmd, config).await,
    };

    match result {
        Ok(_) => {
            if !cli.quiet && cli.format == OutputFormat::Pretty {
                print_success("Command completed successfully");
            }
        }
        Err(e) => {
            print_error(&e);
            process::exit(1);
        }
    }
}
