//! Anomalyst CLI: fit, validate, test and predict with anomaly detection
//! models from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Anomalyst: train and run visual anomaly detection models
#[derive(Parser, Debug)]
#[command(name = "anomalyst", version, about, long_about = None)]
struct Cli {
    /// Configuration file (.yaml, .toml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override a configuration value, e.g. --set trainer.max_epochs=5
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    /// Export an OpenVINO-style model after fitting
    #[arg(long, global = true)]
    openvino: bool,

    /// Export a compressed model after fitting, using this NNCF config
    #[arg(long, value_name = "PATH", global = true)]
    nncf: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Train a model, calibrating thresholds on the validation split
    #[command(alias = "train")]
    Fit,
    /// Compute validation metrics
    Validate,
    /// Compute test metrics and render visualizations
    Test,
    /// Score images from a file or directory
    Predict {
        /// Image file or directory of images
        #[arg(short, long)]
        input: PathBuf,
        /// Where to write predictions (defaults to the run directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Print the merged configuration
    Show {
        /// Output format: yaml or toml
        #[arg(long, default_value = "yaml")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "anomalyst", "anomalyst")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "anomalyst.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let options = commands::RunOptions {
        config: cli.config,
        overrides: cli.overrides,
        openvino: cli.openvino,
        nncf: cli.nncf,
    };
    commands::handle_command(cli.command, options).await
}
