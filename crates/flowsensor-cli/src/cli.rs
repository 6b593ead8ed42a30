//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// flowsensor: capture, analyze and publish network telemetry.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the sensor's YAML config file.
    #[arg(short = 'c', long = "config", default_value = "/etc/flowsensor/config.yaml")]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv), overriding logging.level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Run the poll-directory ingest watcher instead of live capture.
    #[arg(long)]
    pub watch: bool,

    /// Zip the sensor's output, buffer and log directories into the given
    /// file for attaching to a support ticket, then exit.
    #[arg(long, value_name = "ZIP_PATH")]
    pub collect_logs: Option<PathBuf>,
}

pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}
