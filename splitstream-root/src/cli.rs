use clap::Parser;

use std::path::PathBuf;

use splitstream_lib::config;

/// Splitstream system service - per-app split tunneling for VPN clients
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Engine configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,

    /// Log to this file instead of stdout
    #[arg(long, env = "SPLITSTREAM_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
