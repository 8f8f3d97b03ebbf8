use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Log to an append-mode file, creating it if needed.
pub fn setup_log_file(log_path: &Path) -> Result<(), io::Error> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
        .with(env_filter())
        .init();
    Ok(())
}

pub fn setup_stdout() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter())
        .init();
}
