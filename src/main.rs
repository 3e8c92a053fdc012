mod acquire;
mod app;
mod cli;
mod config;
mod deadlock;
mod dedup;
mod deploy;
mod error;
mod importer;
mod pool;
mod profile;
mod registry;

use anyhow::Result;
use std::{fs::OpenOptions, io, sync::Mutex};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

fn main() -> Result<()> {
    let dirs = config::AppDirs::locate_or_create().ok();
    init_logging(dirs.as_ref());
    cli::run()
}

/// Warnings go to stderr; everything the filter lets through is appended to
/// the log file in the application dir.
fn init_logging(dirs: Option<&config::AppDirs>) {
    let filter =
        EnvFilter::try_from_env(config::LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(LevelFilter::WARN);
    let file = dirs
        .and_then(|dirs| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dirs.log_path())
                .ok()
        })
        .map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init();
}
