use std::fs::OpenOptions;

use anyhow::Context;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::constants::LOG_FILE_ENV;

/// Install the global subscriber: stderr output filtered by `RUST_LOG`
/// (default `info`), plus a DEBUG file log when `CHATSYNC_LOG_FILE` is set.
pub fn init_tracing() -> anyhow::Result<()> {
    let file_logging = std::env::var(LOG_FILE_ENV).ok();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let registry = tracing_subscriber::registry().with(stderr_layer);

    if let Some(log_path) = file_logging {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open log file {log_path}"))?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(LevelFilter::DEBUG);

        registry
            .with(file_layer)
            .try_init()
            .context("tracing subscriber already installed")?;
        tracing::info!(path = %log_path, "file logging enabled");
    } else {
        registry
            .try_init()
            .context("tracing subscriber already installed")?;
    }
    Ok(())
}
