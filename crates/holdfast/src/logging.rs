use std::fs::File;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOGGING_ENV: &str = "HOLDFAST_LOG";
pub const LOGGING_FILE_ENV: &str = "HOLDFAST_LOG_FILE";

pub fn setup_logging() -> anyhow::Result<()> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::INFO)
        .and_then(
            layer()
                .with_writer(std::io::stderr)
                .with_line_number(true)
                .with_file(true)
                .with_filter(filter_fn(|metadata| metadata.level() > &LevelFilter::INFO)),
        )
        .with_filter(
            EnvFilter::builder()
                .with_env_var(LOGGING_ENV)
                .try_from_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        );

    let registry = tracing_subscriber::registry().with(stderr_layer);

    // A file layer is added only when the operator points one at a path.
    if let Ok(log_path) = std::env::var(LOGGING_FILE_ENV) {
        let log_file = File::options()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to create a log file at {}", log_path))?;
        registry
            .with(
                layer()
                    .pretty()
                    .with_writer(log_file)
                    .with_ansi(false)
                    .with_filter(LevelFilter::TRACE),
            )
            .try_init()
            .context("failed to initialize tracing_subscriber")
    } else {
        registry.try_init().context("failed to initialize tracing_subscriber")
    }
}
