use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogConfig, LogFormat};

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the configured level.
pub fn env_filter(config: &LogConfig, verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stderr in text or JSON, plus an optional
/// daily rolling file under `config.dir`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and closes the file writer.
pub fn init(config: &LogConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let stderr_layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match (&config.file, &config.dir) {
        (true, Some(dir)) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "coderun.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter(config, verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(guard)
}
