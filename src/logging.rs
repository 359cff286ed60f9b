//! Logging setup (SPEC_FULL.md §10), adapted from this crate's lineage's
//! `utils/logger.rs` almost verbatim — the shape (EnvFilter + format layer,
//! optional daily-rolling file layer alongside console) carries over intact
//! since the `LoggingConfig`/`LogFormat` types it consumes are unchanged.

use std::path::Path;

use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::Result;

pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match &config.file {
        Some(file_path) => {
            let file_path = Path::new(file_path);
            let directory = file_path.parent().ok_or_else(|| crate::Error::configuration("invalid log file path"))?;
            let file_appender = rolling::RollingFileAppender::builder()
                .rotation(rolling::Rotation::DAILY)
                .filename_suffix("log")
                .build(directory)
                .map_err(|e| crate::Error::internal(format!("failed to create file appender: {e}")))?;
            let (file_writer, guard) = non_blocking(file_appender);
            // leaked intentionally: the guard must outlive the process, and
            // this is called exactly once at startup.
            std::mem::forget(guard);

            let file_layer = match config.format {
                LogFormat::Json => fmt::layer().json().with_writer(file_writer).boxed(),
                LogFormat::Compact => fmt::layer().compact().with_writer(file_writer).boxed(),
                LogFormat::Full => fmt::layer().with_writer(file_writer).boxed(),
            };
            let console_layer = match config.format {
                LogFormat::Json => fmt::layer().json().with_writer(std::io::stdout).boxed(),
                LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stdout).boxed(),
                LogFormat::Full => fmt::layer().with_writer(std::io::stdout).boxed(),
            };
            registry.with(file_layer).with(console_layer).init();
        }
        None => {
            let console_layer = match config.format {
                LogFormat::Json => fmt::layer().json().boxed(),
                LogFormat::Compact => fmt::layer().compact().boxed(),
                LogFormat::Full => fmt::layer().boxed(),
            };
            registry.with(console_layer).init();
        }
    }

    info!("logging initialized at level {}", config.level);
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(crate::Error::configuration(format!("invalid log level: {level}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_levels_case_insensitively() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("Error").unwrap(), Level::ERROR);
        assert!(parse_log_level("invalid").is_err());
    }
}
