//! Tracing subscriber for the ledger binary
//!
//! Events go to a non-blocking rolling file, plus coloured stdout in text
//! mode. `RUST_LOG` replaces the configured filter entirely.

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// sqlx logs every statement at info
const SQL_STATEMENT_TARGET: &str = "sqlx::query";

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init_logging(config: &LogConfig) -> WorkerGuard {
    let file_appender =
        RollingFileAppender::new(rotation(&config.rotation), &config.log_dir, &config.log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Targets stay in JSON so transfer and store events can be split
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

/// Filter used when `RUST_LOG` is unset. Per-statement SQL logging is
/// capped at `warn` unless `log_sql` is set, so transfer lifecycle events
/// are not buried under the queries that implement them.
pub fn default_directives(config: &LogConfig) -> String {
    if config.log_sql {
        config.log_level.clone()
    } else {
        format!("{},{}=warn", config.log_level, SQL_STATEMENT_TARGET)
    }
}

/// `minutely`, `hourly`, `daily`; anything else writes one file forever
fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}
