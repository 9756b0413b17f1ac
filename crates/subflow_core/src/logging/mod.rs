//! Logging infrastructure.
//!
//! Two layers:
//! - process-wide `tracing` subscriber (stderr, optionally a daily rolling file)
//! - per-job `JobLogger` writing `<job>/logs/<job>.log`
//!
//! # Example
//!
//! ```no_run
//! use subflow_core::logging::{JobLogger, LogConfig};
//!
//! let logger = JobLogger::new("job-42", "/jobs/job-42/logs", LogConfig::default(), None).unwrap();
//! logger.phase("Run");
//! logger.stage("transcribe");
//! logger.success("transcribe finished");
//! ```

mod job_logger;
mod types;

use std::path::Path;

pub use job_logger::{sanitize_filename, JobLogger};
pub use types::{LogCallback, LogConfig, LogLevel, MessagePrefix};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `default_level`. Call once at startup.
pub fn init_tracing(default_level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Install the global subscriber writing to stderr and to a daily rolling
/// file `subflow.log` in `log_dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the lifetime of the process.
pub fn init_tracing_with_file(
    default_level: LogLevel,
    log_dir: &Path,
) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let appender = tracing_appender::rolling::daily(log_dir, "subflow.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .with(filter)
        .init();

    Ok(guard)
}
