//! Tracing subscriber setup for the binary and worker child processes

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::errors::{QueueError, QueueResult};

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Used by worker children, whose stdout carries the job protocol
    Stderr,
}

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to this crate.
pub fn init_logging(config: &LoggingConfig, target: LogTarget) -> QueueResult<()> {
    let log_filter = format!("jobsmith={},sea_orm=warn,sqlx=warn", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into());

    let writer = || match target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_writer(writer()));
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer())
            .with_ansi(target == LogTarget::Stdout)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| QueueError::configuration(format!("failed to initialise logging: {e}")))
}
