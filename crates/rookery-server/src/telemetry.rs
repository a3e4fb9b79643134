//! Log subscriber setup.
//!
//! Metrics are recorded by the library through the global OpenTelemetry
//! meter; without an SDK installed the instruments are no-ops.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,rookery_xmpp=debug,rookery_server=debug";

/// Console log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Install the global subscriber.
///
/// Environment variables:
/// - `RUST_LOG`: Log filter (default: `info,rookery_xmpp=debug`)
pub fn init(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .pretty(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    tracing::info!(format = ?format, "Telemetry initialized");
    Ok(())
}

/// Flush telemetry before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
