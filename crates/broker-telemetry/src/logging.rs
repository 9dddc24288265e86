//! Global subscriber installation.
//!
//! Console output by default; one JSON object per line when `json_logs` is
//! set. The service name and active filter are logged once at startup.

use crate::{TelemetryConfig, TelemetryError};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the filter from the configured directives.
pub(crate) fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(&config.log_level).map_err(|e| TelemetryError::Filter {
        directives: config.log_level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber.
///
/// Returns [`TelemetryError::AlreadyInitialized`] if one is already set,
/// which happens when tests or embedding applications initialize first.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_logs {
        registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_ansi(config.ansi).with_target(true))
            .try_init()
    };
    installed.map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        filter = %config.log_level,
        "Logging initialized"
    );
    Ok(())
}
