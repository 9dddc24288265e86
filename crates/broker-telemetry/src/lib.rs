//! # Broker Telemetry
//!
//! Logging bootstrap for processes that host an event broker.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use broker_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() -> Result<(), broker_telemetry::TelemetryError> {
//!     init_logging(&TelemetryConfig::from_env())?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BROKER_SERVICE_NAME` | `event-broker` | Service name reported at startup |
//! | `BROKER_LOG_LEVEL` / `RUST_LOG` | `info` | Filter directives |
//! | `BROKER_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `BROKER_LOG_ANSI` | `true` | Colored console output |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directives}': {reason}")]
    Filter { directives: String, reason: String },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}
