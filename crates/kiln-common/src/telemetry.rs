//! Logging initialisation
//!
//! Installs a `tracing` subscriber with an `EnvFilter` (`RUST_LOG` wins when
//! set) and a human or JSON fmt layer.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber is already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Logging options
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Debug output for kiln crates
    pub verbose: bool,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl LogConfig {
    /// Default directive when `RUST_LOG` is unset
    pub fn default_directive(&self) -> &'static str {
        if self.verbose {
            "info,kiln=debug,kiln_common=debug,kiln_remote=debug,kiln_cloud=debug,kiln_bootstrap=debug,kiln_cluster=debug"
        } else {
            "info"
        }
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let (human, json) = if config.json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
        )
    } else {
        (
            Some(tracing_subscriber::fmt::layer().with_target(false)),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(human)
        .with(json)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_enables_debug_for_kiln_crates() {
        let cfg = LogConfig {
            verbose: true,
            json: false,
        };
        assert!(cfg.default_directive().contains("kiln_cluster=debug"));
        assert_eq!(LogConfig::default().default_directive(), "info");
    }
}
