//! Global `tracing` subscriber setup.

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::{LogConfig, LogFormat};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("invalid log level directive {directive:?}: {source}")]
    Filter {
        directive: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("logger already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter: `RUST_LOG` if set, otherwise the configured level.
pub fn filter(config: &LogConfig) -> Result<EnvFilter, LoggerError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|source| LoggerError::Filter {
            directive: config.level.clone(),
            source,
        }),
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(config: &LogConfig) -> Result<(), LoggerError> {
    let filter = filter(config)?;
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };

    tracing_subscriber::registry().with(layer.with_filter(filter)).try_init()?;
    Ok(())
}

#[test]
fn test_invalid_level_is_rejected() {
    // Only meaningful when RUST_LOG does not override the configured level.
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let config = LogConfig {
        level: "voltage_repeater=notalevel".to_string(),
        format: LogFormat::Compact,
    };
    assert!(matches!(filter(&config), Err(LoggerError::Filter { .. })));
}

#[test]
fn test_default_level_is_accepted() {
    assert!(filter(&LogConfig::default()).is_ok());
}
