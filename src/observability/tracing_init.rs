//! Tracing initialization: structured logging via `tracing` +
//! `tracing-subscriber`, configurable as human-readable or JSON.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, ObservabilityConfig};

/// Initialize the global tracing subscriber from configuration. Returns a
/// guard that, for symmetry with the rest of this codebase's bootstrap
/// sequence, holds nothing today but documents the shutdown point for any
/// future sink that needs to flush.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<TracingGuard, TracingError> {
    let filter = build_env_filter(config);

    match config.log_format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| TracingError::Init(e.to_string()))?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| TracingError::Init(e.to_string()))?;
        }
    }

    Ok(TracingGuard)
}

/// Build the environment filter: `RUST_LOG` wins if set, else the
/// configured filter directives appended to the configured base level, else
/// a base level with noisy dependency crates quieted.
fn build_env_filter(config: &ObservabilityConfig) -> EnvFilter {
    let base_level = config.log_level.as_directive();

    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else if let Some(filter) = &config.filter {
        let combined = format!("{base_level},{filter}");
        EnvFilter::try_new(combined).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else {
        EnvFilter::new(format!(
            "{base_level},hyper=warn,h2=warn,tower=info,reqwest=warn"
        ))
    }
}

/// Held for the lifetime of the process; dropping it is the shutdown point
/// for any future flush-on-exit logging sink.
pub struct TracingGuard;

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("failed to initialize tracing: {0}")]
    Init(String),
}
