use crate::config::{Environment, LogLevel};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the level filter: `RUST_LOG` wins, otherwise the configured level.
pub(crate) fn env_filter(log_level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()))
}

/// Initialize tracing subscriber with pretty formatting for development
/// and JSON formatting for production.
///
/// Also adds an OpenTelemetry layer that exports traces if a global tracer provider
/// has been initialized (e.g. via `TelemetryGuard::init`).
pub fn setup_logging(log_level: LogLevel, environment: Environment) {
    let otel_layer = tracing_opentelemetry::layer();

    let registry = tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(otel_layer);

    match environment {
        Environment::Production => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_level(true))
                .init();
        }
        Environment::Development => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
                .init();
        }
    }
}
