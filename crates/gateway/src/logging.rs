use crate::config::Config;
use common::TelemetryGuard;

/// Install the tracing subscriber, exporting over OTLP when an endpoint is set.
///
/// The returned guard must be held for the lifetime of the process so pending
/// spans and metrics are flushed on shutdown.
pub fn setup_logging(config: &Config) -> anyhow::Result<Option<TelemetryGuard>> {
    match &config.otel_endpoint {
        Some(endpoint) => TelemetryGuard::init(
            "gateway",
            endpoint,
            config.environment,
            config.log_level,
        )
        .map(Some),
        None => {
            common::setup_logging(config.log_level, config.environment);
            Ok(None)
        }
    }
}
