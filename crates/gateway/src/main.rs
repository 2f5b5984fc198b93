use anyhow::Context;
use gateway::{
    AppState, DetectionPipeline,
    config::{Config, get_configuration},
    logging::setup_logging,
    router,
};
use inference::{
    Detector, Detectors, ModelSelector, RunAllocator, backend::InferenceBackend,
    backend::ort::OrtBackend,
};
use std::sync::Arc;

fn load_detector(
    config: &Config,
    selector: ModelSelector,
    runs: &Arc<RunAllocator>,
) -> anyhow::Result<Detector> {
    let model = config.model(selector);

    tracing::info!(model = %selector, path = %model.model_path, "Loading detection model");
    let backend = OrtBackend::load_model(&model.model_path)
        .with_context(|| format!("Failed to load {} model", selector))?;

    Ok(Detector::new(
        selector,
        model.detector.clone(),
        Box::new(backend),
        model.class_names.clone(),
        Arc::clone(runs),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = get_configuration().context("Failed to load configuration")?;
    let _telemetry = setup_logging(&config)?;

    tracing::info!(config = ?config, "Loaded configuration");

    let runs = Arc::new(RunAllocator::new(&config.storage.runs_root));
    let detectors = Detectors::new(
        load_detector(&config, ModelSelector::Pole, &runs)?,
        load_detector(&config, ModelSelector::Lamp, &runs)?,
    )?;

    let pipeline = DetectionPipeline::new(detectors, config.storage.clone());
    let app = router(AppState::new(pipeline), config.server.max_upload_bytes);

    let address = config.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    tracing::info!("Detection server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Detection server stopped");
    Ok(())
}
