use crate::config::StorageConfig;
use crate::error::PipelineError;
use axum::body::Bytes;
use inference::{
    Detection, DetectionRun, Detectors, ModelSelector, ResolvedResult, latest_result,
    resolve_output,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// The `file` part of a multipart request.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Bytes,
}

/// Annotated image ready to be sent back.
#[derive(Debug)]
pub struct ResultImage {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Uploaded bytes on disk, removed when dropped unless archived.
struct StagedUpload {
    id: Uuid,
    path: PathBuf,
    armed: bool,
}

impl StagedUpload {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn archive_to(mut self, destination: &Path) -> Result<(), PipelineError> {
        if let Err(e) = tokio::fs::rename(&self.path, destination).await {
            // rename fails across filesystems
            tracing::debug!(error = %e, "Rename failed, copying staged upload instead");
            tokio::fs::copy(&self.path, destination)
                .await
                .map_err(PipelineError::storage(destination))?;
            tokio::fs::remove_file(&self.path)
                .await
                .map_err(PipelineError::storage(&self.path))?;
        }
        self.armed = false;
        Ok(())
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "Removed staged upload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged upload")
            }
        }
    }
}

struct PipelineMetrics {
    requests: Counter<u64>,
    duration: Histogram<f64>,
    detections: Counter<u64>,
}

fn init_metrics(meter_name: &'static str) -> PipelineMetrics {
    let meter = global::meter(meter_name);
    let latency_buckets = [
        0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0, 30.0,
    ];
    PipelineMetrics {
        requests: meter
            .u64_counter("detection_requests_total")
            .with_description("Detection requests by model, endpoint and outcome")
            .build(),
        duration: meter
            .f64_histogram("detection_request_duration_seconds")
            .with_description("Time from accepted upload to response payload")
            .with_unit("s")
            .with_boundaries(latency_buckets.to_vec())
            .build(),
        detections: meter
            .u64_counter("detections_total")
            .with_description("Total detections returned")
            .build(),
    }
}

impl PipelineMetrics {
    fn record<T>(
        &self,
        model: Option<ModelSelector>,
        endpoint: &'static str,
        result: &Result<T, PipelineError>,
        start: Instant,
    ) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        let model = model.map(|m| m.as_str()).unwrap_or("any");
        let attributes = [
            KeyValue::new("model", model),
            KeyValue::new("endpoint", endpoint),
            KeyValue::new("outcome", outcome),
        ];
        self.requests.add(1, &attributes);
        self.duration.record(start.elapsed().as_secs_f64(), &attributes[..2]);
    }
}

fn validate(upload: Option<Upload>) -> Result<Upload, PipelineError> {
    let upload = upload.ok_or(PipelineError::MissingFile("No file provided"))?;
    if upload.file_name.is_empty() {
        return Err(PipelineError::MissingFile("No filename provided"));
    }
    Ok(upload)
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Upload-to-response flow shared by every detection endpoint.
pub struct DetectionPipeline {
    detectors: Arc<Detectors>,
    storage: StorageConfig,
    metrics: PipelineMetrics,
}

impl DetectionPipeline {
    pub fn new(detectors: Detectors, storage: StorageConfig) -> Self {
        Self {
            detectors: Arc::new(detectors),
            storage,
            metrics: init_metrics("gateway"),
        }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Detect and report boxes as data; the accepted upload is archived
    /// under the result directory.
    #[tracing::instrument(skip(self, selector, upload), fields(model = %selector))]
    pub async fn detect_and_report(
        &self,
        selector: ModelSelector,
        upload: Option<Upload>,
    ) -> Result<Vec<Detection>, PipelineError> {
        let start = Instant::now();
        let result = self.report(selector, upload).await;
        self.metrics.record(Some(selector), "report", &result, start);
        if let Ok(detections) = &result {
            self.metrics.detections.add(
                detections.len() as u64,
                &[KeyValue::new("model", selector.as_str())],
            );
        }
        result
    }

    /// Detect and return the annotated image this very request produced.
    #[tracing::instrument(skip(self, selector, upload), fields(model = %selector))]
    pub async fn detect_and_stream_image(
        &self,
        selector: ModelSelector,
        upload: Option<Upload>,
    ) -> Result<ResultImage, PipelineError> {
        let start = Instant::now();
        let result = self.stream_image(selector, upload).await;
        self.metrics.record(Some(selector), "image", &result, start);
        result
    }

    /// Annotated image of the most recently created run, from any detector.
    #[tracing::instrument(skip(self))]
    pub async fn latest_image(&self) -> Result<ResultImage, PipelineError> {
        let start = Instant::now();
        let result = self.latest().await;
        self.metrics.record(None, "display", &result, start);
        result
    }

    async fn report(
        &self,
        selector: ModelSelector,
        upload: Option<Upload>,
    ) -> Result<Vec<Detection>, PipelineError> {
        let upload = validate(upload)?;
        let staged = self.stage(&upload).await?;
        let (staged, run) = self.run_detector(selector, staged).await?;
        let run = run?;

        tokio::fs::create_dir_all(&self.storage.result_dir)
            .await
            .map_err(PipelineError::storage(&self.storage.result_dir))?;
        let archived = self.storage.result_dir.join(format!("{}.jpg", staged.id));
        staged.archive_to(&archived).await?;

        tracing::info!(
            detections = run.detections.len(),
            run_dir = %run.run_dir.display(),
            archived = %archived.display(),
            "Detection reported"
        );

        Ok(run.detections)
    }

    async fn stream_image(
        &self,
        selector: ModelSelector,
        upload: Option<Upload>,
    ) -> Result<ResultImage, PipelineError> {
        let upload = validate(upload)?;
        let staged = self.stage(&upload).await?;
        let (_staged, run) = self.run_detector(selector, staged).await?;
        let run = run?;

        let resolved = resolve_output(&run)?;
        let image = read_image(resolved).await?;

        tracing::info!(
            detections = run.detections.len(),
            output = %image.path.display(),
            "Detection image produced"
        );

        Ok(image)
    }

    async fn latest(&self) -> Result<ResultImage, PipelineError> {
        let root = self.storage.runs_root.clone();
        let resolved = tokio::task::spawn_blocking(move || latest_result(&root)).await??;
        read_image(resolved).await
    }

    /// Write the upload to a path unique to this request.
    async fn stage(&self, upload: &Upload) -> Result<StagedUpload, PipelineError> {
        tokio::fs::create_dir_all(&self.storage.upload_dir)
            .await
            .map_err(PipelineError::storage(&self.storage.upload_dir))?;

        let id = Uuid::new_v4();
        let staged = StagedUpload {
            id,
            path: self.storage.upload_dir.join(format!("{}.jpg", id)),
            armed: true,
        };

        tokio::fs::write(staged.path(), &upload.bytes)
            .await
            .map_err(PipelineError::storage(staged.path()))?;

        tracing::debug!(
            file_name = %upload.file_name,
            bytes = upload.bytes.len(),
            staged = %staged.path().display(),
            "Upload staged"
        );

        Ok(staged)
    }

    /// Run the detector on a blocking thread. The staged file travels with
    /// the job so it outlives the detector even if the request is dropped.
    async fn run_detector(
        &self,
        selector: ModelSelector,
        staged: StagedUpload,
    ) -> Result<(StagedUpload, Result<DetectionRun, inference::DetectError>), PipelineError> {
        let detectors = Arc::clone(&self.detectors);
        let job = tokio::task::spawn_blocking(move || {
            let run = detectors.detect(selector, staged.path());
            (staged, run)
        });
        Ok(job.await?)
    }
}

async fn read_image(resolved: ResolvedResult) -> Result<ResultImage, PipelineError> {
    if !resolved.is_jpeg() {
        return Err(PipelineError::UnsupportedResultFormat {
            extension: resolved.extension,
        });
    }

    let bytes = tokio::fs::read(&resolved.path)
        .await
        .map_err(PipelineError::storage(&resolved.path))?;

    Ok(ResultImage {
        content_type: content_type_for(&resolved.extension),
        path: resolved.path,
        bytes,
    })
}
