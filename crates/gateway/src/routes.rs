use crate::error::PipelineError;
use crate::pipeline::{ResultImage, Upload};
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartRejection},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use inference::{Detection, ModelSelector};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct DetectionsResponse {
    pub detections: Vec<Detection>,
}

impl IntoResponse for ResultImage {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, self.content_type)], self.bytes).into_response()
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/detect", post(detect_pole))
        .route("/api/detect1", post(detect_lamp))
        .route("/api/detect_and_get_result_image", post(pole_image))
        .route("/api/detect_and_get_result_image_lum", post(lamp_image))
        .route("/display", get(display))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Pull the `file` part out of the request, if any.
///
/// A request that is not multipart at all counts as having no file.
async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Option<Upload>, PipelineError> {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            tracing::debug!(%rejection, "Request carries no multipart body");
            return Ok(None);
        }
    };

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;
        return Ok(Some(Upload { file_name, bytes }));
    }

    Ok(None)
}

async fn report(
    state: AppState,
    selector: ModelSelector,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionsResponse>, PipelineError> {
    let upload = read_upload(multipart).await?;
    let detections = state.pipeline.detect_and_report(selector, upload).await?;
    Ok(Json(DetectionsResponse { detections }))
}

async fn stream(
    state: AppState,
    selector: ModelSelector,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<ResultImage, PipelineError> {
    let upload = read_upload(multipart).await?;
    state.pipeline.detect_and_stream_image(selector, upload).await
}

async fn detect_pole(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionsResponse>, PipelineError> {
    report(state, ModelSelector::Pole, multipart).await
}

async fn detect_lamp(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionsResponse>, PipelineError> {
    report(state, ModelSelector::Lamp, multipart).await
}

async fn pole_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<ResultImage, PipelineError> {
    stream(state, ModelSelector::Pole, multipart).await
}

async fn lamp_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<ResultImage, PipelineError> {
    stream(state, ModelSelector::Lamp, multipart).await
}

async fn display(State(state): State<AppState>) -> Result<ResultImage, PipelineError> {
    state.pipeline.latest_image().await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
