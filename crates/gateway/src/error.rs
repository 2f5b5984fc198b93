use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use inference::{DetectError, ResolveError};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// No usable `file` part in the request
    #[error("{0}")]
    MissingFile(&'static str),

    #[error("Invalid file format")]
    UnsupportedResultFormat { extension: String },

    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Storage error on {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Detection worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl PipelineError {
    pub fn storage(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| PipelineError::Storage { path, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::MissingFile(_) | PipelineError::UnsupportedResultFormat { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Multipart(e) => e.status(),
            PipelineError::Detect(_)
            | PipelineError::Resolve(_)
            | PipelineError::Storage { .. }
            | PipelineError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for metrics attributes
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MissingFile(_) => "missing_file",
            PipelineError::UnsupportedResultFormat { .. } => "unsupported_format",
            PipelineError::Multipart(_) => "multipart",
            PipelineError::Detect(_) => "detect",
            PipelineError::Resolve(_) => "resolve",
            PipelineError::Storage { .. } => "storage",
            PipelineError::Worker(_) => "worker",
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        } else {
            tracing::warn!(error = %self, kind = self.kind(), "Request rejected");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
