use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    /// The image could not be decoded or the model failed internally.
    #[error("Model invocation failed: {0:#}")]
    ModelInvocation(anyhow::Error),

    #[error("Failed to prepare run directory {}: {source}", .path.display())]
    RunDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to save annotated image {}: {source}", .path.display())]
    SaveArtifact {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No run directories found under {}", .0.display())]
    NoRunsFound(PathBuf),

    #[error("Run directory {} contains no result file", .0.display())]
    EmptyRunDirectory(PathBuf),

    #[error("Result file {} has no extension", .0.display())]
    MissingExtension(PathBuf),

    #[error("IO error while resolving {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
