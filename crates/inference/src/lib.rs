pub mod annotate;
pub mod backend;
pub mod config;
pub mod detection;
pub mod detector;
pub mod error;
pub mod processing;
pub mod resolver;
pub mod runs;

// Re-export commonly used types for convenience
pub use backend::{InferenceBackend, InferenceOutput};
pub use config::{DetectorConfig, ModelSelector};
pub use detection::{BoundingBox, Detection, DetectionRun};
pub use detector::{Detector, Detectors};
pub use error::{DetectError, ResolveError};
pub use resolver::{ResolvedResult, latest_result, resolve_output};
pub use runs::RunAllocator;
