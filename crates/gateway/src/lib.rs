pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod routes;
pub mod state;

pub use error::PipelineError;
pub use pipeline::{DetectionPipeline, ResultImage, Upload};
pub use routes::router;
pub use state::AppState;
