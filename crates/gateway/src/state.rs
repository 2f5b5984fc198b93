use crate::pipeline::DetectionPipeline;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DetectionPipeline>,
}

impl AppState {
    pub fn new(pipeline: DetectionPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}
