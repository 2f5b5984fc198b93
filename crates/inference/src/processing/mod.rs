pub mod post;

pub use post::{PostProcessor, PredictionPass, RawDetection, TransformParams};
