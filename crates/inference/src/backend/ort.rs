use super::{InferenceBackend, InferenceOutput, parse_class_names};
use anyhow::Context;
use ndarray::{Array, IxDyn};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};

const INPUT_NAME: &str = "images";
const OUTPUT_NAME: &str = "output0";

#[derive(Debug, Clone, Copy)]
pub enum ExecutionProvider {
    Cpu,
    #[cfg(feature = "cuda")]
    Cuda,
}

impl Default for ExecutionProvider {
    fn default() -> Self {
        #[cfg(feature = "cuda")]
        {
            ExecutionProvider::Cuda
        }
        #[cfg(not(feature = "cuda"))]
        {
            ExecutionProvider::Cpu
        }
    }
}

/// ONNX Runtime session over a YOLO detection export.
pub struct OrtBackend {
    session: Session,
    class_names: Option<Vec<String>>,
}

impl OrtBackend {
    /// Load model with specified execution provider
    pub fn load_model_with_provider(
        path: &str,
        provider: ExecutionProvider,
    ) -> anyhow::Result<Self> {
        // Initialize ORT environment (idempotent)
        let _ = ort::init().commit();

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        let mut builder = match provider {
            #[cfg(feature = "cuda")]
            ExecutionProvider::Cuda => {
                tracing::info!("Initializing ONNX Runtime with CUDA execution provider");
                builder.with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default()
                        .with_device_id(0)
                        .build(),
                ])?
            }
            ExecutionProvider::Cpu => {
                tracing::info!("Initializing ONNX Runtime with CPU execution provider");
                builder
            }
        };

        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path))?;

        let class_names = session
            .metadata()
            .ok()
            .and_then(|metadata| metadata.custom("names"))
            .and_then(|raw| parse_class_names(&raw));

        tracing::info!(
            path,
            classes = ?class_names,
            "Model loaded"
        );

        Ok(Self {
            session,
            class_names,
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn load_model(path: &str) -> anyhow::Result<Self> {
        Self::load_model_with_provider(path, ExecutionProvider::default())
    }

    fn infer(&mut self, images: &Array<f32, IxDyn>) -> anyhow::Result<InferenceOutput> {
        let outputs = self.session.run(ort::inputs![
            INPUT_NAME => TensorRef::from_array_view(images.view())?
        ])?;

        let predictions = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;

        Ok(InferenceOutput {
            predictions: predictions.into_owned(),
        })
    }

    fn class_names(&self) -> Option<Vec<String>> {
        self.class_names.clone()
    }
}
