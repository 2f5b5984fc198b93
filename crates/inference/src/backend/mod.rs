use ndarray::{Array, IxDyn};

#[cfg(feature = "ort-backend")]
pub mod ort;

pub trait InferenceBackend: Send {
    fn load_model(path: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Run inference on a letterboxed NCHW batch of one image
    fn infer(&mut self, images: &Array<f32, IxDyn>) -> anyhow::Result<InferenceOutput>;

    /// Class table embedded in the model file, if the export carries one
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }
}

pub struct InferenceOutput {
    pub predictions: ndarray::ArrayD<f32>, // [1, 4 + num_classes, num_anchors] cxcywh in input pixels
}

/// Parse the `names` metadata entry written by YOLO exporters,
/// e.g. `{0: 'pole', 1: 'lamp'}`.
pub fn parse_class_names(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;

    let mut entries = Vec::new();
    for entry in body.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (index, name) = entry.split_once(':')?;
        let index: usize = index.trim().parse().ok()?;
        let name = name.trim().trim_matches(|c| c == '\'' || c == '"');
        entries.push((index, name.to_string()));
    }

    entries.sort_by_key(|(index, _)| *index);
    if entries.is_empty() || entries.iter().enumerate().any(|(i, (index, _))| i != *index) {
        return None;
    }

    Some(entries.into_iter().map(|(_, name)| name).collect())
}
