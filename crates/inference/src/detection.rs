use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Axis-aligned box in source-image pixels, `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// One box reported by a detector, in the JSON shape clients consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "name")]
    pub label: String,
    #[serde(rename = "class")]
    pub class_id: u32,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// Everything one detector invocation produced.
#[derive(Debug, Clone)]
pub struct DetectionRun {
    pub detections: Vec<Detection>,
    /// Run directory allocated for this invocation
    pub run_dir: PathBuf,
    /// Annotated image written inside `run_dir`
    pub output_file: PathBuf,
}
