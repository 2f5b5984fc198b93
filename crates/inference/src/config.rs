use serde::Deserialize;
use std::fmt;

/// Which pretrained model a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelector {
    Pole,
    Lamp,
}

impl ModelSelector {
    pub const ALL: [ModelSelector; 2] = [ModelSelector::Pole, ModelSelector::Lamp];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSelector::Pole => "pole",
            ModelSelector::Lamp => "lamp",
        }
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed inference parameters of one detector.
///
/// Built once at startup and shared read-only by every request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectorConfig {
    /// Square model input resolution, must match the exported model.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Test-time augmentation: add a horizontally flipped pass.
    pub augment: bool,
    pub max_detections: usize,
}

impl DetectorConfig {
    pub fn pole() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.3,
            iou_threshold: 0.5,
            augment: true,
            max_detections: 1,
        }
    }

    pub fn lamp() -> Self {
        Self {
            input_size: 800,
            confidence_threshold: 0.4,
            iou_threshold: 0.5,
            augment: true,
            max_detections: 10,
        }
    }

    pub fn for_selector(selector: ModelSelector) -> Self {
        match selector {
            ModelSelector::Pole => Self::pole(),
            ModelSelector::Lamp => Self::lamp(),
        }
    }

    pub fn input_dims(&self) -> (u32, u32) {
        (self.input_size, self.input_size)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(format!(
                "input_size must be a positive multiple of 32, got {}",
                self.input_size
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.max_detections == 0 {
            return Err("max_detections must be at least 1".to_string());
        }
        Ok(())
    }
}
