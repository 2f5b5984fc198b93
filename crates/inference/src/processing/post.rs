use crate::config::DetectorConfig;
use crate::detection::BoundingBox;
use common::span_debug;
use std::cmp::Ordering;

pub struct TransformParams {
    pub orig_width: u32,
    pub orig_height: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

/// Decoded box before class names are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
}

/// One batch of model output, optionally produced from a mirrored input.
pub struct PredictionPass<'a> {
    pub predictions: ndarray::ArrayViewD<'a, f32>,
    pub flipped: bool,
}

pub struct PostProcessor {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl PostProcessor {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }

    /// Decode YOLO output passes into image-space detections.
    ///
    /// Candidates from every pass are merged, then suppressed with class-aware
    /// NMS and capped at `max_detections`. The result is ordered by descending
    /// confidence.
    #[tracing::instrument(skip(self, passes, transform), fields(passes = passes.len()))]
    pub fn parse_detections(
        &self,
        passes: &[PredictionPass<'_>],
        transform: &TransformParams,
    ) -> anyhow::Result<Vec<RawDetection>> {
        let mut candidates = Vec::new();
        for pass in passes {
            self.collect_candidates(&pass.predictions, transform, pass.flipped, &mut candidates)?;
        }

        tracing::trace!(candidates = candidates.len(), "Candidates above threshold");

        Ok(self.suppress(candidates))
    }

    fn collect_candidates(
        &self,
        predictions: &ndarray::ArrayViewD<f32>, // [1, 4 + num_classes, num_anchors]
        transform: &TransformParams,
        flipped: bool,
        out: &mut Vec<RawDetection>,
    ) -> anyhow::Result<()> {
        let shape = predictions.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            anyhow::bail!(
                "Unexpected prediction shape {:?}, expected [1, 4 + classes, anchors]",
                shape
            );
        }

        let num_classes = shape[1] - 4;
        let num_anchors = shape[2];

        for i in 0..num_anchors {
            // Argmax over class scores
            let mut confidence = f32::NEG_INFINITY;
            let mut class_id = 0usize;
            for c in 0..num_classes {
                let score = predictions[[0, 4 + c, i]];
                if score > confidence {
                    confidence = score;
                    class_id = c;
                }
            }

            // NaN scores never win the argmax, so -inf marks "no score".
            // A score equal to the threshold is dropped.
            if confidence <= self.confidence_threshold {
                continue;
            }

            let mut cx = predictions[[0, 0, i]];
            let cy = predictions[[0, 1, i]];
            let w = predictions[[0, 2, i]];
            let h = predictions[[0, 3, i]];
            if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) {
                continue;
            }

            if flipped {
                cx = transform.input_width as f32 - cx;
            }

            let (x1, y1, x2, y2) = cxcywh_to_xyxy(cx, cy, w, h);

            out.push(RawDetection {
                bbox: unletterbox(x1, y1, x2, y2, transform),
                confidence: confidence.min(1.0),
                class_id,
            });
        }

        Ok(())
    }

    /// Greedy class-aware non-max suppression.
    pub fn suppress(&self, mut candidates: Vec<RawDetection>) -> Vec<RawDetection> {
        let _s = span_debug!("nms");

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });

        let mut kept: Vec<RawDetection> = Vec::new();

        'outer: for candidate in candidates {
            for k in &kept {
                if k.class_id == candidate.class_id
                    && k.bbox.iou(&candidate.bbox) > self.iou_threshold
                {
                    continue 'outer;
                }
            }
            kept.push(candidate);
            if kept.len() >= self.max_detections {
                break;
            }
        }

        kept
    }
}

/// Convert bounding box from center-width-height format to corner format
#[inline]
fn cxcywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
    let x1 = cx - w / 2.0;
    let y1 = cy - h / 2.0;
    let x2 = cx + w / 2.0;
    let y2 = cy + h / 2.0;
    (x1, y1, x2, y2)
}

/// Map model-input corners back onto the source image and clamp to its bounds.
fn unletterbox(x1: f32, y1: f32, x2: f32, y2: f32, transform: &TransformParams) -> BoundingBox {
    let max_x = transform.orig_width as f32;
    let max_y = transform.orig_height as f32;

    let map_x = |x: f32| ((x - transform.offset_x) / transform.scale).clamp(0.0, max_x);
    let map_y = |y: f32| ((y - transform.offset_y) / transform.scale).clamp(0.0, max_y);

    let (ax, bx) = (map_x(x1), map_x(x2));
    let (ay, by) = (map_y(y1), map_y(y2));

    BoundingBox {
        x1: ax.min(bx),
        y1: ay.min(by),
        x2: ax.max(bx),
        y2: ay.max(by),
    }
}
