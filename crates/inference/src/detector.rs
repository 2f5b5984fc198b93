use crate::{
    annotate::annotate,
    backend::InferenceBackend,
    config::{DetectorConfig, ModelSelector},
    detection::{Detection, DetectionRun},
    error::DetectError,
    processing::{PostProcessor, PredictionPass, RawDetection, TransformParams},
    runs::RunAllocator,
};
use anyhow::Context;
use common::span;
use image::{ImageFormat, ImageReader, RgbImage};
use opentelemetry::{KeyValue, global, metrics::Histogram};
use preprocess::{CpuPreProcessor, Preprocess, flip_horizontal};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct Engine {
    backend: Box<dyn InferenceBackend>,
    preprocessor: Box<dyn Preprocess + Send>,
}

fn init_metrics(meter_name: &'static str) -> Histogram<f64> {
    let meter = global::meter(meter_name);
    let latency_buckets = [0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0];
    meter
        .f64_histogram("inference_duration_seconds")
        .with_description("Time to run one detector (decode + infer + postprocess + annotate)")
        .with_unit("s")
        .with_boundaries(latency_buckets.to_vec())
        .build()
}

/// One loaded model with its fixed parameters.
///
/// The backend session needs exclusive access, so concurrent calls on the
/// same detector queue on its engine lock. Different detectors run in
/// parallel.
pub struct Detector {
    selector: ModelSelector,
    config: DetectorConfig,
    class_names: Vec<String>,
    engine: Mutex<Engine>,
    postprocessor: PostProcessor,
    runs: Arc<RunAllocator>,
    duration_histogram: Histogram<f64>,
}

impl Detector {
    /// `class_names` is only used when the model file carries no class table.
    pub fn new(
        selector: ModelSelector,
        config: DetectorConfig,
        backend: Box<dyn InferenceBackend>,
        class_names: Vec<String>,
        runs: Arc<RunAllocator>,
    ) -> Self {
        let class_names = backend.class_names().unwrap_or(class_names);

        tracing::info!(
            model = %selector,
            input_size = config.input_size,
            confidence_threshold = config.confidence_threshold,
            iou_threshold = config.iou_threshold,
            augment = config.augment,
            max_detections = config.max_detections,
            classes = ?class_names,
            "Detector ready"
        );

        Self {
            selector,
            postprocessor: PostProcessor::new(&config),
            engine: Mutex::new(Engine {
                backend,
                preprocessor: Box::new(CpuPreProcessor::new(config.input_dims())),
            }),
            config,
            class_names,
            runs,
            duration_histogram: init_metrics("inference"),
        }
    }

    pub fn selector(&self) -> ModelSelector {
        self.selector
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn runs(&self) -> &RunAllocator {
        &self.runs
    }

    /// Detect objects in the image at `image_path`.
    ///
    /// Writes an annotated copy as `<stem>.jpg` into a freshly allocated run
    /// directory and reports both locations. The input file is only read.
    #[tracing::instrument(skip(self), fields(model = %self.selector))]
    pub fn detect(&self, image_path: &Path) -> Result<DetectionRun, DetectError> {
        let start = Instant::now();

        let image = load_image(image_path).map_err(DetectError::ModelInvocation)?;

        let detections = {
            let mut engine = self.engine.lock().map_err(|_| {
                DetectError::ModelInvocation(anyhow::anyhow!(
                    "{} detector engine lock poisoned",
                    self.selector
                ))
            })?;
            self.run_model(&mut engine, &image)
                .map_err(DetectError::ModelInvocation)?
        };

        let run_dir = self
            .runs
            .allocate()
            .map_err(|source| DetectError::RunDirectory {
                path: self.runs.root().to_path_buf(),
                source,
            })?;

        let stem = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let output_file = run_dir.join(format!("{}.jpg", stem));

        save_artifact(&image, &detections, &run_dir, &output_file)?;

        self.duration_histogram.record(
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("model", self.selector.as_str())],
        );

        tracing::debug!(
            detections = detections.len(),
            output = %output_file.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Detection complete"
        );

        Ok(DetectionRun {
            detections,
            run_dir,
            output_file,
        })
    }

    fn run_model(&self, engine: &mut Engine, image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let (input_width, input_height) = engine.preprocessor.input_size();

        let prepared = engine
            .preprocessor
            .preprocess(image.as_raw(), width, height)?;

        let primary = {
            let _s = span!("infer");
            engine.backend.infer(&prepared.tensor)?
        };

        let mirrored = if self.config.augment {
            let _s = span!("infer_flipped");
            Some(engine.backend.infer(&flip_horizontal(&prepared.tensor))?)
        } else {
            None
        };

        let mut passes = vec![PredictionPass {
            predictions: primary.predictions.view(),
            flipped: false,
        }];
        if let Some(output) = &mirrored {
            passes.push(PredictionPass {
                predictions: output.predictions.view(),
                flipped: true,
            });
        }

        let transform = TransformParams {
            orig_width: width,
            orig_height: height,
            input_width,
            input_height,
            scale: prepared.scale,
            offset_x: prepared.offset_x,
            offset_y: prepared.offset_y,
        };

        let raw = self.postprocessor.parse_detections(&passes, &transform)?;

        Ok(raw.into_iter().map(|r| self.label(r)).collect())
    }

    fn label(&self, raw: RawDetection) -> Detection {
        let label = self
            .class_names
            .get(raw.class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", raw.class_id));

        Detection {
            label,
            class_id: raw.class_id as u32,
            confidence: raw.confidence,
            bbox: raw.bbox,
        }
    }
}

fn load_image(path: &Path) -> anyhow::Result<RgbImage> {
    let _s = span!("decode_image");
    let image = ImageReader::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to read image {}", path.display()))?
        .decode()
        .with_context(|| format!("Failed to decode image {}", path.display()))?;
    Ok(image.to_rgb8())
}

/// Write the annotated image. A run directory left without its artifact
/// is removed so it never becomes the latest result.
fn save_artifact(
    image: &RgbImage,
    detections: &[Detection],
    run_dir: &Path,
    output_file: &Path,
) -> Result<(), DetectError> {
    let _s = span!("save_artifact");
    if let Err(source) = annotate(image, detections).save_with_format(output_file, ImageFormat::Jpeg)
    {
        if let Err(e) = std::fs::remove_dir_all(run_dir) {
            tracing::warn!(run_dir = %run_dir.display(), error = %e, "Failed to remove run directory");
        }
        return Err(DetectError::SaveArtifact {
            path: output_file.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Process-wide registry holding one detector per selector.
pub struct Detectors {
    pole: Detector,
    lamp: Detector,
}

impl Detectors {
    pub fn new(pole: Detector, lamp: Detector) -> anyhow::Result<Self> {
        if pole.selector() != ModelSelector::Pole || lamp.selector() != ModelSelector::Lamp {
            anyhow::bail!(
                "Detectors registered under the wrong selector (pole slot: {}, lamp slot: {})",
                pole.selector(),
                lamp.selector()
            );
        }
        Ok(Self { pole, lamp })
    }

    pub fn get(&self, selector: ModelSelector) -> &Detector {
        match selector {
            ModelSelector::Pole => &self.pole,
            ModelSelector::Lamp => &self.lamp,
        }
    }

    pub fn detect(
        &self,
        selector: ModelSelector,
        image_path: &Path,
    ) -> Result<DetectionRun, DetectError> {
        self.get(selector).detect(image_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceOutput;
    use image::Rgb;
    use ndarray::{Array, IxDyn};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    /// Returns the same anchors for every call and counts invocations.
    struct StubBackend {
        anchors: Vec<[f32; 5]>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl InferenceBackend for StubBackend {
        fn load_model(_path: &str) -> anyhow::Result<Self> {
            anyhow::bail!("stub backend has no model file")
        }

        fn infer(&mut self, _images: &Array<f32, IxDyn>) -> anyhow::Result<InferenceOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("session run failed");
            }
            let n = self.anchors.len();
            let mut predictions = Array::zeros(IxDyn(&[1, 5, n]));
            for (i, anchor) in self.anchors.iter().enumerate() {
                for (k, v) in anchor.iter().enumerate() {
                    predictions[[0, k, i]] = *v;
                }
            }
            Ok(InferenceOutput { predictions })
        }
    }

    struct Fixture {
        dir: TempDir,
        calls: Arc<AtomicUsize>,
        detector: Detector,
    }

    fn fixture(config: DetectorConfig, anchors: Vec<[f32; 5]>, fail: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = StubBackend {
            anchors,
            calls: Arc::clone(&calls),
            fail,
        };
        let runs = Arc::new(RunAllocator::new(dir.path().join("runs/detect")));
        let detector = Detector::new(
            ModelSelector::Pole,
            config,
            Box::new(backend),
            vec!["pole".to_string()],
            runs,
        );
        Fixture {
            dir,
            calls,
            detector,
        }
    }

    /// 640x480 image: letterboxed into 640x640 with scale 1 and a 80px top band.
    fn write_image(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(640, 480, Rgb([200, 30, 30]))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        path
    }

    fn config(augment: bool, max_detections: usize) -> DetectorConfig {
        DetectorConfig {
            augment,
            max_detections,
            ..DetectorConfig::pole()
        }
    }

    #[test]
    fn test_detect_maps_box_to_source_pixels() {
        // Box centred at (320, 240) in the source, 100x200
        let fx = fixture(config(false, 10), vec![[320.0, 320.0, 100.0, 200.0, 0.9]], false);
        let input = write_image(fx.dir.path(), "pole.png");

        let run = fx.detector.detect(&input).unwrap();

        assert_eq!(run.detections.len(), 1);
        let det = &run.detections[0];
        assert_eq!(det.label, "pole");
        assert_eq!(det.class_id, 0);
        assert!((det.confidence - 0.9).abs() < 1e-6);
        assert!((det.bbox.x1 - 270.0).abs() <= 2.0);
        assert!((det.bbox.y1 - 140.0).abs() <= 2.0);
        assert!((det.bbox.x2 - 370.0).abs() <= 2.0);
        assert!((det.bbox.y2 - 340.0).abs() <= 2.0);
    }

    #[test]
    fn test_detect_writes_artifact_into_fresh_run_dir() {
        let fx = fixture(config(false, 10), vec![[320.0, 320.0, 100.0, 200.0, 0.9]], false);
        let input = write_image(fx.dir.path(), "pole.png");
        let before = fs::read(&input).unwrap();

        let first = fx.detector.detect(&input).unwrap();
        let second = fx.detector.detect(&input).unwrap();

        assert_ne!(first.run_dir, second.run_dir);
        assert_eq!(first.output_file, first.run_dir.join("pole.jpg"));
        assert!(first.output_file.is_file());
        assert!(second.output_file.is_file());
        assert_eq!(fs::read(&input).unwrap(), before, "Input must not be modified");
    }

    #[test]
    fn test_augment_runs_flipped_pass_and_merges() {
        let fx = fixture(config(true, 10), vec![[320.0, 320.0, 100.0, 200.0, 0.9]], false);
        let input = write_image(fx.dir.path(), "pole.png");

        let run = fx.detector.detect(&input).unwrap();

        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        // The mirrored pass lands on the same box and is suppressed
        assert_eq!(run.detections.len(), 1);
    }

    #[test]
    fn test_max_detections_keeps_highest_confidence() {
        let fx = fixture(
            config(false, 1),
            vec![
                [100.0, 200.0, 50.0, 50.0, 0.6],
                [500.0, 400.0, 50.0, 50.0, 0.8],
            ],
            false,
        );
        let input = write_image(fx.dir.path(), "pole.png");

        let run = fx.detector.detect(&input).unwrap();

        assert_eq!(run.detections.len(), 1);
        assert!((run.detections[0].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_no_detections_is_success() {
        let fx = fixture(config(false, 10), vec![[320.0, 320.0, 100.0, 200.0, 0.1]], false);
        let input = write_image(fx.dir.path(), "empty.png");

        let run = fx.detector.detect(&input).unwrap();

        assert!(run.detections.is_empty());
        assert!(run.output_file.is_file());
    }

    #[test]
    fn test_unknown_class_gets_fallback_label() {
        let fx = fixture(config(false, 10), vec![], false);
        let raw = RawDetection {
            bbox: crate::detection::BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
            confidence: 0.5,
            class_id: 3,
        };
        assert_eq!(fx.detector.label(raw).label, "class3");
    }

    #[test]
    fn test_undecodable_image_is_model_invocation_error() {
        let fx = fixture(config(false, 10), vec![], false);
        let input = fx.dir.path().join("broken.jpg");
        fs::write(&input, b"definitely not an image").unwrap();

        let err = fx.detector.detect(&input).unwrap_err();

        assert!(matches!(err, DetectError::ModelInvocation(_)));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert!(!fx.dir.path().join("runs/detect/predict").exists());
    }

    #[test]
    fn test_backend_failure_is_model_invocation_error() {
        let fx = fixture(config(false, 10), vec![], true);
        let input = write_image(fx.dir.path(), "pole.png");

        let err = fx.detector.detect(&input).unwrap_err();

        assert!(matches!(err, DetectError::ModelInvocation(_)));
        assert!(err.to_string().contains("session run failed"));
    }

    #[test]
    fn test_failed_save_removes_run_dir() {
        let fx = fixture(config(false, 10), vec![], false);
        let image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        let run_dir = fx.detector.runs().allocate().unwrap();
        let output_file = run_dir.join("missing").join("pole.jpg");

        let err = save_artifact(&image, &[], &run_dir, &output_file).unwrap_err();

        assert!(matches!(err, DetectError::SaveArtifact { .. }));
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_registry_rejects_swapped_detectors() {
        let pole = fixture(config(false, 1), vec![], false);
        let lamp = fixture(config(false, 1), vec![], false);
        // Both fixtures are built as pole detectors
        assert!(Detectors::new(pole.detector, lamp.detector).is_err());
    }
}
