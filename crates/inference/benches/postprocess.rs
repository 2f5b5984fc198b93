use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use inference::DetectorConfig;
use inference::annotate::annotate;
use inference::detection::{BoundingBox, Detection};
use inference::processing::{PostProcessor, PredictionPass, TransformParams};
use image::{Rgb, RgbImage};
use ndarray::{Array, IxDyn};

/// Mock YOLO output `[1, 4 + classes, anchors]` with `num_hits` confident anchors
fn create_mock_yolo_output(num_anchors: usize, num_classes: usize, num_hits: usize) -> ndarray::ArrayD<f32> {
    let mut output = Array::zeros(IxDyn(&[1, 4 + num_classes, num_anchors]));

    for i in 0..num_anchors {
        let col = (i % 40) as f32;
        let row = (i / 40 % 40) as f32;
        output[[0, 0, i]] = 8.0 + col * 16.0;
        output[[0, 1, i]] = 8.0 + row * 16.0;
        output[[0, 2, i]] = 30.0;
        output[[0, 3, i]] = 60.0;
        output[[0, 4 + i % num_classes, i]] = if i < num_hits { 0.9 } else { 0.01 };
    }

    output
}

fn transform() -> TransformParams {
    TransformParams {
        orig_width: 1920,
        orig_height: 1080,
        input_width: 640,
        input_height: 640,
        scale: 1.0 / 3.0,
        offset_x: 0.0,
        offset_y: 140.0,
    }
}

fn benchmark_postprocessing(c: &mut Criterion) {
    let mut group = c.benchmark_group("postprocessing");
    let config = DetectorConfig {
        max_detections: 300,
        ..DetectorConfig::lamp()
    };
    let post_processor = PostProcessor::new(&config);
    let transform = transform();

    let hit_counts = [0, 5, 50, 500];

    for num_hits in hit_counts.iter() {
        let output = create_mock_yolo_output(8400, 2, *num_hits);

        group.bench_with_input(
            BenchmarkId::new("parse_detections", num_hits),
            &output,
            |b, output| {
                b.iter(|| {
                    let passes = [PredictionPass {
                        predictions: output.view(),
                        flipped: false,
                    }];
                    post_processor
                        .parse_detections(black_box(&passes), black_box(&transform))
                        .unwrap()
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("parse_detections_augmented", num_hits),
            &output,
            |b, output| {
                b.iter(|| {
                    let passes = [
                        PredictionPass {
                            predictions: output.view(),
                            flipped: false,
                        },
                        PredictionPass {
                            predictions: output.view(),
                            flipped: true,
                        },
                    ];
                    post_processor
                        .parse_detections(black_box(&passes), black_box(&transform))
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

fn benchmark_annotation(c: &mut Criterion) {
    let mut group = c.benchmark_group("annotation");

    let image = RgbImage::from_pixel(1920, 1080, Rgb([90, 90, 90]));
    let detections: Vec<Detection> = (0..10)
        .map(|i| Detection {
            label: "lamp".to_string(),
            class_id: 0,
            confidence: 0.8,
            bbox: BoundingBox {
                x1: 100.0 + i as f32 * 150.0,
                y1: 200.0,
                x2: 200.0 + i as f32 * 150.0,
                y2: 700.0,
            },
        })
        .collect();

    group.bench_function("annotate_1920x1080_10_boxes", |b| {
        b.iter(|| annotate(black_box(&image), black_box(&detections)));
    });

    group.finish();
}

criterion_group!(benches, benchmark_postprocessing, benchmark_annotation);
criterion_main!(benches);
