//! YOLOv8 object detection backend
//!
//! Loads a YOLOv8 ONNX export, runs it on a 640×640 resize of the upright
//! analysis image and returns every class above the score threshold after
//! greedy NMS. Class names come back as text labels so the caption reads
//! e.g. `"cup 91%"`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::{debug, info};

use super::{Label, ObjectDetector, RawDetection};
use crate::config::DetectionConfig;
use crate::geometry::{BBox, Dimensions};

/// YOLOv8 input size (square).
const YOLO_SIZE: u32 = 640;

/// COCO class names in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Candidate box before NMS.
#[derive(Debug, Clone, Copy)]
struct Scored {
    bbox: BBox,
    class: usize,
    score: f32,
}

/// Wraps the YOLOv8 ONNX session.
pub struct YoloDetector {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
    score_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl YoloDetector {
    /// Load a YOLOv8 ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P, config: &DetectionConfig) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = build_ort_session(model_path, config.intra_threads)?;
        info!(model = %model_path.display(), "loaded YOLOv8 model");
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize],
            score_threshold: config.score_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        })
    }

    fn preprocess(&mut self, image: &RgbImage) -> Result<ort::value::DynValue> {
        let src = fr::images::ImageRef::new(
            image.width(),
            image.height(),
            image.as_raw(),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            YOLO_SIZE,
            YOLO_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize YOLO downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, 640, 640], planes filled in parallel.
        let size = (YOLO_SIZE * YOLO_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        tensor_data
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(channel, plane)| {
                for (idx, out) in plane.iter_mut().enumerate() {
                    *out = raw[idx * 3 + channel] as f32 / 255.0;
                }
            });

        let shape = [1usize, 3, YOLO_SIZE as usize, YOLO_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

impl ObjectDetector for YoloDetector {
    fn name(&self) -> String {
        "yolov8".to_string()
    }

    fn process(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let input_tensor = self.preprocess(image)?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("YOLOv8 inference failed")?;

        // Output layout: [1, 4 + classes, proposals], column-major per proposal.
        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLOv8 output tensor")?;
        if shape.len() != 3 || shape[1] <= 4 {
            bail!("unexpected YOLOv8 output shape {shape:?}");
        }
        let num_classes = (shape[1] - 4) as usize;
        let num_proposals = shape[2] as usize;

        let scale_x = image.width() as f32 / YOLO_SIZE as f32;
        let scale_y = image.height() as f32 / YOLO_SIZE as f32;
        let bounds = Dimensions::new(image.width(), image.height());
        let threshold = self.score_threshold;

        let candidates: Vec<Scored> = (0..num_proposals)
            .into_par_iter()
            .filter_map(|i| {
                let (class, score) = (0..num_classes)
                    .map(|c| (c, data[(4 + c) * num_proposals + i]))
                    .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
                if score < threshold {
                    return None;
                }

                let cx = data[i];
                let cy = data[num_proposals + i];
                let w = data[2 * num_proposals + i];
                let h = data[3 * num_proposals + i];

                // (cx, cy, w, h) in 640-space → (x1, y1, x2, y2) in image pixels
                let bbox = BBox::new(
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                )
                .clamped(bounds);
                Some(Scored { bbox, class, score })
            })
            .collect();

        let mut kept = nms(candidates, self.iou_threshold);
        kept.truncate(self.max_detections);
        debug!(kept = kept.len(), "YOLOv8 detections after NMS");

        Ok(kept
            .into_iter()
            .map(|s| RawDetection {
                bbox: s.bbox,
                classification: None,
                labels: vec![Label {
                    text: COCO_CLASSES
                        .get(s.class)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| format!("class {}", s.class)),
                    confidence: s.score,
                }],
                tracking_id: None,
            })
            .collect())
    }
}

fn build_ort_session(model_path: &Path, intra_threads: usize) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(intra_threads.max(1))
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_execution_providers([
            ep::CoreMLExecutionProvider::default()
                .with_compute_units(ep::coreml::CoreMLComputeUnits::CPUAndNeuralEngine)
                .build(),
            ep::CPUExecutionProvider::default().build(),
        ])
        .context("failed to register execution providers")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load YOLOv8 ONNX model {}", model_path.display()))
}

/// Greedy per-class NMS: sort by score descending, suppress overlapping boxes
/// of the same class.
fn nms(mut boxes: Vec<Scored>, iou_thresh: f32) -> Vec<Scored> {
    boxes.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Scored> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].class == boxes[j].class && boxes[i].bbox.iou(&boxes[j].bbox) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}
