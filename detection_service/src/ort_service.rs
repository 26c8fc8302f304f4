use crate::{
    config::{ModelConfig, Validatable},
    model_service::ModelService,
};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array, ArrayViewD, Axis, Ix2, Ix4};
use nudity_proto::{Detection, DetectionBatch, ImageFrame};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tonic::{async_trait, Status};

/// Number of leading box coordinates (xc, yc, w, h) in every output row.
const BOX_FIELDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    class_id: u32,
    confidence: f32,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

fn intersection(a: &Candidate, b: &Candidate) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.);
    w * h
}

fn union(a: &Candidate, b: &Candidate) -> f32 {
    a.width * a.height + b.width * b.height - intersection(a, b)
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let union = union(a, b);
    if union <= 0. {
        return 0.;
    }
    intersection(a, b) / union
}

/// Class-agnostic greedy NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::new();

    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }

    kept
}

/// Letterboxed model input plus the factor mapping model pixels back to source pixels.
struct PreparedInput {
    tensor: Array<f32, Ix4>,
    scale: f32,
    width: u32,
    height: u32,
}

fn transform_image_frame(image_frame: &ImageFrame, input_size: u32) -> Result<PreparedInput, String> {
    let image_reader = image::ImageReader::new(std::io::Cursor::new(&image_frame.image_data))
        .with_guessed_format()
        .map_err(|e| format!("Error decoding image: {}", e))?;

    let original_img = image_reader
        .decode()
        .map_err(|e| format!("Error decoding image: {}", e))?;

    let (img_width, img_height) = original_img.dimensions();
    let side = img_width.max(img_height);

    // Pad to a square anchored at the top-left so box offsets need no shift.
    let mut padded = RgbImage::new(side, side);
    image::imageops::overlay(&mut padded, &original_img.to_rgb8(), 0, 0);
    let img = DynamicImage::ImageRgb8(padded).resize_exact(
        input_size,
        input_size,
        FilterType::Triangle,
    );

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok(PreparedInput {
        tensor: input,
        scale: side as f32 / input_size as f32,
        width: img_width,
        height: img_height,
    })
}

/// Decodes a `[1, 4 + classes, anchors]` output into candidates above `min_probability`.
fn decode_output(
    output: ArrayViewD<'_, f32>,
    prepared: &PreparedInput,
    min_probability: f32,
) -> Result<Vec<Candidate>, String> {
    if output.ndim() != 3 || output.shape()[0] != 1 || output.shape()[1] <= BOX_FIELDS {
        return Err(format!("unexpected output shape {:?}", output.shape()));
    }

    let output = output
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .map_err(|e| format!("invalid output dimensions: {}", e))?;

    let max_x = prepared.width as f32;
    let max_y = prepared.height as f32;
    let mut candidates = Vec::new();

    for row in output.t().axis_iter(Axis(0)) {
        let best = row
            .iter()
            .skip(BOX_FIELDS)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });

        let Some((class_id, prob)) = best else {
            continue;
        };
        if prob < min_probability {
            continue;
        }

        let xc = row[0] * prepared.scale;
        let yc = row[1] * prepared.scale;
        let w = row[2] * prepared.scale;
        let h = row[3] * prepared.scale;

        let x1 = (xc - w / 2.).clamp(0., max_x);
        let y1 = (yc - h / 2.).clamp(0., max_y);
        let x2 = (xc + w / 2.).clamp(0., max_x);
        let y2 = (yc + h / 2.).clamp(0., max_y);

        candidates.push(Candidate {
            class_id: class_id as u32,
            confidence: prob,
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        });
    }

    Ok(candidates)
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    min_probability: f32,
    nms_threshold: f32,
    input_size: u32,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            num_instances,
            model_config.get_path()
        );

        Ok(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(sessions),
            min_probability: model_config.min_probability,
            nms_threshold: model_config.nms_threshold,
            input_size: model_config.input_size,
        })
    }

    pub fn run_inference(
        &self,
        input: &Array<f32, Ix4>,
    ) -> Result<ndarray::ArrayD<f32>, Box<Status>> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let session_arc = &self.sessions[index];
        let mut session = session_arc
            .lock()
            .map_err(|e| Status::internal(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| Status::internal(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| Status::internal(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Status::internal(format!("failed to extract tensor: {}", e)))?;

        let array = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| Status::internal(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn detect(&self, frame: ImageFrame) -> Result<DetectionBatch, Status> {
        let prepared = transform_image_frame(&frame, self.input_size).map_err(|err| {
            Status::invalid_argument(format!("Image transformation error: {}", err))
        })?;

        let service = self.clone();
        let tensor = prepared.tensor.clone();
        let outputs = tokio::task::spawn_blocking(move || service.run_inference(&tensor))
            .await
            .map_err(|e| Status::internal(format!("inference task failed: {}", e)))?
            .map_err(|e| *e)?;

        let candidates = decode_output(outputs.view(), &prepared, self.min_probability)
            .map_err(Status::internal)?;
        let kept = non_max_suppression(candidates, self.nms_threshold);

        let detections = kept
            .into_iter()
            .map(|c| Detection {
                class_id: c.class_id,
                confidence: c.confidence,
                x: c.x,
                y: c.y,
                width: c.width,
                height: c.height,
            })
            .collect();

        Ok(DetectionBatch {
            detections,
            timestamp: frame.timestamp,
        })
    }
}
