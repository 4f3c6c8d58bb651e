//! Face detection.
//!
//! [`FaceDetector`] is the seam the pipeline depends on: one RGB frame in,
//! zero or more boxes out, in frame pixel coordinates. [`ScrfdDetector`]
//! is the ONNX Runtime backend (SCRFD, 3-stride anchor decoding + NMS).

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_ACCURATE_INPUT: usize = 640;
const SCRFD_FAST_INPUT: usize = 320;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer too short: expected {expected}, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Accuracy-vs-speed tradeoff for the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    Fast,
    #[default]
    Accurate,
}

impl std::str::FromStr for PerformanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "accurate" => Ok(Self::Accurate),
            other => Err(format!("unknown performance mode: {other} (expected fast or accurate)")),
        }
    }
}

/// Detector configuration. Landmarks and classification are off by default:
/// the pipeline only needs boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    pub performance: PerformanceMode,
    pub landmarks: bool,
    pub classification: bool,
}

impl DetectorOptions {
    fn input_size(&self) -> usize {
        match self.performance {
            PerformanceMode::Fast => SCRFD_FAST_INPUT,
            PerformanceMode::Accurate => SCRFD_ACCURATE_INPUT,
        }
    }
}

/// Opaque face detector: frame in, boxes out.
pub trait FaceDetector: Send {
    /// Detect faces in a packed RGB8 frame (`width * height * 3` bytes).
    /// Boxes are in frame coordinates, highest confidence first.
    fn detect(&mut self, rgb: &[u8], width: u32, height: u32)
        -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input as f32 - new_w) / 2.0,
            pad_y: (input as f32 - new_h) / 2.0,
        }
    }

    /// Model-input coordinates back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    options: DetectorOptions,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, options: DetectorOptions) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                names.len()
            )));
        }

        let stride_outputs = output_layout(&names);
        if options.classification {
            tracing::debug!("SCRFD produces no face attributes; classification ignored");
        }
        tracing::info!(
            path = model_path,
            performance = ?options.performance,
            landmarks = options.landmarks,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            options,
            stride_outputs,
        })
    }

    /// Resize into the letterboxed square input and normalize to NCHW.
    fn preprocess(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let input = self.options.input_size();
        let expected = width as usize * height as usize * 3;
        let frame = RgbImage::from_raw(width, height, rgb[..expected.min(rgb.len())].to_vec())
            .ok_or(DetectorError::InvalidFrame {
                expected,
                actual: rgb.len(),
            })?;

        let letterbox = Letterbox::fit(width as usize, height as usize, input);
        let new_w = ((width as f32 * letterbox.scale).round() as u32).max(1);
        let new_h = ((height as f32 * letterbox.scale).round() as u32).max(1);
        let resized = imageops::resize(&frame, new_w, new_h, FilterType::Triangle);

        let x0 = letterbox.pad_x.floor() as usize;
        let y0 = letterbox.pad_y.floor() as usize;

        // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, input, input));
        for (x, y, px) in resized.enumerate_pixels() {
            let tx = x0 + x as usize;
            let ty = y0 + y as usize;
            if tx >= input || ty >= input {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        Ok((tensor, letterbox))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = self.preprocess(rgb, width, height)?;
        let grid = self.options.input_size();
        let landmarks = self.options.landmarks;
        let layout = self.stride_outputs;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = layout[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };

            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = if landmarks { Some(extract(kps_idx, "kps")?) } else { None };

            candidates.extend(decode_stride(
                StrideTensors { scores, bboxes, kps },
                stride,
                grid,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(faces = faces.len(), "SCRFD detect");
        Ok(faces)
    }
}

/// Work out which output tensor holds which stride's data.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// opaque numeric names, in which case the standard order
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]` applies.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: Option<&'a [f32]>,
}

/// Decode the detections above `threshold` for one stride level.
fn decode_stride(
    t: StrideTensors<'_>,
    stride: usize,
    input: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_w = input / stride;
    let anchors = (input / stride) * cells_w * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *t.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % cells_w) as f32 * step;
            let ay = (cell / cells_w) as f32 * step;

            let d = t.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

            let landmarks = t.kps.and_then(|kps| {
                let k = kps.get(idx * 10..idx * 10 + 10)?;
                Some(std::array::from_fn(|i| {
                    letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)
                }))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by confidence, highest first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        if kept.iter().all(|k| iou(k, &cand) <= iou_threshold) {
            kept.push(cand);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let h = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
