#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::{FaceBackend, FeatureVector};
use crate::detect::result::FaceBox;

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const DEFAULT_DETECTOR_INPUT: (u32, u32) = (320, 240);
const DEFAULT_ENCODER_INPUT: u32 = 112;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.7;
const NMS_IOU_THRESHOLD: f32 = 0.3;

/// ONNX backend: a single-shot face detector plus a face encoder.
///
/// The detector must output `scores` shaped `[1, N, 2]` (background, face)
/// and `boxes` shaped `[1, N, 4]` with normalized corner coordinates. The
/// encoder takes a square RGB crop and outputs one embedding row.
pub struct TractBackend {
    detector: OnnxPlan,
    encoder: OnnxPlan,
    detector_input: (u32, u32),
    encoder_input: u32,
    score_threshold: f32,
}

impl TractBackend {
    /// Load both models from disk. Missing or invalid models are startup errors.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(detector_path: P, encoder_path: Q) -> Result<Self> {
        let (dw, dh) = DEFAULT_DETECTOR_INPUT;
        let detector = load_plan(detector_path.as_ref(), dw, dh)?;
        let encoder = load_plan(
            encoder_path.as_ref(),
            DEFAULT_ENCODER_INPUT,
            DEFAULT_ENCODER_INPUT,
        )?;
        Ok(Self {
            detector,
            encoder,
            detector_input: DEFAULT_DETECTOR_INPUT,
            encoder_input: DEFAULT_ENCODER_INPUT,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        })
    }

    /// Override the default face score threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn parse_detections(
        &self,
        outputs: TVec<TValue>,
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceBox>> {
        let scores: Vec<f32> = outputs
            .first()
            .ok_or_else(|| anyhow!("detector produced no score output"))?
            .as_slice::<f32>()
            .context("detector scores were not f32")?
            .to_vec();
        let boxes: Vec<f32> = outputs
            .get(1)
            .ok_or_else(|| anyhow!("detector produced no box output"))?
            .as_slice::<f32>()
            .context("detector boxes were not f32")?
            .to_vec();
        if scores.len() % 2 != 0 || boxes.len() != scores.len() * 2 {
            return Err(anyhow!(
                "detector output shapes disagree: {} scores, {} box values",
                scores.len(),
                boxes.len()
            ));
        }

        let mut candidates: Vec<(f32, [f32; 4])> = scores
            .chunks_exact(2)
            .zip(boxes.chunks_exact(4))
            .filter(|(score, _)| score[1] >= self.score_threshold)
            .map(|(score, b)| (score[1], [b[0], b[1], b[2], b[3]]))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut kept: Vec<[f32; 4]> = Vec::new();
        for (_, candidate) in candidates {
            if kept.iter().all(|k| iou(k, &candidate) < NMS_IOU_THRESHOLD) {
                kept.push(candidate);
            }
        }

        let w = width as f32;
        let h = height as f32;
        Ok(kept
            .into_iter()
            .filter_map(|[x1, y1, x2, y2]| {
                let left = (x1.clamp(0.0, 1.0) * w) as u32;
                let top = (y1.clamp(0.0, 1.0) * h) as u32;
                let right = (x2.clamp(0.0, 1.0) * w) as u32;
                let bottom = (y2.clamp(0.0, 1.0) * h) as u32;
                FaceBox::new(top, right, bottom, left).clamp_to(width, height)
            })
            .collect())
    }
}

impl FaceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn locate(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>> {
        let (iw, ih) = self.detector_input;
        let resized = imageops::resize(frame, iw, ih, imageops::FilterType::Triangle);
        let input = to_tensor(&resized, |p| (p - 127.0) / 128.0);
        let outputs = self
            .detector
            .run(tvec!(input.into()))
            .context("face detector inference failed")?;
        self.parse_detections(outputs, frame.width(), frame.height())
    }

    fn encode(&mut self, frame: &RgbImage, faces: &[FaceBox]) -> Result<Vec<FeatureVector>> {
        let size = self.encoder_input;
        faces
            .iter()
            .map(|face| {
                let crop =
                    imageops::crop_imm(frame, face.left, face.top, face.width(), face.height())
                        .to_image();
                let resized = imageops::resize(&crop, size, size, imageops::FilterType::Triangle);
                let input = to_tensor(&resized, |p| (p - 127.5) / 128.0);
                let outputs = self
                    .encoder
                    .run(tvec!(input.into()))
                    .context("face encoder inference failed")?;
                let embedding = outputs
                    .first()
                    .ok_or_else(|| anyhow!("encoder produced no outputs"))?
                    .as_slice::<f32>()
                    .context("encoder output was not f32")?
                    .to_vec();
                Ok(l2_normalize(embedding))
            })
            .collect()
    }
}

fn load_plan(path: &Path, width: u32, height: u32) -> Result<OnnxPlan> {
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load ONNX model from {}", path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

fn to_tensor(frame: &RgbImage, normalize: impl Fn(f32) -> f32) -> Tensor {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let raw = frame.as_raw();
    tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, channel, y, x)| {
        normalize(raw[(y * width + x) * 3 + channel] as f32)
    })
    .into_tensor()
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}
