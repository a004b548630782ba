//! Per-frame face matching.
//!
//! `FaceMatcher` owns the preprocessing chain, the face backend, the gallery
//! and the two pieces of per-stream state: identity streaks and the
//! unknown-face rate limiter. It is driven one frame at a time by the
//! receive worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use image::{DynamicImage, RgbImage};

use crate::detect::backend::FaceBackend;
use crate::detect::result::{DetectionResult, Label};
use crate::gallery::Gallery;
use crate::ingest::preprocess::to_luminance;
use crate::ingest::Preprocessor;
use crate::storage::{unknown_face_filename, UnknownFaceSink};

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
pub const DEFAULT_UNKNOWN_CAP: usize = 10;
pub const DEFAULT_UNKNOWN_WINDOW: Duration = Duration::from_secs(60);

/// Euclidean distance. Vectors of different length are infinitely far apart.
pub fn face_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Nearest gallery identity for `embedding`.
///
/// Returns the nearest identity's index and distance, or `None` for an empty
/// gallery or when no distance is comparable. Ties go to the lower index.
pub fn nearest(gallery: &Gallery, embedding: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, identity) in gallery.identities().iter().enumerate() {
        let distance = face_distance(&identity.feature_vector, embedding);
        let better = match best {
            None => !distance.is_nan(),
            Some((_, current)) => distance < current,
        };
        if better {
            best = Some((idx, distance));
        }
    }
    best
}

/// Label `embedding` against the gallery: the nearest identity wins if it lies
/// within `threshold`.
pub fn best_match(gallery: &Gallery, embedding: &[f32], threshold: f32) -> (Label, Option<f32>) {
    match nearest(gallery, embedding) {
        Some((idx, distance)) if distance <= threshold => {
            let name = gallery.identities()[idx].name.clone();
            (Label::Known(name), Some(distance))
        }
        Some((_, distance)) if distance.is_finite() => (Label::Unknown, Some(distance)),
        _ => (Label::Unknown, None),
    }
}

/// Sliding-window limiter for unknown-face saves.
#[derive(Debug)]
pub struct UnknownFaceWindow {
    cap: usize,
    window: Duration,
    saves: VecDeque<Instant>,
}

impl Default for UnknownFaceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_UNKNOWN_CAP, DEFAULT_UNKNOWN_WINDOW)
    }
}

impl UnknownFaceWindow {
    pub fn new(cap: usize, window: Duration) -> Self {
        Self {
            cap,
            window,
            saves: VecDeque::with_capacity(cap),
        }
    }

    /// Prune entries older than the window, then record `now` if below cap.
    /// Returns whether the save is admitted.
    pub fn try_record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.saves.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.saves.pop_front();
            } else {
                break;
            }
        }
        if self.saves.len() >= self.cap {
            return false;
        }
        self.saves.push_back(now);
        true
    }

    pub fn len(&self) -> usize {
        self.saves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saves.is_empty()
    }
}

pub struct FaceMatcher {
    gallery: Gallery,
    backend: Box<dyn FaceBackend>,
    sink: Arc<dyn UnknownFaceSink>,
    preprocessor: Preprocessor,
    threshold: f32,
    save_unknown: bool,
    unknown_window: UnknownFaceWindow,
    streaks: HashMap<String, u32>,
}

impl FaceMatcher {
    pub fn new(
        gallery: Gallery,
        backend: Box<dyn FaceBackend>,
        sink: Arc<dyn UnknownFaceSink>,
    ) -> Self {
        Self {
            gallery,
            backend,
            sink,
            preprocessor: Preprocessor::default(),
            threshold: DEFAULT_MATCH_THRESHOLD,
            save_unknown: true,
            unknown_window: UnknownFaceWindow::default(),
            streaks: HashMap::new(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_unknown_limit(mut self, cap: usize, window: Duration) -> Self {
        self.unknown_window = UnknownFaceWindow::new(cap, window);
        self
    }

    pub fn save_unknown(mut self, enabled: bool) -> Self {
        self.save_unknown = enabled;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Consecutive-frame hit count for `name`; zero when never seen.
    pub fn streak(&self, name: &str) -> u32 {
        self.streaks.get(name).copied().unwrap_or(0)
    }

    pub fn unknown_saves_in_window(&self) -> usize {
        self.unknown_window.len()
    }

    pub fn process(&mut self, frame: &RgbImage) -> Vec<DetectionResult> {
        self.process_at(frame, Instant::now(), SystemTime::now())
    }

    /// Process one frame with explicit clocks. `now` drives the unknown-face
    /// window; `wall` names saved files.
    pub fn process_at(
        &mut self,
        frame: &RgbImage,
        now: Instant,
        wall: SystemTime,
    ) -> Vec<DetectionResult> {
        let processed = self.preprocessor.process_rgb(frame);

        let boxes = match self.backend.locate(&processed) {
            Ok(boxes) => boxes,
            Err(e) => {
                log::warn!("face location failed ({}): {:#}", self.backend.name(), e);
                return Vec::new();
            }
        };
        if boxes.is_empty() {
            self.update_streaks(&HashSet::new());
            return Vec::new();
        }
        let encodings = match self.backend.encode(&processed, &boxes) {
            Ok(encodings) => encodings,
            Err(e) => {
                log::warn!("face encoding failed ({}): {:#}", self.backend.name(), e);
                return Vec::new();
            }
        };
        if encodings.len() != boxes.len() {
            log::warn!(
                "backend {} returned {} encodings for {} faces",
                self.backend.name(),
                encodings.len(),
                boxes.len()
            );
        }

        let mut results = Vec::with_capacity(boxes.len());
        let mut seen = HashSet::new();
        for (bounding_box, encoding) in boxes.into_iter().zip(encodings) {
            let (label, distance) = best_match(&self.gallery, &encoding, self.threshold);
            match &label {
                Label::Known(name) => {
                    seen.insert(name.clone());
                }
                Label::Unknown => self.handle_unknown(frame, now, wall),
            }
            log::debug!("face at {:?}: {} ({:?})", bounding_box, label, distance);
            results.push(DetectionResult {
                bounding_box,
                label,
                distance,
            });
        }

        self.update_streaks(&seen);
        results
    }

    /// Persist the plain grayscale frame, not the preprocessed one.
    fn handle_unknown(&mut self, frame: &RgbImage, now: Instant, wall: SystemTime) {
        if !self.save_unknown {
            return;
        }
        if !self.unknown_window.try_record(now) {
            log::info!(
                "unknown face not saved: limit of {} per {:?} reached",
                self.unknown_window.cap,
                self.unknown_window.window
            );
            return;
        }
        let filename = unknown_face_filename(wall);
        let gray = to_luminance(&DynamicImage::ImageRgb8(frame.clone()));
        match self.sink.save(&gray, &filename) {
            Ok(()) => log::info!("saved unknown face {}", filename),
            Err(e) => log::error!("failed to save unknown face {}: {:#}", filename, e),
        }
    }

    fn update_streaks(&mut self, seen: &HashSet<String>) {
        for (name, count) in self.streaks.iter_mut() {
            if !seen.contains(name) {
                *count = 0;
            }
        }
        for name in seen {
            let count = self.streaks.entry(name.clone()).or_insert(0);
            *count += 1;
            log::debug!("{} seen in {} consecutive frames", name, count);
        }
    }
}
