use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{FaceBackend, FeatureVector};
use crate::detect::result::FaceBox;

/// A face the stub backend reports for one frame.
#[derive(Clone, Debug)]
pub struct StubFace {
    pub bounding_box: FaceBox,
    pub encoding: FeatureVector,
}

impl StubFace {
    pub fn new(bounding_box: FaceBox, encoding: FeatureVector) -> Self {
        Self {
            bounding_box,
            encoding,
        }
    }
}

/// Scripted backend for tests and model-less runs.
///
/// Each `locate` call consumes the next scripted frame; once the script runs
/// out every frame reports no faces.
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<Vec<StubFace>>,
    current: Vec<StubFace>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(frames: Vec<Vec<StubFace>>) -> Self {
        Self {
            script: frames.into(),
            current: Vec::new(),
        }
    }

    /// Frames left in the script.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl FaceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn locate(&mut self, _frame: &RgbImage) -> Result<Vec<FaceBox>> {
        self.current = self.script.pop_front().unwrap_or_default();
        Ok(self.current.iter().map(|face| face.bounding_box).collect())
    }

    fn encode(&mut self, _frame: &RgbImage, faces: &[FaceBox]) -> Result<Vec<FeatureVector>> {
        faces
            .iter()
            .map(|bbox| {
                self.current
                    .iter()
                    .find(|face| face.bounding_box == *bbox)
                    .map(|face| face.encoding.clone())
                    .ok_or_else(|| anyhow!("stub backend has no encoding for {:?}", bbox))
            })
            .collect()
    }
}
