use anyhow::Result;
use image::RgbImage;

use crate::detect::result::FaceBox;

/// Fixed-length numeric encoding of one face.
pub type FeatureVector = Vec<f32>;

/// Face detection and encoding backend.
///
/// The matcher calls `locate` and then `encode` on the same preprocessed
/// frame, once per frame, from the receive worker. Backends may keep
/// internal buffers between calls but must not retain the frame itself.
pub trait FaceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Find candidate face regions in a frame.
    fn locate(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>>;

    /// Compute one feature vector per face, in the order of `faces`.
    fn encode(&mut self, frame: &RgbImage, faces: &[FaceBox]) -> Result<Vec<FeatureVector>>;

    /// Optional warm-up hook, run once before streaming starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
