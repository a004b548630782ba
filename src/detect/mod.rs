mod backend;
pub mod backends;
pub mod matcher;
mod result;

pub use backend::{FaceBackend, FeatureVector};
pub use backends::{StubBackend, StubFace};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use matcher::{FaceMatcher, UnknownFaceWindow};
pub use result::{DetectionResult, FaceBox, Label, UNKNOWN_LABEL};
