//! Frame ingestion helpers.
//!
//! The network worker hands raw JPEG payloads to this layer:
//! - `codec` decodes and rotates them into upright RGB frames
//! - `preprocess` normalizes frames for face detection
//!
//! Both are stateless and safe to call from any thread.

pub mod codec;
pub mod preprocess;

pub use codec::decode;
pub use preprocess::{GammaTable, Preprocessor, DEFAULT_GAMMA};
