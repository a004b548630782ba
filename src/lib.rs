//! facestream
//!
//! Client for an ESP32-CAM WebSocket stream that matches faces against a
//! gallery of known identities and republishes annotated frames.
//!
//! # Architecture
//!
//! Three actors share state through the coordinator:
//!
//! 1. **Receive worker**: owned by `ConnectionClient`; decodes frames, runs
//!    the matcher and publishes into the single-slot `SharedFrame`.
//! 2. **Reconnect supervisor**: re-opens the link on a fixed cadence.
//! 3. **Consumer**: reads the latest frame and FPS at its own pace and sends
//!    device commands.
//!
//! # Module Structure
//!
//! - `ingest`: JPEG decoding and the preprocessing chain
//! - `detect`: face backends and the gallery matcher
//! - `gallery`: known identities
//! - `storage`: unknown-face persistence
//! - `transport`: connection lifecycle, reconnect supervision, wire protocol
//! - `frame`: latest-frame buffer and annotation
//! - `coordinator`: ties the above together
//! - `config`: file and environment configuration

pub mod config;
pub mod coordinator;
pub mod detect;
pub mod frame;
pub mod gallery;
pub mod ingest;
pub mod storage;
pub mod transport;

pub use config::{BackendKind, StreamConfig};
pub use coordinator::{CoordinatorSettings, FpsCounter, ResendDebounce, StreamCoordinator};
pub use detect::{
    DetectionResult, FaceBackend, FaceBox, FaceMatcher, Label, StubBackend, StubFace,
    UnknownFaceWindow, UNKNOWN_LABEL,
};
pub use frame::{AnnotatedFrame, LatestFrame, SharedFrame};
pub use gallery::{Gallery, Identity};
pub use storage::{DirectorySink, InMemorySink, UnknownFaceSink};
pub use transport::{
    ClientCell, Command, ConnectionClient, ConnectionHandler, ConnectionState, Connector,
    MemoryConnector, MemoryPeer, Notification, ReconnectSupervisor, Resolution, WsConnector,
};
