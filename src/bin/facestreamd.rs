//! facestreamd - ESP32-CAM face stream daemon
//!
//! This daemon:
//! 1. Loads configuration from file and environment
//! 2. Builds the face gallery from the faces directory (or a precomputed file)
//! 3. Connects to the camera and starts the stream
//! 4. Matches faces per frame and persists rate-limited unknown faces
//! 5. Logs stream status until Ctrl-C, then shuts down cleanly

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use facestream::config::BackendKind;
use facestream::ingest::Preprocessor;
use facestream::transport::Resolution;
use facestream::{
    ConnectionState, CoordinatorSettings, DirectorySink, FaceBackend, FaceMatcher, Gallery,
    StreamConfig, StreamCoordinator, StubBackend, WsConnector,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream an ESP32-CAM and match faces against a gallery")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FACESTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "FACESTREAM_LOG", default_value = "info")]
    log_level: String,

    /// Seconds between status lines.
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,

    /// Send SET_FPS and SET_RESOLUTION from the config once connected.
    #[arg(long)]
    apply_device_settings: bool,

    /// Do not start the stream; only wait for Ctrl-C.
    #[arg(long)]
    no_start: bool,

    /// TCP connect timeout for the camera link.
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,

    /// JPEG quality (0-63, lower is better) to request once connected.
    #[arg(long)]
    jpeg_quality: Option<u8>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = StreamConfig::load_from(args.config.as_deref())?;
    log::info!("facestreamd {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("camera endpoint: {}", config.ws_url);

    let mut backend = build_backend(&config)?;
    backend.warm_up()?;
    log::info!("face backend: {}", backend.name());

    let gallery = match &config.gallery_path {
        Some(path) => Gallery::load_json(path)?,
        None => Gallery::load_dir(&config.faces_dir, backend.as_mut())?,
    };
    if gallery.is_empty() {
        log::warn!("gallery is empty; every face will be labelled Unknown");
    }

    let sink = DirectorySink::new(&config.faces_dir)?;
    let matcher = FaceMatcher::new(gallery, backend, Arc::new(sink))
        .with_threshold(config.matcher.threshold)
        .with_preprocessor(Preprocessor::new(config.matcher.gamma)?)
        .with_unknown_limit(config.matcher.unknown_cap, config.matcher.unknown_window)
        .save_unknown(config.matcher.save_unknown);

    let coordinator = StreamCoordinator::new(
        CoordinatorSettings::from(&config),
        matcher,
        Arc::new(
            WsConnector::new()
                .with_connect_timeout(Duration::from_secs(args.connect_timeout_secs.max(1))),
        ),
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    if args.no_start {
        log::info!("--no-start given; waiting for Ctrl-C");
    } else {
        coordinator.start();
    }

    let status_interval = Duration::from_secs(args.status_interval_secs.max(1));
    let mut settings_applied = !args.apply_device_settings && args.jpeg_quality.is_none();
    loop {
        match rx.recv_timeout(status_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        if !settings_applied && coordinator.connection_state() == ConnectionState::Connected {
            settings_applied = apply_device_settings(
                &coordinator,
                args.apply_device_settings
                    .then_some((config.device.fps, config.device.resolution)),
                args.jpeg_quality,
            );
        }
        log_status(&coordinator);
    }

    log::info!("shutdown signal received, stopping stream...");
    coordinator.shutdown();
    Ok(())
}

fn build_backend(config: &StreamConfig) -> Result<Box<dyn FaceBackend>> {
    match config.backend.kind {
        BackendKind::Stub => {
            log::warn!("using stub face backend; no faces will be detected");
            Ok(Box::new(StubBackend::new()))
        }
        BackendKind::Tract => build_tract_backend(config),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract_backend(config: &StreamConfig) -> Result<Box<dyn FaceBackend>> {
    let detector = config
        .backend
        .detector_model
        .as_ref()
        .ok_or_else(|| anyhow!("DETECTOR_MODEL_PATH is required for the tract backend"))?;
    let encoder = config
        .backend
        .encoder_model
        .as_ref()
        .ok_or_else(|| anyhow!("ENCODER_MODEL_PATH is required for the tract backend"))?;
    Ok(Box::new(facestream::detect::TractBackend::new(
        detector, encoder,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract_backend(_config: &StreamConfig) -> Result<Box<dyn FaceBackend>> {
    Err(anyhow!(
        "tract backend requested but facestreamd was built without the backend-tract feature"
    ))
}

fn apply_device_settings(
    coordinator: &StreamCoordinator,
    fps_and_resolution: Option<(u32, Resolution)>,
    jpeg_quality: Option<u8>,
) -> bool {
    if let Some((fps, resolution)) = fps_and_resolution {
        if !(coordinator.set_fps(fps) && coordinator.set_resolution(resolution)) {
            return false;
        }
    }
    match jpeg_quality {
        Some(quality) => coordinator.set_jpeg_quality(quality),
        None => true,
    }
}

fn log_status(coordinator: &StreamCoordinator) {
    let names = coordinator
        .latest_frame()
        .map(|frame| {
            frame
                .known_names()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    log::info!(
        "status: connection={} running={} fps={:.2} frames={} resolution={} known={:?}",
        coordinator.connection_state(),
        coordinator.is_running(),
        coordinator.fps(),
        coordinator.frames_published(),
        coordinator.resolution(),
        names
    );
}
