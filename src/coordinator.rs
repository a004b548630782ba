//! Stream orchestration.
//!
//! `StreamCoordinator` owns every piece of per-stream state. The receive
//! worker drives it through `StreamHandler`: binary frames are decoded,
//! matched, annotated and published; text notifications update the device
//! settings. Consumers read the latest frame and FPS and issue commands
//! through the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Error;

use crate::config::StreamConfig;
use crate::detect::FaceMatcher;
use crate::frame::{annotate, LatestFrame, SharedFrame};
use crate::ingest;
use crate::transport::{
    ClientCell, Command, ConnectionClient, ConnectionHandler, ConnectionState, Connector,
    Notification, ReconnectSupervisor, Resolution,
};

pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(5);
const FPS_WINDOW: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// FpsCounter / ResendDebounce
// ----------------------------------------------------------------------------

/// Rolling frames-per-second over windows of at least one second.
#[derive(Debug)]
pub struct FpsCounter {
    frames: u32,
    window_start: Instant,
    fps: f64,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            fps: 0.0,
        }
    }

    /// Count one frame. Returns the new rate when a window closes.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < FPS_WINDOW {
            return None;
        }
        self.fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = now;
        Some(self.fps)
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

/// Spaces out resolution resends. The first request always passes.
#[derive(Debug)]
pub struct ResendDebounce {
    interval: Duration,
    last: Option<Instant>,
}

impl ResendDebounce {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_resend(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

/// Settings last requested from, or reported by, the device.
#[derive(Debug)]
struct DeviceState {
    fps: u32,
    resolution: Resolution,
    resend: ResendDebounce,
}

struct StreamState {
    frame: SharedFrame,
    fps: Mutex<FpsCounter>,
    matcher: Mutex<FaceMatcher>,
    device: Mutex<DeviceState>,
    start_on_open: AtomicBool,
    running: AtomicBool,
}

impl StreamState {
    fn handle_frame(&self, bytes: &[u8]) {
        let captured_at = SystemTime::now();
        let mut image = match ingest::decode(bytes) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("dropping undecodable frame: {:#}", e);
                return;
            }
        };
        let detections = lock(&self.matcher).process(&image);
        annotate(&mut image, &detections);
        let sequence = self.frame.publish(image, detections, captured_at);
        if let Some(fps) = lock(&self.fps).tick(Instant::now()) {
            log::debug!("frame {}: {:.2} fps", sequence, fps);
        }
    }

    fn handle_notification(&self, client: &ConnectionClient, text: &str) {
        match Notification::parse(text) {
            Notification::Device(message) => log::info!("device: {}", message),
            Notification::CurrentFps(fps) => {
                lock(&self.device).fps = fps;
                log::info!("device reports fps {}", fps);
            }
            Notification::CurrentResolution(resolution) => {
                lock(&self.device).resolution = resolution;
                log::info!("device reports resolution {}", resolution);
            }
            Notification::FrameCaptureFailed => {
                log::warn!("device failed to capture a frame");
                let resend = {
                    let mut device = lock(&self.device);
                    let resolution = device.resolution;
                    device
                        .resend
                        .should_resend(Instant::now())
                        .then_some(resolution)
                };
                match resend {
                    Some(resolution) => {
                        log::info!("resending resolution {}", resolution);
                        client.send(&Command::SetResolution(resolution).to_string());
                    }
                    None => log::info!("skipping resolution resend; last one was too recent"),
                }
            }
            Notification::Unrecognized(text) => log::warn!("unrecognized message: {}", text),
        }
    }
}

/// Connection callbacks for the coordinator's client.
struct StreamHandler {
    state: Arc<StreamState>,
}

impl ConnectionHandler for StreamHandler {
    fn on_open(&self, client: &ConnectionClient) {
        log::info!("stream connection open");
        if self.state.start_on_open.swap(false, Ordering::SeqCst) {
            log::info!("sending deferred start_stream");
            client.send(&Command::StartStream.to_string());
        }
    }

    fn on_binary(&self, _client: &ConnectionClient, data: Vec<u8>) {
        self.state.handle_frame(&data);
    }

    fn on_text(&self, client: &ConnectionClient, text: &str) {
        self.state.handle_notification(client, text);
    }

    fn on_error(&self, _client: &ConnectionClient, error: &Error) {
        log::error!("stream connection error: {:#}", error);
    }

    fn on_close(&self, _client: &ConnectionClient, code: Option<u16>, reason: &str) {
        log::warn!("stream connection closed (code {:?}): {}", code, reason);
    }
}

// ----------------------------------------------------------------------------
// StreamCoordinator
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    pub url: String,
    pub reconnect_interval: Duration,
    pub resend_interval: Duration,
    pub fps: u32,
    pub resolution: Resolution,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080".to_string(),
            reconnect_interval: crate::transport::supervisor::DEFAULT_RECONNECT_INTERVAL,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            fps: 1,
            resolution: Resolution::default(),
        }
    }
}

impl From<&StreamConfig> for CoordinatorSettings {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            url: cfg.ws_url.clone(),
            reconnect_interval: cfg.reconnect_interval,
            resend_interval: cfg.device.resend_interval,
            fps: cfg.device.fps,
            resolution: cfg.device.resolution,
        }
    }
}

pub struct StreamCoordinator {
    settings: CoordinatorSettings,
    state: Arc<StreamState>,
    connector: Arc<dyn Connector>,
    client: ClientCell,
    supervisor: Mutex<Option<ReconnectSupervisor>>,
}

impl StreamCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        matcher: FaceMatcher,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let state = Arc::new(StreamState {
            frame: SharedFrame::new(),
            fps: Mutex::new(FpsCounter::new(Instant::now())),
            matcher: Mutex::new(matcher),
            device: Mutex::new(DeviceState {
                fps: settings.fps,
                resolution: settings.resolution,
                resend: ResendDebounce::new(settings.resend_interval),
            }),
            start_on_open: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });
        Self {
            settings,
            state,
            connector,
            client: ClientCell::new(),
            supervisor: Mutex::new(None),
        }
    }

    fn client(&self) -> ConnectionClient {
        if let Some(client) = self.client.get() {
            return client.clone();
        }
        let handler = Arc::new(StreamHandler {
            state: self.state.clone(),
        });
        self.client
            .get_or_init(&self.settings.url, self.connector.clone(), handler)
    }

    /// Begin streaming. Connects first when needed; `start_stream` then goes
    /// out as soon as the link opens.
    pub fn start(&self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            log::info!("stream already running");
            return;
        }
        log::info!("starting stream");
        let client = self.client();
        // Arm before checking the state: whichever of this thread and
        // `on_open` clears the flag sends `start_stream`, exactly once.
        self.state.start_on_open.store(true, Ordering::SeqCst);
        if client.is_connected() {
            if self.state.start_on_open.swap(false, Ordering::SeqCst) {
                client.send(&Command::StartStream.to_string());
            }
        } else {
            client.connect();
            self.ensure_supervisor(&client);
        }
    }

    /// Ask the device to stop streaming. The connection stays open.
    pub fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            log::info!("stream already stopped");
            return;
        }
        log::info!("stopping stream");
        self.state.start_on_open.store(false, Ordering::SeqCst);
        self.send_command(Command::StopStream);
    }

    /// Stop streaming, the supervisor and the connection.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(mut supervisor) = lock(&self.supervisor).take() {
            supervisor.stop();
        }
        if let Some(client) = self.client.get() {
            client.close();
        }
        log::info!("stream coordinator shut down");
    }

    fn ensure_supervisor(&self, client: &ConnectionClient) {
        let mut supervisor = lock(&self.supervisor);
        if supervisor.as_ref().map(|s| s.is_running()).unwrap_or(false) {
            return;
        }
        let started = ReconnectSupervisor::start(client.clone(), self.settings.reconnect_interval);
        log::info!("reconnect supervisor running every {:?}", started.interval());
        *supervisor = Some(started);
    }

    /// Fire-and-forget; returns whether the command was written.
    pub fn send_command(&self, command: Command) -> bool {
        self.client().send(&command.to_string())
    }

    pub fn set_fps(&self, fps: u32) -> bool {
        lock(&self.state.device).fps = fps;
        log::info!("fps set to {}", fps);
        self.send_command(Command::SetFps(fps))
    }

    pub fn set_resolution(&self, resolution: Resolution) -> bool {
        lock(&self.state.device).resolution = resolution;
        log::info!("resolution set to {}", resolution);
        self.send_command(Command::SetResolution(resolution))
    }

    pub fn set_jpeg_quality(&self, quality: u8) -> bool {
        self.send_command(Command::jpeg_quality(quality))
    }

    pub fn latest_frame(&self) -> Option<LatestFrame> {
        self.state.frame.latest()
    }

    pub fn frames_published(&self) -> u64 {
        self.state.frame.published()
    }

    pub fn fps(&self) -> f64 {
        lock(&self.state.fps).fps()
    }

    pub fn device_fps(&self) -> u32 {
        lock(&self.state.device).fps
    }

    pub fn resolution(&self) -> Resolution {
        lock(&self.state.device).resolution
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client
            .get()
            .map(|client| client.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Run `f` against the matcher, e.g. to read streak counters.
    pub fn with_matcher<R>(&self, f: impl FnOnce(&FaceMatcher) -> R) -> R {
        f(&lock(&self.state.matcher))
    }
}
