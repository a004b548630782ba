use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::transport::Resolution;

const DEFAULT_WS_URL: &str = "ws://localhost:8080";
const DEFAULT_FACES_DIR: &str = "./resources/faces";
const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
const DEFAULT_UNKNOWN_CAP: usize = 10;
const DEFAULT_UNKNOWN_WINDOW_SECS: u64 = 60;
const DEFAULT_RECONNECT_SECS: u64 = 5;
const DEFAULT_RESEND_SECS: u64 = 5;
const DEFAULT_FPS: u32 = 1;
const DEFAULT_GAMMA: f32 = 1.5;

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    ws_url: Option<String>,
    faces_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    reconnect_interval_secs: Option<u64>,
    matcher: Option<MatcherConfigFile>,
    device: Option<DeviceConfigFile>,
    backend: Option<BackendConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MatcherConfigFile {
    threshold: Option<f32>,
    save_unknown: Option<bool>,
    unknown_cap: Option<usize>,
    unknown_window_secs: Option<u64>,
    gamma: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    fps: Option<u32>,
    resolution: Option<String>,
    resend_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    kind: Option<String>,
    detector_model: Option<PathBuf>,
    encoder_model: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Stub,
    Tract,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!("unknown face backend '{}' (expected stub or tract)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub faces_dir: PathBuf,
    pub gallery_path: Option<PathBuf>,
    pub reconnect_interval: Duration,
    pub matcher: MatcherSettings,
    pub device: DeviceSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone)]
pub struct MatcherSettings {
    pub threshold: f32,
    pub save_unknown: bool,
    pub unknown_cap: usize,
    pub unknown_window: Duration,
    pub gamma: f32,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub fps: u32,
    pub resolution: Resolution,
    pub resend_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub detector_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            faces_dir: PathBuf::from(DEFAULT_FACES_DIR),
            gallery_path: None,
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            matcher: MatcherSettings {
                threshold: DEFAULT_MATCH_THRESHOLD,
                save_unknown: true,
                unknown_cap: DEFAULT_UNKNOWN_CAP,
                unknown_window: Duration::from_secs(DEFAULT_UNKNOWN_WINDOW_SECS),
                gamma: DEFAULT_GAMMA,
            },
            device: DeviceSettings {
                fps: DEFAULT_FPS,
                resolution: Resolution::default(),
                resend_interval: Duration::from_secs(DEFAULT_RESEND_SECS),
            },
            backend: BackendSettings {
                kind: BackendKind::default(),
                detector_model: None,
                encoder_model: None,
            },
        }
    }
}

impl StreamConfig {
    /// Load from `$FACESTREAM_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = env_nonempty("FACESTREAM_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(url) = file.ws_url {
            cfg.ws_url = url;
        }
        if let Some(dir) = file.faces_dir {
            cfg.faces_dir = dir;
        }
        cfg.gallery_path = file.gallery_path;
        if let Some(secs) = file.reconnect_interval_secs {
            cfg.reconnect_interval = Duration::from_secs(secs);
        }

        let matcher = file.matcher.unwrap_or_default();
        cfg.matcher.threshold = matcher.threshold.unwrap_or(cfg.matcher.threshold);
        cfg.matcher.save_unknown = matcher.save_unknown.unwrap_or(cfg.matcher.save_unknown);
        cfg.matcher.unknown_cap = matcher.unknown_cap.unwrap_or(cfg.matcher.unknown_cap);
        if let Some(secs) = matcher.unknown_window_secs {
            cfg.matcher.unknown_window = Duration::from_secs(secs);
        }
        cfg.matcher.gamma = matcher.gamma.unwrap_or(cfg.matcher.gamma);

        let device = file.device.unwrap_or_default();
        cfg.device.fps = device.fps.unwrap_or(cfg.device.fps);
        if let Some(res) = device.resolution.as_deref() {
            cfg.device.resolution = res.parse()?;
        }
        if let Some(secs) = device.resend_interval_secs {
            cfg.device.resend_interval = Duration::from_secs(secs);
        }

        let backend = file.backend.unwrap_or_default();
        if let Some(kind) = backend.kind.as_deref() {
            cfg.backend.kind = kind.parse()?;
        }
        cfg.backend.detector_model = backend.detector_model;
        cfg.backend.encoder_model = backend.encoder_model;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("WS_URL") {
            self.ws_url = url;
        }
        if let Some(dir) = env_nonempty("FACES_DIR") {
            self.faces_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_nonempty("GALLERY_PATH") {
            self.gallery_path = Some(PathBuf::from(path));
        }
        if let Some(value) = env_nonempty("FACE_MATCH_THRESHOLD") {
            self.matcher.threshold = value
                .parse()
                .map_err(|_| anyhow!("FACE_MATCH_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_nonempty("SAVE_UNKNOWN_FACES") {
            self.matcher.save_unknown = parse_bool(&value)
                .ok_or_else(|| anyhow!("SAVE_UNKNOWN_FACES must be true or false"))?;
        }
        if let Some(value) = env_nonempty("UNKNOWN_FACE_CAP") {
            self.matcher.unknown_cap = value
                .parse()
                .map_err(|_| anyhow!("UNKNOWN_FACE_CAP must be a positive integer"))?;
        }
        if let Some(value) = env_nonempty("UNKNOWN_FACE_WINDOW_SECS") {
            self.matcher.unknown_window = env_secs("UNKNOWN_FACE_WINDOW_SECS", &value)?;
        }
        if let Some(value) = env_nonempty("PREPROCESS_GAMMA") {
            self.matcher.gamma = value
                .parse()
                .map_err(|_| anyhow!("PREPROCESS_GAMMA must be a number"))?;
        }
        if let Some(value) = env_nonempty("RECONNECT_INTERVAL_SECS") {
            self.reconnect_interval = env_secs("RECONNECT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = env_nonempty("RESOLUTION_RESEND_INTERVAL_SECS") {
            self.device.resend_interval = env_secs("RESOLUTION_RESEND_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = env_nonempty("DEFAULT_FPS") {
            self.device.fps = value
                .parse()
                .map_err(|_| anyhow!("DEFAULT_FPS must be a positive integer"))?;
        }
        if let Some(value) = env_nonempty("DEFAULT_RESOLUTION") {
            self.device.resolution = value.parse()?;
        }
        if let Some(value) = env_nonempty("FACE_BACKEND") {
            self.backend.kind = value.parse()?;
        }
        if let Some(path) = env_nonempty("DETECTOR_MODEL_PATH") {
            self.backend.detector_model = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("ENCODER_MODEL_PATH") {
            self.backend.encoder_model = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| anyhow!("invalid ws_url '{}': {}", self.ws_url, e))?;
        if url.scheme() != "ws" {
            return Err(anyhow!(
                "ws_url must use the ws:// scheme (got '{}')",
                url.scheme()
            ));
        }
        if url.host_str().is_none() {
            return Err(anyhow!("ws_url '{}' has no host", self.ws_url));
        }
        if !self.matcher.threshold.is_finite() || self.matcher.threshold < 0.0 {
            return Err(anyhow!("match threshold must be a finite number >= 0"));
        }
        if !self.matcher.gamma.is_finite() || self.matcher.gamma <= 0.0 {
            return Err(anyhow!("gamma must be greater than zero"));
        }
        if self.matcher.unknown_cap == 0 {
            return Err(anyhow!("unknown face cap must be at least 1"));
        }
        for (name, interval) in [
            ("unknown face window", self.matcher.unknown_window),
            ("reconnect interval", self.reconnect_interval),
            ("resolution resend interval", self.device.resend_interval),
        ] {
            if interval.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.device.fps == 0 {
            return Err(anyhow!("default fps must be greater than zero"));
        }
        if self.backend.kind == BackendKind::Tract
            && (self.backend.detector_model.is_none() || self.backend.encoder_model.is_none())
        {
            return Err(anyhow!(
                "tract backend requires DETECTOR_MODEL_PATH and ENCODER_MODEL_PATH"
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<StreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_secs(key: &str, value: &str) -> Result<Duration> {
    let seconds: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be an integer number of seconds", key))?;
    Ok(Duration::from_secs(seconds))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.ws_url, DEFAULT_WS_URL);
        assert_eq!(cfg.device.resolution, Resolution::Qqvga);
        assert_eq!(cfg.backend.kind, BackendKind::Stub);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_bools_loosely() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn rejects_non_ws_scheme() {
        let mut cfg = StreamConfig::default();
        cfg.ws_url = "http://localhost:8080".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tract_requires_models() {
        let mut cfg = StreamConfig::default();
        cfg.backend.kind = BackendKind::Tract;
        assert!(cfg.validate().is_err());
        cfg.backend.detector_model = Some("det.onnx".into());
        cfg.backend.encoder_model = Some("enc.onnx".into());
        assert!(cfg.validate().is_ok());
    }
}
