//! Text protocol spoken with the camera firmware.
//!
//! Commands go out as text frames (`start_stream`, `SET_FPS:5`, ...).
//! Notifications come back as text frames; JPEG frames arrive as binary
//! messages and are not modelled here.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

pub const FRAME_CAPTURE_FAILED: &str = "error:frame_capture_failed";
pub const MAX_JPEG_QUALITY: u8 = 63;

/// Frame sizes the firmware accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Resolution {
    #[default]
    Qqvga,
    Qcif,
    Hqvga,
    R240x240,
    Qvga,
}

impl Resolution {
    pub const ALL: [Resolution; 5] = [
        Resolution::Qqvga,
        Resolution::Qcif,
        Resolution::Hqvga,
        Resolution::R240x240,
        Resolution::Qvga,
    ];

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::Qqvga => (160, 120),
            Resolution::Qcif => (176, 144),
            Resolution::Hqvga => (240, 176),
            Resolution::R240x240 => (240, 240),
            Resolution::Qvga => (320, 240),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{}x{}", w, h)
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Resolution::ALL
            .into_iter()
            .find(|r| r.to_string() == trimmed)
            .ok_or_else(|| {
                anyhow!(
                    "unsupported resolution '{}' (expected one of 160x120, 176x144, 240x176, 240x240, 320x240)",
                    trimmed
                )
            })
    }
}

/// Outbound device command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    StartStream,
    StopStream,
    SetFps(u32),
    SetResolution(Resolution),
    SetJpegQuality(u8),
}

impl Command {
    /// Quality above the firmware's range is clamped.
    pub fn jpeg_quality(quality: u8) -> Self {
        Command::SetJpegQuality(quality.min(MAX_JPEG_QUALITY))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StartStream => f.write_str("start_stream"),
            Command::StopStream => f.write_str("stop_stream"),
            Command::SetFps(fps) => write!(f, "SET_FPS:{}", fps),
            Command::SetResolution(res) => write!(f, "SET_RESOLUTION:{}", res),
            Command::SetJpegQuality(q) => write!(f, "SET_JPEG_QUALITY:{}", q),
        }
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "start_stream" => return Ok(Command::StartStream),
            "stop_stream" => return Ok(Command::StopStream),
            _ => {}
        }
        let (key, value) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("unknown command '{}'", s))?;
        match key {
            "SET_FPS" => value
                .parse()
                .map(Command::SetFps)
                .map_err(|_| anyhow!("invalid fps '{}'", value)),
            "SET_RESOLUTION" => value.parse().map(Command::SetResolution),
            "SET_JPEG_QUALITY" => {
                let quality: u8 = value
                    .parse()
                    .map_err(|_| anyhow!("invalid jpeg quality '{}'", value))?;
                if quality > MAX_JPEG_QUALITY {
                    return Err(anyhow!("jpeg quality {} exceeds {}", quality, MAX_JPEG_QUALITY));
                }
                Ok(Command::SetJpegQuality(quality))
            }
            _ => Err(anyhow!("unknown command '{}'", s)),
        }
    }
}

/// Inbound text message from the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Free-form device log line (`from_esp32:...`).
    Device(String),
    CurrentFps(u32),
    CurrentResolution(Resolution),
    FrameCaptureFailed,
    Unrecognized(String),
}

impl Notification {
    /// Never fails; malformed messages come back as `Unrecognized`.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text == FRAME_CAPTURE_FAILED {
            return Notification::FrameCaptureFailed;
        }
        if let Some(rest) = text.strip_prefix("from_esp32:") {
            return Notification::Device(rest.trim().to_string());
        }
        if let Some(rest) = text.strip_prefix("current_fps:") {
            if let Ok(fps) = rest.trim().parse() {
                return Notification::CurrentFps(fps);
            }
        }
        if let Some(rest) = text.strip_prefix("current_resolution:") {
            if let Ok(res) = rest.parse() {
                return Notification::CurrentResolution(res);
            }
        }
        Notification::Unrecognized(text.to_string())
    }
}
