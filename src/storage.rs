//! Unknown-face persistence.
//!
//! The matcher hands every admitted unknown face to an `UnknownFaceSink`
//! together with a generated filename. Sink failures are reported to the
//! caller, which logs them and keeps processing frames.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use image::{GrayImage, ImageFormat};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Filename prefix for persisted unknown faces. Gallery loading skips files
/// carrying it.
pub const UNKNOWN_FILE_PREFIX: &str = "Unknown_";

pub trait UnknownFaceSink: Send + Sync {
    fn save(&self, frame: &GrayImage, filename: &str) -> Result<()>;
}

/// Writes JPEG files into the faces directory.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create faces directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl UnknownFaceSink for DirectorySink {
    fn save(&self, frame: &GrayImage, filename: &str) -> Result<()> {
        if filename.contains(std::path::is_separator) || filename.contains("..") {
            return Err(anyhow!("refusing unsafe unknown-face filename '{}'", filename));
        }
        let path = self.dir.join(filename);
        frame
            .save_with_format(&path, ImageFormat::Jpeg)
            .with_context(|| format!("write unknown face {}", path.display()))?;
        Ok(())
    }
}

/// Keeps saved filenames in memory. Cloning shares the same record.
#[derive(Clone, Default)]
pub struct InMemorySink {
    saved: Arc<Mutex<Vec<String>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.saved.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UnknownFaceSink for InMemorySink {
    fn save(&self, _frame: &GrayImage, filename: &str) -> Result<()> {
        self.saved
            .lock()
            .map_err(|_| anyhow!("in-memory sink lock poisoned"))?
            .push(filename.to_string());
        Ok(())
    }
}

/// `Unknown_YYYYmmdd_HHMMSS_mmm.jpg` in local time.
pub fn unknown_face_filename(at: SystemTime) -> String {
    format_unknown_face_filename(&DateTime::<Local>::from(at))
}

fn format_unknown_face_filename<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{}{}.jpg", UNKNOWN_FILE_PREFIX, at.format("%Y%m%d_%H%M%S_%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn filenames_carry_millisecond_timestamp() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            format_unknown_face_filename(&at),
            "Unknown_20231114_221320_123.jpg"
        );
        let epoch = Utc.timestamp_millis_opt(0).unwrap();
        assert_eq!(
            format_unknown_face_filename(&epoch),
            "Unknown_19700101_000000_000.jpg"
        );
    }

    #[test]
    fn filenames_follow_the_given_offset() {
        // 2024-02-29T12:00:00Z seen from UTC+2.
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let at = offset.timestamp_opt(1_709_208_000, 0).unwrap();
        assert_eq!(
            format_unknown_face_filename(&at),
            "Unknown_20240229_140000_000.jpg"
        );
    }

    #[test]
    fn local_filenames_have_the_expected_shape() {
        let name = unknown_face_filename(SystemTime::now());
        assert!(name.starts_with(UNKNOWN_FILE_PREFIX));
        assert!(name.ends_with(".jpg"));
        // Unknown_ + YYYYmmdd_HHMMSS_mmm + .jpg
        assert_eq!(name.len(), UNKNOWN_FILE_PREFIX.len() + 19 + 4);
    }

    #[test]
    fn directory_sink_writes_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DirectorySink::new(dir.path().join("faces"))?;
        let frame = GrayImage::from_pixel(16, 16, image::Luma([128]));

        sink.save(&frame, "Unknown_test.jpg")?;
        let written = sink.dir().join("Unknown_test.jpg");
        assert!(written.exists());
        assert_eq!(image::open(&written)?.width(), 16);

        assert!(sink.save(&frame, "../escape.jpg").is_err());
        Ok(())
    }

    #[test]
    fn in_memory_sink_shares_record_across_clones() -> Result<()> {
        let sink = InMemorySink::new();
        let handle = sink.clone();
        sink.save(&GrayImage::new(1, 1), "Unknown_a.jpg")?;
        assert_eq!(handle.saved(), vec!["Unknown_a.jpg".to_string()]);
        Ok(())
    }
}
