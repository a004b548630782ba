use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use facestream::config::{BackendKind, StreamConfig};
use facestream::Resolution;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FACESTREAM_CONFIG",
        "WS_URL",
        "FACES_DIR",
        "GALLERY_PATH",
        "FACE_MATCH_THRESHOLD",
        "SAVE_UNKNOWN_FACES",
        "UNKNOWN_FACE_CAP",
        "UNKNOWN_FACE_WINDOW_SECS",
        "PREPROCESS_GAMMA",
        "RECONNECT_INTERVAL_SECS",
        "RESOLUTION_RESEND_INTERVAL_SECS",
        "DEFAULT_FPS",
        "DEFAULT_RESOLUTION",
        "FACE_BACKEND",
        "DETECTOR_MODEL_PATH",
        "ENCODER_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamConfig::load().expect("load config");
    assert_eq!(cfg.ws_url, "ws://localhost:8080");
    assert_eq!(cfg.faces_dir, PathBuf::from("./resources/faces"));
    assert!(cfg.gallery_path.is_none());
    assert_eq!(cfg.matcher.threshold, 0.5);
    assert!(cfg.matcher.save_unknown);
    assert_eq!(cfg.matcher.unknown_cap, 10);
    assert_eq!(cfg.matcher.unknown_window, Duration::from_secs(60));
    assert_eq!(cfg.reconnect_interval, Duration::from_secs(5));
    assert_eq!(cfg.device.resend_interval, Duration::from_secs(5));
    assert_eq!(cfg.device.fps, 1);
    assert_eq!(cfg.device.resolution, Resolution::Qqvga);
    assert_eq!(cfg.backend.kind, BackendKind::Stub);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "ws_url": "ws://192.168.1.40:81",
        "faces_dir": "/var/lib/facestream/faces",
        "reconnect_interval_secs": 3,
        "matcher": {
            "threshold": 0.45,
            "save_unknown": false,
            "unknown_cap": 4
        },
        "device": {
            "fps": 5,
            "resolution": "240x240"
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("FACESTREAM_CONFIG", file.path());
    std::env::set_var("FACE_MATCH_THRESHOLD", "0.6");
    std::env::set_var("DEFAULT_RESOLUTION", "320x240");

    let cfg = StreamConfig::load().expect("load config");
    assert_eq!(cfg.ws_url, "ws://192.168.1.40:81");
    assert_eq!(cfg.faces_dir, PathBuf::from("/var/lib/facestream/faces"));
    assert_eq!(cfg.reconnect_interval, Duration::from_secs(3));
    assert_eq!(cfg.matcher.threshold, 0.6);
    assert!(!cfg.matcher.save_unknown);
    assert_eq!(cfg.matcher.unknown_cap, 4);
    assert_eq!(cfg.device.fps, 5);
    assert_eq!(cfg.device.resolution, Resolution::Qvga);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
ws_url = "ws://camera.local:81"
gallery_path = "gallery.json"

[device]
resolution = "176x144"
resend_interval_secs = 8

[backend]
kind = "tract"
detector_model = "models/detector.onnx"
encoder_model = "models/encoder.onnx"
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = StreamConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.ws_url, "ws://camera.local:81");
    assert_eq!(cfg.gallery_path, Some(PathBuf::from("gallery.json")));
    assert_eq!(cfg.device.resolution, Resolution::Qcif);
    assert_eq!(cfg.device.resend_interval, Duration::from_secs(8));
    assert_eq!(cfg.backend.kind, BackendKind::Tract);
    assert_eq!(
        cfg.backend.encoder_model,
        Some(PathBuf::from("models/encoder.onnx"))
    );
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("FACE_MATCH_THRESHOLD", "-0.1"),
        ("FACE_MATCH_THRESHOLD", "NaN"),
        ("UNKNOWN_FACE_CAP", "0"),
        ("RECONNECT_INTERVAL_SECS", "0"),
        ("RESOLUTION_RESEND_INTERVAL_SECS", "soon"),
        ("DEFAULT_RESOLUTION", "640x480"),
        ("WS_URL", "http://camera.local"),
        ("SAVE_UNKNOWN_FACES", "sometimes"),
        ("FACE_BACKEND", "opencv"),
        ("FACE_BACKEND", "tract"),
        ("PREPROCESS_GAMMA", "0"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(
            StreamConfig::load().is_err(),
            "{}={} should be rejected",
            key,
            value
        );
    }
    clear_env();
}

#[test]
fn unreadable_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACESTREAM_CONFIG", "/nonexistent/facestream.json");
    assert!(StreamConfig::load().is_err());
    clear_env();
}
