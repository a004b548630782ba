use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use facestream::ingest::codec::encode_jpeg;
use facestream::{
    Command, ConnectionState, CoordinatorSettings, FaceBox, FaceMatcher, Gallery, Identity,
    InMemorySink, Label, MemoryConnector, MemoryPeer, Resolution, StreamCoordinator, StubBackend,
    StubFace,
};

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn settings(reconnect_interval: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        url: "mem://esp32".to_string(),
        reconnect_interval,
        ..CoordinatorSettings::default()
    }
}

fn matcher(script: Vec<Vec<StubFace>>, sink: InMemorySink) -> FaceMatcher {
    let gallery = Gallery::from_identities(vec![
        Identity::new("alice", vec![0.0, 0.0]),
        Identity::new("bob", vec![1.0, 1.0]),
    ])
    .expect("gallery");
    FaceMatcher::new(gallery, Box::new(StubBackend::with_script(script)), Arc::new(sink))
}

fn coordinator(script: Vec<Vec<StubFace>>) -> (StreamCoordinator, MemoryPeer, InMemorySink) {
    let connector = MemoryConnector::new();
    let peer = connector.peer();
    let sink = InMemorySink::new();
    let coordinator = StreamCoordinator::new(
        settings(Duration::from_secs(60)),
        matcher(script, sink.clone()),
        Arc::new(connector),
    );
    (coordinator, peer, sink)
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))).expect("encode")
}

#[test]
fn start_before_connect_defers_start_stream() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);

    coordinator.start();
    assert!(coordinator.is_running());
    assert!(wait_for(|| peer.sent() == vec!["start_stream".to_string()]));
    assert_eq!(coordinator.connection_state(), ConnectionState::Connected);

    coordinator.shutdown();
}

#[test]
fn stop_then_start_while_connected_does_not_reconnect() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    coordinator.start();
    assert!(wait_for(|| peer.sent().len() == 1));
    peer.clear_sent();

    coordinator.stop();
    coordinator.start();
    assert_eq!(
        peer.sent(),
        vec!["stop_stream".to_string(), "start_stream".to_string()]
    );
    assert_eq!(peer.connect_count(), 1);

    coordinator.shutdown();
}

#[test]
fn repeated_start_and_stop_are_idempotent() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    coordinator.start();
    coordinator.start();
    assert!(wait_for(|| peer.sent().len() == 1));

    coordinator.stop();
    coordinator.stop();
    assert_eq!(
        peer.sent(),
        vec!["start_stream".to_string(), "stop_stream".to_string()]
    );
    assert_eq!(peer.connect_count(), 1);
    coordinator.shutdown();
}

#[test]
fn commands_are_dropped_while_disconnected() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    assert!(!coordinator.send_command(Command::StartStream));
    assert!(!coordinator.set_fps(5));
    assert!(peer.sent().is_empty());
    assert_eq!(peer.connect_count(), 0);
    // The requested setting is still remembered.
    assert_eq!(coordinator.device_fps(), 5);
}

#[test]
fn frames_are_decoded_matched_and_published() {
    let face = StubFace::new(FaceBox::new(2, 10, 10, 2), vec![0.1, 0.0]);
    let (coordinator, peer, sink) = coordinator(vec![vec![face], Vec::new()]);
    coordinator.start();
    assert!(wait_for(|| coordinator.connection_state() == ConnectionState::Connected));

    assert!(peer.push_binary(jpeg(40, 20)));
    assert!(wait_for(|| coordinator.latest_frame().is_some()));
    let frame = coordinator.latest_frame().expect("frame");
    assert_eq!((frame.width(), frame.height()), (20, 40));
    assert_eq!(frame.detections.len(), 1);
    assert_eq!(frame.detections[0].label, Label::Known("alice".into()));
    assert_eq!(frame.known_names(), vec!["alice"]);
    assert_eq!(coordinator.with_matcher(|m| m.streak("alice")), 1);
    assert!(sink.is_empty());

    std::thread::sleep(Duration::from_millis(1100));
    assert!(peer.push_binary(jpeg(40, 20)));
    assert!(wait_for(|| coordinator.frames_published() == 2));
    assert!(coordinator.fps() > 0.0);
    assert_eq!(coordinator.with_matcher(|m| m.streak("alice")), 0);

    coordinator.shutdown();
}

#[test]
fn undecodable_frames_are_skipped() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    coordinator.start();
    assert!(wait_for(|| coordinator.connection_state() == ConnectionState::Connected));

    assert!(peer.push_binary(vec![0x00, 0x01, 0x02]));
    assert!(peer.push_binary(jpeg(16, 16)));
    assert!(wait_for(|| coordinator.frames_published() == 1));
    assert_eq!(coordinator.latest_frame().expect("frame").sequence, 1);
    assert_eq!(coordinator.connection_state(), ConnectionState::Connected);

    coordinator.shutdown();
}

#[test]
fn capture_failures_resend_resolution_once_per_interval() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    coordinator.start();
    assert!(wait_for(|| peer.sent().len() == 1));

    assert!(peer.push_text("current_resolution:320x240"));
    assert!(wait_for(|| coordinator.resolution() == Resolution::Qvga));

    peer.push_text("error:frame_capture_failed");
    peer.push_text("error:frame_capture_failed");
    assert!(wait_for(|| peer.sent().len() == 2));
    // Give the second notification time to be handled.
    peer.push_text("from_esp32:marker");
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(
        peer.sent(),
        vec![
            "start_stream".to_string(),
            "SET_RESOLUTION:320x240".to_string()
        ]
    );
    coordinator.shutdown();
}

#[test]
fn device_reports_update_settings() {
    let (coordinator, peer, _) = coordinator(Vec::new());
    coordinator.start();
    assert!(wait_for(|| coordinator.connection_state() == ConnectionState::Connected));

    peer.push_text("current_fps:12");
    assert!(wait_for(|| coordinator.device_fps() == 12));

    assert!(coordinator.set_resolution(Resolution::Qcif));
    assert!(wait_for(|| peer
        .sent()
        .contains(&"SET_RESOLUTION:176x144".to_string())));

    // Out-of-range quality is clamped to the sensor maximum.
    assert!(coordinator.set_jpeg_quality(80));
    assert!(wait_for(|| peer
        .sent()
        .contains(&"SET_JPEG_QUALITY:63".to_string())));
    coordinator.shutdown();
}

#[test]
fn supervisor_restores_a_dropped_connection() {
    let connector = MemoryConnector::new();
    let peer = connector.peer();
    let coordinator = StreamCoordinator::new(
        settings(Duration::from_millis(50)),
        matcher(Vec::new(), InMemorySink::new()),
        Arc::new(connector),
    );
    coordinator.start();
    assert!(wait_for(|| coordinator.connection_state() == ConnectionState::Connected));

    peer.drop_connection();
    assert!(wait_for(|| peer.connect_count() >= 2));
    assert!(wait_for(|| coordinator.connection_state() == ConnectionState::Connected));

    coordinator.shutdown();
    assert!(!coordinator.is_running());
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn refused_connections_are_retried() {
    let connector = MemoryConnector::new();
    let peer = connector.peer();
    peer.set_refuse(true);
    let coordinator = StreamCoordinator::new(
        settings(Duration::from_millis(30)),
        matcher(Vec::new(), InMemorySink::new()),
        Arc::new(connector),
    );
    coordinator.start();
    assert!(wait_for(|| peer.connect_count() >= 2));
    assert!(peer.sent().is_empty());

    peer.set_refuse(false);
    assert!(wait_for(|| peer.sent() == vec!["start_stream".to_string()]));
    coordinator.shutdown();
}
